//! Threat feeds
//!
//! Scheduled HTTP(S) pulls of text/CSV/JSON indicator lists. Fetched content
//! is cached by URL hash with its ETag; indicators age out after the feed's
//! `age_max`. The shared `IndicatorSet` feeds the correlator's scoring, and
//! newly appearing indicators are announced as feed-indicator events.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::constants;
use crate::logic::events::{EventBus, EventKind, EventSeverity, SecurityEvent};

/// Cap on per-cycle indicator announcements; the rest only enter the set.
const ANNOUNCE_CAP: usize = 64;

// ============================================================================
// INDICATOR SET
// ============================================================================

/// Known-bad addresses with their last-seen-in-feed time.
#[derive(Default)]
pub struct IndicatorSet {
    inner: RwLock<HashMap<IpAddr, DateTime<Utc>>>,
}

impl IndicatorSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.inner.read().contains_key(ip)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Merge a feed's indicators; returns the addresses not seen before.
    pub fn merge(&self, indicators: &[IpAddr], now: DateTime<Utc>) -> Vec<IpAddr> {
        let mut inner = self.inner.write();
        let mut fresh = Vec::new();
        for ip in indicators {
            if inner.insert(*ip, now).is_none() {
                fresh.push(*ip);
            }
        }
        fresh
    }

    /// Drop indicators a feed has stopped vouching for.
    pub fn expire(&self, age_max: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now
            - chrono::Duration::from_std(age_max).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|_, seen| *seen >= cutoff);
        before - inner.len()
    }
}

// ============================================================================
// FEED SPEC / POLLER
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
    pub interval: Duration,
    pub age_max: Duration,
}

pub struct FeedPoller {
    spec: FeedSpec,
    cache_dir: PathBuf,
    bus: Arc<EventBus>,
    indicators: Arc<IndicatorSet>,
}

impl FeedPoller {
    pub fn new(
        spec: FeedSpec,
        cache_dir: PathBuf,
        bus: Arc<EventBus>,
        indicators: Arc<IndicatorSet>,
    ) -> Self {
        Self { spec, cache_dir, bus, indicators }
    }

    /// Poll on the configured interval until shutdown. A failed fetch skips
    /// the cycle; the cache carries us until `age_max`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!("feed {}: polling {} every {:?}", self.spec.name, self.spec.url, self.spec.interval);
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.spec.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn poll_once(&self) {
        let spec = self.spec.clone();
        let cache_dir = self.cache_dir.clone();
        let fetched =
            tokio::task::spawn_blocking(move || fetch_with_cache(&spec, &cache_dir)).await;

        let now = Utc::now();
        match fetched {
            Ok(Ok(content)) => {
                let parsed = parse_indicators(&content);
                let fresh = self.indicators.merge(&parsed, now);
                let expired = self.indicators.expire(self.spec.age_max, now);
                log::info!(
                    "feed {}: {} indicators ({} new, {} expired)",
                    self.spec.name,
                    parsed.len(),
                    fresh.len(),
                    expired
                );
                for ip in fresh.iter().take(ANNOUNCE_CAP) {
                    self.bus.publish(
                        SecurityEvent::new(
                            format!("feed:{}", self.spec.name),
                            EventKind::FeedIndicator,
                            EventSeverity::High,
                            format!("indicator {} listed by {}", ip, self.spec.name),
                        )
                        .with_source_ip(*ip),
                    );
                }
                if fresh.len() > ANNOUNCE_CAP {
                    self.bus.publish(SecurityEvent::new(
                        format!("feed:{}", self.spec.name),
                        EventKind::RateAnomaly,
                        EventSeverity::Low,
                        format!(
                            "{} further new indicators merged without announcement",
                            fresh.len() - ANNOUNCE_CAP
                        ),
                    ));
                }
            }
            Ok(Err(err)) => {
                log::warn!("feed {}: fetch failed, skipping cycle: {}", self.spec.name, err);
                let dropped = self.indicators.expire(self.spec.age_max, now);
                if dropped > 0 {
                    log::warn!(
                        "feed {}: {} stale indicators discarded past age_max",
                        self.spec.name,
                        dropped
                    );
                }
            }
            Err(join_err) => log::error!("feed {}: task failed: {}", self.spec.name, join_err),
        }
    }
}

// ============================================================================
// FETCH + CACHE
// ============================================================================

fn cache_paths(cache_dir: &std::path::Path, url: &str) -> (PathBuf, PathBuf) {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex_string(&hasher.finalize());
    (
        cache_dir.join(format!("{}.body", digest)),
        cache_dir.join(format!("{}.etag", digest)),
    )
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// GET with If-None-Match against the cached ETag. 304 serves the cache.
fn fetch_with_cache(spec: &FeedSpec, cache_dir: &std::path::Path) -> Result<String, String> {
    std::fs::create_dir_all(cache_dir).map_err(|e| e.to_string())?;
    let (body_path, etag_path) = cache_paths(cache_dir, &spec.url);

    let mut request = ureq::get(&spec.url).timeout(constants::FEED_FETCH_TIMEOUT);
    if let Ok(etag) = std::fs::read_to_string(&etag_path) {
        request = request.set("If-None-Match", etag.trim());
    }

    match request.call() {
        Ok(response) => {
            if response.status() == 304 {
                return std::fs::read_to_string(&body_path).map_err(|e| e.to_string());
            }
            let etag = response.header("etag").map(str::to_string);
            let body = response.into_string().map_err(|e| e.to_string())?;
            std::fs::write(&body_path, &body).map_err(|e| e.to_string())?;
            if let Some(etag) = etag {
                let _ = std::fs::write(&etag_path, etag);
            }
            Ok(body)
        }
        Err(ureq::Error::Status(304, _)) => {
            std::fs::read_to_string(&body_path).map_err(|e| e.to_string())
        }
        Err(err) => Err(err.to_string()),
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Text (one per line), CSV (first column), or a JSON string array.
pub fn parse_indicators(content: &str) -> Vec<IpAddr> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        if let Ok(values) = serde_json::from_str::<Vec<String>>(trimmed) {
            return values
                .iter()
                .filter_map(|v| IpAddr::from_str(v.trim()).ok())
                .collect();
        }
    }

    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let first = line.split([',', ';', '\t']).next().unwrap_or(line).trim();
        if let Ok(ip) = IpAddr::from_str(first) {
            out.push(ip);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_commented_text() {
        let content = "# malicious hosts\n203.0.113.7\n\n198.51.100.9\nnot-an-ip\n";
        let parsed = parse_indicators(content);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn parses_csv_first_column() {
        let content = "192.0.2.1,botnet,2026-07-01\n192.0.2.2;scanner\n";
        let parsed = parse_indicators(content);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn parses_json_arrays() {
        let content = r#"["203.0.113.7", "garbage", "2001:db8::1"]"#;
        let parsed = parse_indicators(content);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn merge_reports_only_fresh_indicators() {
        let set = IndicatorSet::new();
        let now = Utc::now();
        let a: IpAddr = "203.0.113.7".parse().unwrap();
        let b: IpAddr = "198.51.100.9".parse().unwrap();
        assert_eq!(set.merge(&[a, b], now).len(), 2);
        assert_eq!(set.merge(&[a], now).len(), 0);
        assert!(set.contains(&a));
    }

    #[test]
    fn indicators_age_out() {
        let set = IndicatorSet::new();
        let old = Utc::now() - chrono::Duration::hours(48);
        let a: IpAddr = "203.0.113.7".parse().unwrap();
        set.merge(&[a], old);
        let dropped = set.expire(Duration::from_secs(86_400), Utc::now());
        assert_eq!(dropped, 1);
        assert!(!set.contains(&a));
    }

    #[test]
    fn cache_paths_are_url_addressed() {
        let dir = std::path::Path::new("/tmp/cache");
        let (a_body, _) = cache_paths(dir, "https://feeds.example/a.txt");
        let (b_body, _) = cache_paths(dir, "https://feeds.example/b.txt");
        assert_ne!(a_body, b_body);
        assert!(a_body.to_string_lossy().ends_with(".body"));
    }
}

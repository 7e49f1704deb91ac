//! Threat Correlator
//!
//! Single consumer over the event stream: maintains decayed evidence windows
//! per (subject, kind), escalates scored assessments, and collapses into
//! aggregation mode under flood so the autonomy controller only ever sees a
//! bounded stream. Events carrying a causal tag are the daemon's own side
//! effects and are never re-scored.

pub mod types;
pub mod window;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::constants;
use crate::logic::events::{EventBus, EventKind, EventSeverity, SecurityEvent};
use crate::logic::intel::IndicatorSet;
use crate::logic::translator::TranslatorClient;

pub use types::{Recommendation, ThreatAssessment, ThreatKind};
pub use window::DecayWindow;

fn host_net(ip: IpAddr) -> IpNetwork {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, prefix).expect("host prefix")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Normal,
    /// Per-subject counters only; entered under event flood
    Aggregation,
}

pub struct Correlator {
    windows: HashMap<(IpAddr, ThreatKind), DecayWindow>,
    cooldowns: HashMap<IpAddr, DateTime<Utc>>,
    /// Arrival timestamps for flood detection (trailing second)
    arrivals: VecDeque<DateTime<Utc>>,
    mode: ProcessingMode,
    mode_since: DateTime<Utc>,
    /// Aggregation-mode counters
    aggregates: HashMap<IpAddr, u64>,
    bus: Arc<EventBus>,
    translator: Option<Arc<TranslatorClient>>,
    indicators: Option<Arc<IndicatorSet>>,
}

impl Correlator {
    pub fn new(bus: Arc<EventBus>, translator: Option<Arc<TranslatorClient>>) -> Self {
        Self {
            windows: HashMap::new(),
            cooldowns: HashMap::new(),
            arrivals: VecDeque::new(),
            mode: ProcessingMode::Normal,
            mode_since: Utc::now(),
            aggregates: HashMap::new(),
            bus,
            translator,
            indicators: None,
        }
    }

    /// Attach the threat-feed indicator set; presence there boosts scores.
    pub fn with_indicators(mut self, indicators: Arc<IndicatorSet>) -> Self {
        self.indicators = Some(indicators);
        self
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Consume the event stream until shutdown, forwarding assessments.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<SecurityEvent>,
        out: mpsc::Sender<ThreatAssessment>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("correlator started");
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(event) = maybe else { break };
                    if let Some(assessment) = self.ingest(&event, Utc::now()) {
                        let assessment = self.maybe_slow_path(assessment).await;
                        if let Some(assessment) = assessment {
                            if out.send(assessment).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("correlator stopped");
    }

    /// Deterministic fast path. Pure over (event, now) given current state,
    /// which keeps scoring reproducible in tests.
    pub fn ingest(
        &mut self,
        event: &SecurityEvent,
        now: DateTime<Utc>,
    ) -> Option<ThreatAssessment> {
        // our own side effects never re-score their subject
        if event.causal_tag.is_some() {
            return None;
        }
        let kind = match threat_kind_for(event.kind) {
            Some(kind) => kind,
            None => return None,
        };
        let subject = event.source_ip?;

        self.track_arrival(now);
        self.update_mode(now);

        if self.mode == ProcessingMode::Aggregation {
            return self.ingest_aggregated(subject, kind, event, now);
        }

        let window = self
            .windows
            .entry((subject, kind))
            .or_insert_with(|| DecayWindow::new(now));
        window.observe(event, now);

        let weight = window.decayed_weight(now);
        let mut score = score_for(kind, weight, window.ports.len(), window.sources.len());
        // feed presence corroborates whatever else the subject is doing
        if let Some(indicators) = &self.indicators {
            if indicators.contains(&subject) {
                score = (score + 0.2).min(1.0);
            }
        }
        if score < constants::ESCALATION_SCORE && !self.slow_path_band(score) {
            return None;
        }
        if self.in_cooldown(subject, now) {
            return None;
        }

        let window = self.windows.get(&(subject, kind)).expect("window exists");
        let assessment = ThreatAssessment {
            id: Uuid::new_v4(),
            kind,
            subject: host_net(subject),
            score,
            evidence: window.evidence.clone(),
            event_count: weight.round() as u64,
            distinct_sources: window.sources.len(),
            ports: window.ports.iter().copied().collect(),
            recommendation: recommend(kind, score),
            expires_suggestion: kind.block_ttl(),
            templated_rule: None,
            created_at: now,
        };

        if score >= constants::ESCALATION_SCORE {
            // window stays: if the consumer holds back, further evidence
            // re-escalates with a higher count after the interval
            self.set_cooldown(subject, now);
        }
        Some(assessment)
    }

    fn ingest_aggregated(
        &mut self,
        subject: IpAddr,
        kind: ThreatKind,
        _event: &SecurityEvent,
        now: DateTime<Utc>,
    ) -> Option<ThreatAssessment> {
        let counter = self.aggregates.entry(subject).or_insert(0);
        *counter += 1;
        let count = *counter;
        // only the aggregate crosses over, and far less often
        if (count as f64) < kind.threshold() * 5.0 {
            return None;
        }
        if self.in_cooldown(subject, now) {
            return None;
        }
        self.aggregates.remove(&subject);
        self.set_cooldown(subject, now);
        Some(ThreatAssessment {
            id: Uuid::new_v4(),
            kind,
            subject: host_net(subject),
            score: 1.0,
            evidence: Vec::new(),
            event_count: count,
            distinct_sources: 1,
            ports: Vec::new(),
            recommendation: recommend(kind, 1.0),
            expires_suggestion: kind.block_ttl(),
            templated_rule: None,
            created_at: now,
        })
    }

    // ------------------------------------------------------------------
    // flood handling
    // ------------------------------------------------------------------

    fn track_arrival(&mut self, now: DateTime<Utc>) {
        self.arrivals.push_back(now);
        let cutoff = now - ChronoDuration::seconds(1);
        while self.arrivals.front().map(|t| *t < cutoff).unwrap_or(false) {
            self.arrivals.pop_front();
        }
    }

    fn update_mode(&mut self, now: DateTime<Utc>) {
        let rate = self.arrivals.len() as f64;
        let dwell = now - self.mode_since;
        match self.mode {
            ProcessingMode::Normal if rate > constants::FLOOD_CEILING_EPS => {
                self.mode = ProcessingMode::Aggregation;
                self.mode_since = now;
                log::warn!("correlator entering aggregation mode ({} ev/s)", rate);
                self.announce_mode("aggregation");
            }
            // hysteresis: leave only after the rate has stayed low a while
            ProcessingMode::Aggregation
                if rate < constants::FLOOD_CEILING_EPS / 2.0
                    && dwell > ChronoDuration::seconds(5) =>
            {
                self.mode = ProcessingMode::Normal;
                self.mode_since = now;
                self.aggregates.clear();
                log::info!("correlator back to normal mode");
                self.announce_mode("normal");
            }
            _ => {}
        }
    }

    fn announce_mode(&self, mode: &str) {
        self.bus.publish(SecurityEvent::new(
            "correlator",
            EventKind::ModeSwitch,
            EventSeverity::High,
            format!("correlator switched to {} mode", mode),
        ));
    }

    // ------------------------------------------------------------------
    // cooldown / slow path
    // ------------------------------------------------------------------

    fn in_cooldown(&self, subject: IpAddr, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(&subject)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    fn set_cooldown(&mut self, subject: IpAddr, now: DateTime<Utc>) {
        let until = now
            + ChronoDuration::from_std(constants::REASSESS_INTERVAL)
                .unwrap_or_else(|_| ChronoDuration::seconds(10));
        self.cooldowns.insert(subject, until);
        self.cooldowns.retain(|_, u| *u > now);
    }

    fn slow_path_band(&self, score: f64) -> bool {
        self.translator.is_some()
            && score >= constants::SLOW_PATH_FLOOR
            && score < constants::ESCALATION_SCORE
    }

    /// Ambiguous scores may consult the external classifier; any failure
    /// degrades silently to the fast path.
    async fn maybe_slow_path(&mut self, assessment: ThreatAssessment) -> Option<ThreatAssessment> {
        if assessment.score >= constants::ESCALATION_SCORE {
            return Some(assessment);
        }
        let translator = self.translator.clone()?;
        let for_call = assessment.clone();
        let confirmed = tokio::task::spawn_blocking(move || translator.classify(&for_call))
            .await
            .ok()
            .flatten();
        match confirmed {
            Some(kind) if kind == assessment.kind => {
                self.set_cooldown(assessment.subject.ip(), Utc::now());
                Some(ThreatAssessment { score: constants::ESCALATION_SCORE, ..assessment })
            }
            _ => None,
        }
    }
}

fn threat_kind_for(kind: EventKind) -> Option<ThreatKind> {
    match kind {
        EventKind::AuthFail => Some(ThreatKind::BruteForce),
        EventKind::PortScanHit => Some(ThreatKind::PortScan),
        EventKind::RateAnomaly => Some(ThreatKind::RateSpike),
        EventKind::FeedIndicator => Some(ThreatKind::FeedHit),
        EventKind::SourceError | EventKind::EventsDropped | EventKind::ModeSwitch => None,
    }
}

fn score_for(kind: ThreatKind, weight: f64, distinct_ports: usize, distinct_sources: usize) -> f64 {
    let base = match kind {
        // scans are judged on breadth, not raw volume
        ThreatKind::PortScan => distinct_ports as f64 / kind.threshold(),
        _ => weight / kind.threshold(),
    };
    let diversity_bonus = if distinct_sources > 1 { 0.1 } else { 0.0 };
    (base.min(1.0) * 0.9 + diversity_bonus).min(1.0)
}

fn recommend(kind: ThreatKind, score: f64) -> Recommendation {
    match kind {
        ThreatKind::RateSpike => Recommendation::RateLimit,
        _ if score >= constants::ESCALATION_SCORE => Recommendation::BlockSubject,
        _ => Recommendation::AlertOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> Correlator {
        Correlator::new(Arc::new(EventBus::new()), None)
    }

    fn auth_fail(ip: &str) -> SecurityEvent {
        SecurityEvent::new("sshd", EventKind::AuthFail, EventSeverity::Medium, "fail")
            .with_source_ip(ip.parse().unwrap())
            .with_target("sshd:root")
    }

    fn scan_hit(ip: &str, port: u16) -> SecurityEvent {
        SecurityEvent::new("kernel", EventKind::PortScanHit, EventSeverity::Low, "hit")
            .with_source_ip(ip.parse().unwrap())
            .with_target(format!("dport:{}", port))
    }

    #[test]
    fn ssh_brute_force_escalates_once() {
        let mut c = correlator();
        let now = Utc::now();
        let mut assessments = Vec::new();
        for _ in 0..60 {
            if let Some(a) = c.ingest(&auth_fail("203.0.113.7"), now) {
                assessments.push(a);
            }
        }
        assert_eq!(assessments.len(), 1, "cooldown suppresses repeats");
        let a = &assessments[0];
        assert_eq!(a.kind, ThreatKind::BruteForce);
        assert_eq!(a.subject.to_string(), "203.0.113.7/32");
        assert!(a.score >= constants::ESCALATION_SCORE);
        assert_eq!(a.recommendation, Recommendation::BlockSubject);
    }

    #[test]
    fn sustained_burst_re_escalates_with_growing_evidence() {
        let mut c = correlator();
        let start = Utc::now();
        let mut assessments = Vec::new();
        // one failure per second for a minute
        for i in 0..60 {
            let now = start + ChronoDuration::seconds(i);
            if let Some(a) = c.ingest(&auth_fail("203.0.113.7"), now) {
                assessments.push(a);
            }
        }
        assert!(assessments.len() >= 3, "re-assessment after the interval");
        let first = &assessments[0];
        let last = assessments.last().unwrap();
        assert!(last.event_count > first.event_count);
        // enough corroboration for a cautious responder by the end
        assert!(last.event_count as f64 >= ThreatKind::BruteForce.threshold() * 3.0);
    }

    #[test]
    fn port_scan_needs_distinct_ports() {
        let mut c = correlator();
        let now = Utc::now();
        // many hits on one port is not a scan
        for _ in 0..40 {
            assert!(c.ingest(&scan_hit("198.51.100.9", 22), now).is_none());
        }
        let mut c = correlator();
        let mut escalated = None;
        for port in 0..40u16 {
            if let Some(a) = c.ingest(&scan_hit("198.51.100.9", 1000 + port), now) {
                escalated = Some(a);
                break;
            }
        }
        let a = escalated.expect("distinct ports escalate");
        assert_eq!(a.kind, ThreatKind::PortScan);
        assert!(!a.ports.is_empty());
    }

    #[test]
    fn causally_tagged_events_are_ignored() {
        let mut c = correlator();
        let now = Utc::now();
        for _ in 0..100 {
            let mut event = auth_fail("198.51.100.9");
            event.causal_tag = Some(Uuid::new_v4());
            assert!(c.ingest(&event, now).is_none());
        }
        assert!(c.windows.is_empty());
    }

    #[test]
    fn feed_hit_escalates_immediately() {
        let mut c = correlator();
        let now = Utc::now();
        let event =
            SecurityEvent::new("feed", EventKind::FeedIndicator, EventSeverity::High, "ioc")
                .with_source_ip("192.0.2.66".parse().unwrap());
        let a = c.ingest(&event, now).expect("feed hits escalate on sight");
        assert_eq!(a.kind, ThreatKind::FeedHit);
    }

    #[test]
    fn feed_presence_boosts_scores() {
        let indicators = IndicatorSet::new();
        indicators.merge(&["203.0.113.7".parse().unwrap()], Utc::now());
        let mut listed =
            Correlator::new(Arc::new(EventBus::new()), None).with_indicators(indicators);
        let mut unlisted = correlator();

        let now = Utc::now();
        let mut listed_escalated_at = None;
        let mut unlisted_escalated_at = None;
        for i in 1..=20u32 {
            if listed_escalated_at.is_none()
                && listed.ingest(&auth_fail("203.0.113.7"), now).is_some()
            {
                listed_escalated_at = Some(i);
            }
            if unlisted_escalated_at.is_none()
                && unlisted.ingest(&auth_fail("203.0.113.7"), now).is_some()
            {
                unlisted_escalated_at = Some(i);
            }
        }
        assert!(listed_escalated_at.unwrap() < unlisted_escalated_at.unwrap());
    }

    #[test]
    fn flood_switches_to_aggregation_and_announces() {
        let bus = Arc::new(EventBus::new());
        let mut c = Correlator::new(bus.clone(), None);
        let now = Utc::now();
        // distinct subjects so no single window escalates first
        let mut i = 0u32;
        while c.mode() == ProcessingMode::Normal && i < 500 {
            let ip = format!("10.{}.{}.{}", i / 65536 % 256, i / 256 % 256, i % 256);
            let _ = c.ingest(&auth_fail(&ip), now);
            i += 1;
        }
        assert_eq!(c.mode(), ProcessingMode::Aggregation);
        let announced = bus.drain_now();
        assert!(announced.iter().any(|e| e.kind == EventKind::ModeSwitch));
    }

    #[test]
    fn aggregation_mode_emits_only_aggregates() {
        let mut c = correlator();
        c.mode = ProcessingMode::Aggregation;
        let now = Utc::now();
        let mut emitted = Vec::new();
        for _ in 0..(constants::BRUTE_FORCE_THRESHOLD * 5 + 1) {
            if let Some(a) = c.ingest(&auth_fail("203.0.113.50"), now) {
                emitted.push(a);
            }
        }
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].event_count >= constants::BRUTE_FORCE_THRESHOLD as u64 * 5);
    }
}

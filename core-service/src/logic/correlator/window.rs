//! Sliding evidence windows
//!
//! Per (subject, kind): an exponentially-decayed count plus the distinct
//! ports, targets and sources seen recently. Decay makes a burst of sixty
//! failures in a minute score far higher than sixty spread over a day
//! without keeping every timestamp around.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::constants;
use crate::logic::events::SecurityEvent;

const EVIDENCE_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct DecayWindow {
    weight: f64,
    last_seen: DateTime<Utc>,
    pub evidence: Vec<Uuid>,
    pub sources: HashSet<String>,
    pub ports: HashSet<u16>,
}

impl DecayWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            weight: 0.0,
            last_seen: now,
            evidence: Vec::new(),
            sources: HashSet::new(),
            ports: HashSet::new(),
        }
    }

    /// Fold one event in, decaying the accumulated weight first.
    pub fn observe(&mut self, event: &SecurityEvent, now: DateTime<Utc>) {
        self.decay_to(now);
        self.weight += 1.0;
        self.last_seen = now;
        if self.evidence.len() < EVIDENCE_CAP {
            self.evidence.push(event.id);
        }
        self.sources.insert(event.source_name.clone());
        if let Some(port) = event
            .target
            .as_deref()
            .and_then(|t| t.strip_prefix("dport:"))
            .and_then(|p| p.parse::<u16>().ok())
        {
            self.ports.insert(port);
        }
    }

    fn decay_to(&mut self, now: DateTime<Utc>) {
        let dt = (now - self.last_seen).num_milliseconds().max(0) as f64 / 1000.0;
        let half_life = constants::DECAY_HALF_LIFE.as_secs_f64();
        self.weight *= 0.5_f64.powf(dt / half_life);
    }

    pub fn decayed_weight(&self, now: DateTime<Utc>) -> f64 {
        let mut copy = self.clone();
        copy.decay_to(now);
        copy.weight
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.decayed_weight(now) < 0.05
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::events::{EventKind, EventSeverity};

    fn event() -> SecurityEvent {
        SecurityEvent::new("sshd", EventKind::AuthFail, EventSeverity::Medium, "x")
    }

    #[test]
    fn burst_accumulates_nearly_linearly() {
        let now = Utc::now();
        let mut window = DecayWindow::new(now);
        for _ in 0..60 {
            window.observe(&event(), now);
        }
        assert!(window.decayed_weight(now) > 59.0);
    }

    #[test]
    fn old_evidence_decays_away() {
        let start = Utc::now();
        let mut window = DecayWindow::new(start);
        window.observe(&event(), start);
        let much_later = start + chrono::Duration::minutes(30);
        assert!(window.decayed_weight(much_later) < 0.01);
        assert!(window.is_stale(much_later));
    }

    #[test]
    fn distinct_ports_tracked_from_targets() {
        let now = Utc::now();
        let mut window = DecayWindow::new(now);
        for port in [22, 23, 80, 22] {
            let e = event().with_target(format!("dport:{}", port));
            window.observe(&e, now);
        }
        assert_eq!(window.ports.len(), 3);
    }
}

//! Correlator output types

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants;
use crate::logic::policy::PolicyRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatKind {
    BruteForce,
    PortScan,
    RateSpike,
    FeedHit,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::BruteForce => "brute-force",
            ThreatKind::PortScan => "port-scan",
            ThreatKind::RateSpike => "rate-spike",
            ThreatKind::FeedHit => "feed-hit",
        }
    }

    /// Decayed evidence weight needed before escalation.
    pub fn threshold(&self) -> f64 {
        match self {
            ThreatKind::BruteForce => constants::BRUTE_FORCE_THRESHOLD as f64,
            ThreatKind::PortScan => constants::PORT_SCAN_THRESHOLD as f64,
            ThreatKind::RateSpike => 5.0,
            ThreatKind::FeedHit => 1.0,
        }
    }

    /// How long an autonomous block of this kind should live.
    pub fn block_ttl(&self) -> std::time::Duration {
        match self {
            ThreatKind::BruteForce => constants::TTL_BRUTE_FORCE,
            ThreatKind::PortScan => constants::TTL_PORT_SCAN,
            ThreatKind::RateSpike => constants::TTL_RATE_ANOMALY,
            ThreatKind::FeedHit => constants::TTL_FEED_INDICATOR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    BlockSubject,
    RateLimit,
    AlertOnly,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::BlockSubject => "block-subject",
            Recommendation::RateLimit => "rate-limit",
            Recommendation::AlertOnly => "alert-only",
        }
    }
}

/// Scored conclusion over an evidence window for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub id: Uuid,
    pub kind: ThreatKind,
    pub subject: IpNetwork,
    /// 0..1
    pub score: f64,
    /// Event ids in the evidence window
    pub evidence: Vec<Uuid>,
    pub event_count: u64,
    pub distinct_sources: usize,
    /// Destination ports seen (scan evidence)
    pub ports: Vec<u16>,
    pub recommendation: Recommendation,
    pub expires_suggestion: std::time::Duration,
    /// Deterministically templated block rule; filled by the autonomy
    /// controller, never by free-form generation
    #[serde(default)]
    pub templated_rule: Option<PolicyRule>,
    pub created_at: DateTime<Utc>,
}

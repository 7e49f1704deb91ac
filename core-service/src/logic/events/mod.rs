//! Security Events
//!
//! Immutable event records flowing from log sources and feeds through the
//! bus to the correlator, the store, and live subscribers.

pub mod bus;
pub mod sources;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::EventBus;

// ============================================================================
// SEVERITY / KIND
// ============================================================================

/// Ordered so the bus can find the lowest-severity tail to shed first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Low => "low",
            EventSeverity::Medium => "medium",
            EventSeverity::High => "high",
            EventSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Failed authentication attempt (sshd and friends)
    AuthFail,
    /// A packet hit a firewall log rule
    PortScanHit,
    /// Abnormal request/traffic rate
    RateAnomaly,
    /// Subject appeared in a threat intelligence feed
    FeedIndicator,
    /// A log source failed and was restarted
    SourceError,
    /// The bus shed queued events under backpressure
    EventsDropped,
    /// The correlator switched processing mode
    ModeSwitch,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AuthFail => "auth-fail",
            EventKind::PortScanHit => "port-scan-hit",
            EventKind::RateAnomaly => "rate-anomaly",
            EventKind::FeedIndicator => "feed-indicator",
            EventKind::SourceError => "source-error",
            EventKind::EventsDropped => "events-dropped",
            EventKind::ModeSwitch => "mode-switch",
        }
    }
}

// ============================================================================
// SECURITY EVENT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub source_name: String,
    pub kind: EventKind,
    pub severity: EventSeverity,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    #[serde(default)]
    pub target: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// Deployment whose effect plausibly produced this event; breaks the
    /// autonomy feedback loop
    #[serde(default)]
    pub causal_tag: Option<Uuid>,
    /// Opaque original payload (log line, feed row)
    pub raw: String,
}

impl SecurityEvent {
    pub fn new(
        source_name: impl Into<String>,
        kind: EventKind,
        severity: EventSeverity,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.into(),
            kind,
            severity,
            source_ip: None,
            target: None,
            observed_at: Utc::now(),
            causal_tag: None,
            raw: raw.into(),
        }
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

// ============================================================================
// SUBSCRIBER STREAM ITEMS
// ============================================================================

/// What live subscribers receive: raw security events interleaved with
/// lifecycle notifications from the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "stream")]
pub enum StreamItem {
    Event(SecurityEvent),
    Lifecycle(LifecycleNotice),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleNotice {
    pub kind: String,
    pub entity_id: Uuid,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl LifecycleNotice {
    pub fn new(kind: impl Into<String>, entity_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            entity_id,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

//! Policy Types
//!
//! Backend-neutral rule representation. No rendering logic here: turning a
//! `PolicyRule` into backend text is the active adapter's job.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ENUMS
// ============================================================================

/// Address family a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ipv4,
    Ipv6,
    Both,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
            Family::Both => "both",
        }
    }

    pub fn admits(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (Family::Ipv4, IpAddr::V4(_)) => true,
            (Family::Ipv6, IpAddr::V6(_)) => true,
            (Family::Both, _) => true,
            _ => false,
        }
    }
}

/// Traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
            Direction::Forward => "forward",
        }
    }
}

/// What to do with matching packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Drop,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Accept => "accept",
            Action::Drop => "drop",
            Action::Reject => "reject",
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Action::Drop | Action::Reject)
    }
}

/// Transport match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Any => "any",
        }
    }

    /// Case-folded parse; anything unknown maps to None.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "icmp" | "icmpv6" => Some(Protocol::Icmp),
            "any" | "all" => Some(Protocol::Any),
            _ => None,
        }
    }

    pub fn carries_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Where a rule came from; gates what it is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    User,
    DaemonAuto,
    DaemonPropose,
    Imported,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::User => "user",
            Origin::DaemonAuto => "daemon-auto",
            Origin::DaemonPropose => "daemon-propose",
            Origin::Imported => "imported",
        }
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self, Origin::DaemonAuto | Origin::DaemonPropose)
    }
}

// ============================================================================
// MATCH FIELDS
// ============================================================================

/// An address match: a concrete network or a named set the backend resolves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum AddrSpec {
    Network(IpNetwork),
    Set(String),
}

impl AddrSpec {
    /// Bare addresses are widened to host networks (/32, /128).
    pub fn host(addr: IpAddr) -> Self {
        let net = match addr {
            IpAddr::V4(v4) => IpNetwork::new(IpAddr::V4(v4), 32),
            IpAddr::V6(v6) => IpNetwork::new(IpAddr::V6(v6), 128),
        };
        // host prefix lengths are always valid for their family
        AddrSpec::Network(net.expect("host prefix"))
    }

    pub fn network(&self) -> Option<&IpNetwork> {
        match self {
            AddrSpec::Network(net) => Some(net),
            AddrSpec::Set(_) => None,
        }
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrSpec::Network(net) => write!(f, "{}", net),
            AddrSpec::Set(name) => write!(f, "@{}", name),
        }
    }
}

/// Port match. Range and list are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
    List(Vec<u16>),
}

impl PortSpec {
    /// Sorted, deduplicated, degenerate forms collapsed.
    pub fn canonical(&self) -> PortSpec {
        match self {
            PortSpec::Single(p) => PortSpec::Single(*p),
            PortSpec::Range(a, b) if a == b => PortSpec::Single(*a),
            PortSpec::Range(a, b) => PortSpec::Range(*a, *b),
            PortSpec::List(ports) => {
                let mut sorted = ports.clone();
                sorted.sort_unstable();
                sorted.dedup();
                if sorted.len() == 1 {
                    PortSpec::Single(sorted[0])
                } else {
                    PortSpec::List(sorted)
                }
            }
        }
    }

    /// The closed intervals this spec covers, for set algebra.
    pub fn intervals(&self) -> Vec<(u16, u16)> {
        match self {
            PortSpec::Single(p) => vec![(*p, *p)],
            PortSpec::Range(a, b) => vec![(*a, *b)],
            PortSpec::List(ports) => ports.iter().map(|p| (*p, *p)).collect(),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{}", p),
            PortSpec::Range(a, b) => write!(f, "{}-{}", a, b),
            PortSpec::List(ports) => {
                let joined: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

/// Token-bucket style rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub count: u32,
    pub per_secs: u32,
}

// ============================================================================
// POLICY RULE
// ============================================================================

/// One backend-neutral firewall intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: Uuid,
    pub family: Family,
    pub direction: Direction,
    pub action: Action,
    #[serde(default)]
    pub source: Option<AddrSpec>,
    #[serde(default)]
    pub destination: Option<AddrSpec>,
    pub protocol: Protocol,
    #[serde(default)]
    pub source_port: Option<PortSpec>,
    #[serde(default)]
    pub destination_port: Option<PortSpec>,
    pub stateful: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub origin: Origin,
    #[serde(default)]
    pub comment: Option<String>,
}

impl PolicyRule {
    /// A fresh rule with the model's defaults. `stateful` defaults to true
    /// for accept actions, false otherwise.
    pub fn new(direction: Direction, action: Action, origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            family: Family::Both,
            direction,
            action,
            source: None,
            destination: None,
            protocol: Protocol::Any,
            source_port: None,
            destination_port: None,
            stateful: matches!(action, Action::Accept),
            rate_limit: None,
            log: false,
            priority: 0,
            expires_at: None,
            origin,
            comment: None,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Short human summary for logs and audit detail fields.
    pub fn summary(&self) -> String {
        let mut parts = vec![
            self.direction.as_str().to_string(),
            self.action.as_str().to_string(),
        ];
        if let Some(src) = &self.source {
            parts.push(format!("src={}", src));
        }
        if let Some(dst) = &self.destination {
            parts.push(format!("dst={}", dst));
        }
        if self.protocol != Protocol::Any {
            parts.push(self.protocol.as_str().to_string());
        }
        if let Some(dport) = &self.destination_port {
            parts.push(format!("dport={}", dport));
        }
        parts.join(" ")
    }
}

// ============================================================================
// RENDERED FORMS
// ============================================================================

/// Backend-specific text of one rule. Opaque outside the producing adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedRule {
    pub backend_name: String,
    pub text: String,
    /// The neutral rule id, when known (embedded in the rendered comment)
    #[serde(default)]
    pub rule_id: Option<Uuid>,
}

/// A complete ruleset image ready for atomic load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetImage {
    pub backend_name: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stateful_defaults_follow_action() {
        let accept = PolicyRule::new(Direction::Input, Action::Accept, Origin::User);
        assert!(accept.stateful);
        let drop = PolicyRule::new(Direction::Input, Action::Drop, Origin::DaemonAuto);
        assert!(!drop.stateful);
    }

    #[test]
    fn port_list_canonicalization_sorts_and_collapses() {
        let spec = PortSpec::List(vec![443, 80, 443]);
        assert_eq!(spec.canonical(), PortSpec::List(vec![80, 443]));
        assert_eq!(PortSpec::List(vec![22, 22]).canonical(), PortSpec::Single(22));
        assert_eq!(PortSpec::Range(53, 53).canonical(), PortSpec::Single(53));
    }

    #[test]
    fn host_addr_spec_widens_to_host_network() {
        let spec = AddrSpec::host("203.0.113.7".parse().unwrap());
        assert_eq!(spec.to_string(), "203.0.113.7/32");
    }

    #[test]
    fn expiry_is_inclusive_at_the_boundary() {
        let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::DaemonAuto);
        let now = Utc::now();
        rule.expires_at = Some(now);
        assert!(rule.expired(now));
    }
}

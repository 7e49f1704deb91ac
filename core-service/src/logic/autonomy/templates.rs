//! Deterministic response templates
//!
//! Autonomous rule bodies come from these templates and nowhere else: no
//! free-form generation ever reaches the deployment path. Templates are
//! keyed by threat kind, always drop, always narrow, always expire.

use chrono::{Duration as ChronoDuration, Utc};

use crate::logic::correlator::{ThreatAssessment, ThreatKind};
use crate::logic::policy::{
    Action, AddrSpec, Direction, Family, Origin, PolicyRule, PortSpec, Protocol,
};

/// Autonomous blocks evaluate ahead of ordinary rules.
const AUTO_PRIORITY: i32 = -10;

/// SSH is what the brute-force evidence path watches.
const SSH_PORT: u16 = 22;

/// Instantiate the template for an assessment. The subject network is used
/// exactly as scored; whether it is narrow enough is the gate pipeline's
/// call, not the template's.
pub fn rule_for(assessment: &ThreatAssessment) -> PolicyRule {
    let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::DaemonAuto);
    rule.family = if assessment.subject.is_ipv4() {
        Family::Ipv4
    } else {
        Family::Ipv6
    };
    rule.source = Some(AddrSpec::Network(assessment.subject));
    rule.priority = AUTO_PRIORITY;
    rule.log = true;
    rule.expires_at = Some(
        Utc::now()
            + ChronoDuration::from_std(assessment.expires_suggestion)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
    );
    rule.comment = Some(format!(
        "auto {} assessment {}",
        assessment.kind.as_str(),
        assessment.id
    ));

    match assessment.kind {
        ThreatKind::BruteForce => {
            rule.protocol = Protocol::Tcp;
            rule.destination_port = Some(PortSpec::Single(SSH_PORT));
        }
        ThreatKind::PortScan | ThreatKind::FeedHit => {
            // breadth is the threat; block the subject outright
            rule.protocol = Protocol::Any;
        }
        ThreatKind::RateSpike => {
            rule.protocol = Protocol::Any;
            // evidence names the hammered ports, narrow to them when few
            let mut ports: Vec<u16> = assessment.ports.clone();
            ports.sort_unstable();
            ports.dedup();
            if !ports.is_empty() && ports.len() <= 8 {
                rule.protocol = Protocol::Tcp;
                rule.destination_port = Some(if ports.len() == 1 {
                    PortSpec::Single(ports[0])
                } else {
                    PortSpec::List(ports)
                });
            }
        }
    }
    rule
}

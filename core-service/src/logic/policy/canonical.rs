//! Canonical form and match equality
//!
//! Deduplication compares rules on their match fields only, after
//! canonicalization: sorted port lists, network-normalized CIDRs, case-folded
//! protocol (already folded by the enum). Identity, origin, expiry and
//! comments never participate.

use ipnetwork::IpNetwork;

use crate::logic::policy::types::{AddrSpec, PolicyRule};

/// Rewrite a rule into canonical form.
pub fn canonicalize(rule: &PolicyRule) -> PolicyRule {
    let mut out = rule.clone();
    out.source = rule.source.as_ref().map(canonical_addr);
    out.destination = rule.destination.as_ref().map(canonical_addr);
    out.source_port = rule.source_port.as_ref().map(|p| p.canonical());
    out.destination_port = rule.destination_port.as_ref().map(|p| p.canonical());
    out
}

fn canonical_addr(spec: &AddrSpec) -> AddrSpec {
    match spec {
        // 10.1.2.3/8 -> 10.0.0.0/8
        AddrSpec::Network(net) => {
            let normalized = IpNetwork::new(net.network(), net.prefix())
                .unwrap_or(*net);
            AddrSpec::Network(normalized)
        }
        AddrSpec::Set(name) => AddrSpec::Set(name.clone()),
    }
}

/// Equality over match fields + action, in canonical form.
pub fn rules_equivalent(a: &PolicyRule, b: &PolicyRule) -> bool {
    let (a, b) = (canonicalize(a), canonicalize(b));
    a.family == b.family
        && a.direction == b.direction
        && a.action == b.action
        && a.source == b.source
        && a.destination == b.destination
        && a.protocol == b.protocol
        && a.source_port == b.source_port
        && a.destination_port == b.destination_port
        && a.stateful == b.stateful
        && a.rate_limit == b.rate_limit
}

/// Equality over match fields only (action excluded); the conflict analyzer
/// uses this to tell a redundant rule from a contradiction.
pub fn matches_equivalent(a: &PolicyRule, b: &PolicyRule) -> bool {
    let (a, b) = (canonicalize(a), canonicalize(b));
    a.family == b.family
        && a.direction == b.direction
        && a.source == b.source
        && a.destination == b.destination
        && a.protocol == b.protocol
        && a.source_port == b.source_port
        && a.destination_port == b.destination_port
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::types::{Action, Direction, Origin, PortSpec};

    fn drop_rule() -> PolicyRule {
        let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::User);
        rule.source = Some(AddrSpec::Network("10.9.8.7/8".parse().unwrap()));
        rule.destination_port = Some(PortSpec::List(vec![443, 80]));
        rule.protocol = crate::logic::policy::types::Protocol::Tcp;
        rule
    }

    #[test]
    fn canonicalization_normalizes_network_and_ports() {
        let canon = canonicalize(&drop_rule());
        assert_eq!(
            canon.source,
            Some(AddrSpec::Network("10.0.0.0/8".parse().unwrap()))
        );
        assert_eq!(canon.destination_port, Some(PortSpec::List(vec![80, 443])));
    }

    #[test]
    fn equivalence_ignores_identity_fields() {
        let a = drop_rule();
        let mut b = drop_rule();
        b.comment = Some("different comment".into());
        b.priority = 99;
        // ids differ too
        assert!(rules_equivalent(&a, &b));
    }

    #[test]
    fn opposite_actions_share_matches_but_not_equivalence() {
        let a = drop_rule();
        let mut b = drop_rule();
        b.action = Action::Accept;
        b.origin = Origin::User;
        assert!(!rules_equivalent(&a, &b));
        assert!(matches_equivalent(&a, &b));
    }
}

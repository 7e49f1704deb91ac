//! Match-set algebra
//!
//! Every rule induces a set of packets per dimension: family, direction,
//! source/destination address sets, protocol, source/destination ports. Two
//! rules overlap iff every dimension intersects; one subsumes another iff
//! every dimension of the narrower is contained in the wider. Symbolic
//! (named) address sets are opaque, so they compare conservatively: equal
//! names intersect and contain, different names are assumed to intersect but
//! never to contain.

use ipnetwork::IpNetwork;

use crate::logic::policy::{AddrSpec, Direction, Family, PolicyRule, PortSpec, Protocol};

// ============================================================================
// DIMENSIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum AddrDim {
    Any,
    Net(IpNetwork),
    Set(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortDim {
    Any,
    /// Normalized: sorted, non-overlapping closed intervals
    Intervals(Vec<(u16, u16)>),
}

/// The packet set a rule matches.
#[derive(Debug, Clone)]
pub struct MatchSet {
    families: (bool, bool), // (v4, v6)
    direction: Direction,
    src: AddrDim,
    dst: AddrDim,
    protocol: Protocol,
    sports: PortDim,
    dports: PortDim,
}

impl MatchSet {
    pub fn of(rule: &PolicyRule) -> Self {
        Self {
            families: match rule.family {
                Family::Ipv4 => (true, false),
                Family::Ipv6 => (false, true),
                Family::Both => (true, true),
            },
            direction: rule.direction,
            src: addr_dim(rule.source.as_ref()),
            dst: addr_dim(rule.destination.as_ref()),
            protocol: rule.protocol,
            sports: port_dim(rule.source_port.as_ref()),
            dports: port_dim(rule.destination_port.as_ref()),
        }
    }

    /// Non-empty intersection on every dimension.
    pub fn intersects(&self, other: &MatchSet) -> bool {
        self.direction == other.direction
            && families_intersect(self.families, other.families)
            && addr_intersects(&self.src, &other.src)
            && addr_intersects(&self.dst, &other.dst)
            && proto_intersects(self.protocol, other.protocol)
            && ports_intersect(&self.sports, &other.sports)
            && ports_intersect(&self.dports, &other.dports)
    }

    /// `self` ⊆ `other` on every dimension.
    pub fn subset_of(&self, other: &MatchSet) -> bool {
        self.direction == other.direction
            && families_subset(self.families, other.families)
            && addr_subset(&self.src, &other.src)
            && addr_subset(&self.dst, &other.dst)
            && proto_subset(self.protocol, other.protocol)
            && ports_subset(&self.sports, &other.sports)
            && ports_subset(&self.dports, &other.dports)
    }
}

// ============================================================================
// DIMENSION CONSTRUCTION
// ============================================================================

fn addr_dim(spec: Option<&AddrSpec>) -> AddrDim {
    match spec {
        None => AddrDim::Any,
        Some(AddrSpec::Network(net)) => {
            let normalized = IpNetwork::new(net.network(), net.prefix()).unwrap_or(*net);
            AddrDim::Net(normalized)
        }
        Some(AddrSpec::Set(name)) => AddrDim::Set(name.clone()),
    }
}

fn port_dim(spec: Option<&PortSpec>) -> PortDim {
    match spec {
        None => PortDim::Any,
        Some(spec) => {
            let mut intervals = spec.intervals();
            intervals.sort_unstable();
            // merge touching/overlapping intervals
            let mut merged: Vec<(u16, u16)> = Vec::with_capacity(intervals.len());
            for (lo, hi) in intervals {
                match merged.last_mut() {
                    Some((_, prev_hi)) if lo <= prev_hi.saturating_add(1) => {
                        *prev_hi = (*prev_hi).max(hi);
                    }
                    _ => merged.push((lo, hi)),
                }
            }
            PortDim::Intervals(merged)
        }
    }
}

// ============================================================================
// PER-DIMENSION RELATIONS
// ============================================================================

fn families_intersect(a: (bool, bool), b: (bool, bool)) -> bool {
    (a.0 && b.0) || (a.1 && b.1)
}

fn families_subset(a: (bool, bool), b: (bool, bool)) -> bool {
    (!a.0 || b.0) && (!a.1 || b.1)
}

fn nets_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    if a.is_ipv4() != b.is_ipv4() {
        return false;
    }
    a.contains(b.network()) || b.contains(a.network())
}

fn net_subset(a: &IpNetwork, b: &IpNetwork) -> bool {
    if a.is_ipv4() != b.is_ipv4() {
        return false;
    }
    b.prefix() <= a.prefix() && b.contains(a.network())
}

fn addr_intersects(a: &AddrDim, b: &AddrDim) -> bool {
    match (a, b) {
        (AddrDim::Any, _) | (_, AddrDim::Any) => true,
        (AddrDim::Net(x), AddrDim::Net(y)) => nets_overlap(x, y),
        (AddrDim::Set(x), AddrDim::Set(y)) if x == y => true,
        // opaque set contents: assume the worst
        (AddrDim::Set(_), _) | (_, AddrDim::Set(_)) => true,
    }
}

fn addr_subset(a: &AddrDim, b: &AddrDim) -> bool {
    match (a, b) {
        (_, AddrDim::Any) => true,
        (AddrDim::Any, _) => false,
        (AddrDim::Net(x), AddrDim::Net(y)) => net_subset(x, y),
        (AddrDim::Set(x), AddrDim::Set(y)) => x == y,
        // a concrete net is never provably inside an opaque set, nor vice versa
        (AddrDim::Net(_), AddrDim::Set(_)) | (AddrDim::Set(_), AddrDim::Net(_)) => false,
    }
}

fn proto_intersects(a: Protocol, b: Protocol) -> bool {
    a == Protocol::Any || b == Protocol::Any || a == b
}

fn proto_subset(a: Protocol, b: Protocol) -> bool {
    b == Protocol::Any || a == b
}

fn ports_intersect(a: &PortDim, b: &PortDim) -> bool {
    match (a, b) {
        (PortDim::Any, _) | (_, PortDim::Any) => true,
        (PortDim::Intervals(xs), PortDim::Intervals(ys)) => xs
            .iter()
            .any(|(alo, ahi)| ys.iter().any(|(blo, bhi)| alo <= bhi && blo <= ahi)),
    }
}

fn ports_subset(a: &PortDim, b: &PortDim) -> bool {
    match (a, b) {
        (_, PortDim::Any) => true,
        (PortDim::Any, PortDim::Intervals(ys)) => {
            // Any ⊆ intervals only if the intervals cover the full port space
            ys == &[(1u16, u16::MAX)] || ys == &[(0u16, u16::MAX)]
        }
        (PortDim::Intervals(xs), PortDim::Intervals(ys)) => xs.iter().all(|(alo, ahi)| {
            ys.iter().any(|(blo, bhi)| blo <= alo && ahi <= bhi)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::{Action, Origin};

    fn rule(src: &str, dport: Option<PortSpec>) -> PolicyRule {
        let mut r = PolicyRule::new(Direction::Input, Action::Drop, Origin::User);
        r.family = Family::Ipv4;
        r.source = Some(AddrSpec::Network(src.parse().unwrap()));
        r.protocol = Protocol::Tcp;
        r.destination_port = dport;
        r
    }

    #[test]
    fn host_inside_cidr_is_subset() {
        let narrow = MatchSet::of(&rule("203.0.113.7/32", Some(PortSpec::Single(22))));
        let wide = MatchSet::of(&rule("203.0.113.0/24", None));
        assert!(narrow.subset_of(&wide));
        assert!(!wide.subset_of(&narrow));
        assert!(narrow.intersects(&wide));
    }

    #[test]
    fn disjoint_networks_do_not_intersect() {
        let a = MatchSet::of(&rule("10.0.0.0/8", None));
        let b = MatchSet::of(&rule("192.168.0.0/16", None));
        assert!(!a.intersects(&b));
    }

    #[test]
    fn port_interval_relations() {
        let single = MatchSet::of(&rule("10.0.0.0/8", Some(PortSpec::Single(443))));
        let range = MatchSet::of(&rule("10.0.0.0/8", Some(PortSpec::Range(400, 500))));
        let list = MatchSet::of(&rule("10.0.0.0/8", Some(PortSpec::List(vec![22, 80]))));
        assert!(single.subset_of(&range));
        assert!(!range.subset_of(&single));
        assert!(!list.intersects(&single));
    }

    #[test]
    fn direction_partitions_everything() {
        let mut output = rule("10.0.0.0/8", None);
        output.direction = Direction::Output;
        let input = rule("10.0.0.0/8", None);
        assert!(!MatchSet::of(&input).intersects(&MatchSet::of(&output)));
    }

    #[test]
    fn family_both_contains_v4() {
        let mut both = rule("10.0.0.0/8", None);
        both.family = Family::Both;
        let v4 = rule("10.0.0.0/8", None);
        assert!(MatchSet::of(&v4).subset_of(&MatchSet::of(&both)));
        assert!(!MatchSet::of(&both).subset_of(&MatchSet::of(&v4)));
    }

    #[test]
    fn named_sets_compare_conservatively() {
        let mut with_set = rule("10.0.0.0/8", None);
        with_set.source = Some(AddrSpec::Set("blocklist".into()));
        let concrete = rule("10.0.0.0/8", None);
        let a = MatchSet::of(&with_set);
        let b = MatchSet::of(&concrete);
        assert!(a.intersects(&b));
        assert!(!a.subset_of(&b));
        assert!(!b.subset_of(&a));
    }

    #[test]
    fn cidr_bounds_are_inclusive() {
        // both edges of the /24 live inside it
        let net = MatchSet::of(&rule("198.51.100.0/24", None));
        let low = MatchSet::of(&rule("198.51.100.0/32", None));
        let high = MatchSet::of(&rule("198.51.100.255/32", None));
        assert!(low.subset_of(&net));
        assert!(high.subset_of(&net));
    }
}

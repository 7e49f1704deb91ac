//! Conflict analysis
//!
//! Pure with respect to the store: takes a candidate rule plus the current
//! parsed ruleset, returns findings. Findings are warnings, not errors;
//! whether a finding blocks deployment is the caller's policy (the autonomy
//! controller refuses shadow/contradiction against user rules, interactive
//! consumers deploy over warnings at will).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logic::backend::EvaluationOrder;
use crate::logic::conflict::algebra::MatchSet;
use crate::logic::policy::{
    matches_equivalent, rules_equivalent, Origin, PolicyRule,
};

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// An earlier-evaluated rule fully subsumes the candidate
    Shadow,
    /// A later rule subsumes the candidate (last-match backends only)
    ShadowedByLater,
    /// Exact duplicate after canonicalization
    Redundant,
    /// Same match set, opposite action
    Contradiction,
    /// Partial intersection with differing action
    Overlap,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Shadow => "shadow",
            ConflictKind::ShadowedByLater => "shadowed-by-later",
            ConflictKind::Redundant => "redundant",
            ConflictKind::Contradiction => "contradiction",
            ConflictKind::Overlap => "overlap",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictFinding {
    pub kind: ConflictKind,
    pub existing_rule_id: Uuid,
    pub existing_origin: Origin,
    pub existing_summary: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    pub findings: Vec<ConflictFinding>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// The autonomy controller must refuse to deploy over these.
    pub fn blocks_autonomy(&self) -> bool {
        self.findings.iter().any(|f| {
            f.existing_origin == Origin::User
                && matches!(
                    f.kind,
                    ConflictKind::Shadow
                        | ConflictKind::ShadowedByLater
                        | ConflictKind::Contradiction
                )
        })
    }
}

/// An existing rule plus its insertion position as reported by `list_rules`.
#[derive(Debug, Clone)]
pub struct ExistingRule {
    pub rule: PolicyRule,
    pub position: usize,
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// Analyze one candidate against the current ruleset. The candidate is
/// treated as appended after all existing rules; priority still reorders
/// evaluation where the backend supports it.
pub fn analyze(
    candidate: &PolicyRule,
    existing: &[ExistingRule],
    order: EvaluationOrder,
) -> ConflictReport {
    let candidate_set = MatchSet::of(candidate);
    let candidate_key = (candidate.priority, existing.len());
    let mut findings = Vec::new();

    for entry in existing {
        let other = &entry.rule;
        if other.id == candidate.id {
            continue;
        }
        let other_set = MatchSet::of(other);
        if !candidate_set.intersects(&other_set) {
            continue;
        }

        let other_key = (other.priority, entry.position);

        let finding = if rules_equivalent(candidate, other) {
            Some((
                ConflictKind::Redundant,
                "exact duplicate after canonicalization".to_string(),
            ))
        } else if matches_equivalent(candidate, other)
            && candidate.action.is_deny() != other.action.is_deny()
        {
            Some((
                ConflictKind::Contradiction,
                format!(
                    "same match set with opposite actions ({} vs {})",
                    candidate.action.as_str(),
                    other.action.as_str()
                ),
            ))
        } else if candidate_set.subset_of(&other_set) {
            match order {
                EvaluationOrder::FirstMatch if other_key < candidate_key => Some((
                    ConflictKind::Shadow,
                    "an earlier rule already matches everything this rule matches".to_string(),
                )),
                EvaluationOrder::LastMatch if other_key > candidate_key => Some((
                    ConflictKind::ShadowedByLater,
                    "a later rule overrides everything this rule matches".to_string(),
                )),
                _ => differing_action_overlap(candidate, other),
            }
        } else {
            differing_action_overlap(candidate, other)
        };

        if let Some((kind, explanation)) = finding {
            findings.push(ConflictFinding {
                kind,
                existing_rule_id: other.id,
                existing_origin: other.origin,
                existing_summary: other.summary(),
                explanation,
            });
        }
    }

    ConflictReport { findings }
}

fn differing_action_overlap(
    candidate: &PolicyRule,
    other: &PolicyRule,
) -> Option<(ConflictKind, String)> {
    if candidate.action.is_deny() != other.action.is_deny() {
        Some((
            ConflictKind::Overlap,
            "partially overlapping match sets with differing actions".to_string(),
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::{Action, AddrSpec, Direction, Family, PortSpec, Protocol};

    fn rule(src: &str, action: Action, origin: Origin) -> PolicyRule {
        let mut r = PolicyRule::new(Direction::Input, action, origin);
        r.family = Family::Ipv4;
        r.source = Some(AddrSpec::Network(src.parse().unwrap()));
        r.protocol = Protocol::Tcp;
        r.destination_port = Some(PortSpec::Single(22));
        r
    }

    fn existing(rules: Vec<PolicyRule>) -> Vec<ExistingRule> {
        rules
            .into_iter()
            .enumerate()
            .map(|(position, rule)| ExistingRule { rule, position })
            .collect()
    }

    #[test]
    fn narrow_rule_behind_wide_rule_is_shadowed() {
        let wide = rule("203.0.113.0/24", Action::Drop, Origin::User);
        let narrow = rule("203.0.113.7/32", Action::Drop, Origin::User);
        let report = analyze(&narrow, &existing(vec![wide]), EvaluationOrder::FirstMatch);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, ConflictKind::Shadow);
    }

    #[test]
    fn shadowed_by_later_needs_last_match_order() {
        // existing has lower priority number, so under last-match with the
        // candidate appended the existing wide rule evaluates after only if
        // its priority is greater
        let mut wide = rule("203.0.113.0/24", Action::Drop, Origin::User);
        wide.priority = 10;
        let narrow = rule("203.0.113.7/32", Action::Drop, Origin::User);
        let report = analyze(&narrow, &existing(vec![wide.clone()]), EvaluationOrder::LastMatch);
        assert_eq!(report.findings[0].kind, ConflictKind::ShadowedByLater);

        // under first-match the higher-priority-number rule evaluates later,
        // so no shadow either way
        let report = analyze(&narrow, &existing(vec![wide]), EvaluationOrder::FirstMatch);
        assert!(report
            .findings
            .iter()
            .all(|f| f.kind != ConflictKind::Shadow));
    }

    #[test]
    fn exact_duplicate_is_redundant() {
        let a = rule("198.51.100.9/32", Action::Drop, Origin::User);
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.comment = Some("same thing".into());
        let report = analyze(&b, &existing(vec![a]), EvaluationOrder::FirstMatch);
        assert_eq!(report.findings[0].kind, ConflictKind::Redundant);
    }

    #[test]
    fn same_match_opposite_action_contradicts() {
        let allow = rule("198.51.100.9/32", Action::Accept, Origin::User);
        let block = rule("198.51.100.9/32", Action::Drop, Origin::DaemonAuto);
        let report = analyze(&block, &existing(vec![allow]), EvaluationOrder::FirstMatch);
        assert_eq!(report.findings[0].kind, ConflictKind::Contradiction);
        assert!(report.blocks_autonomy());
    }

    #[test]
    fn partial_overlap_with_differing_action_reported() {
        let mut allow = rule("198.51.100.0/24", Action::Accept, Origin::User);
        allow.destination_port = Some(PortSpec::Range(1, 1024));
        let mut block = rule("198.51.0.0/16", Action::Drop, Origin::User);
        block.destination_port = Some(PortSpec::Single(22));
        let report = analyze(&block, &existing(vec![allow]), EvaluationOrder::FirstMatch);
        assert_eq!(report.findings[0].kind, ConflictKind::Overlap);
    }

    #[test]
    fn disjoint_rules_are_clean() {
        let a = rule("10.0.0.0/8", Action::Drop, Origin::User);
        let b = rule("192.0.2.0/24", Action::Drop, Origin::User);
        let report = analyze(&b, &existing(vec![a]), EvaluationOrder::FirstMatch);
        assert!(report.is_clean());
    }

    #[test]
    fn shadow_against_daemon_rule_does_not_block_autonomy() {
        let wide = rule("203.0.113.0/24", Action::Drop, Origin::DaemonAuto);
        let narrow = rule("203.0.113.7/32", Action::Drop, Origin::DaemonAuto);
        let report = analyze(&narrow, &existing(vec![wide]), EvaluationOrder::FirstMatch);
        assert_eq!(report.findings[0].kind, ConflictKind::Shadow);
        assert!(!report.blocks_autonomy());
    }
}

//! Autonomy Controller
//!
//! Turns scored assessments into deployments through a fixed gate pipeline.
//! Every gate failure leaves an audit record; nothing autonomous ever
//! carries an accept action or outlives its expiry.

pub mod breaker;
pub mod templates;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::constants;
use crate::logic::backend::{BackendAdapter, Verdict};
use crate::logic::conflict::{self, ExistingRule};
use crate::logic::correlator::{Recommendation, ThreatAssessment};
use crate::logic::deploy::{DeployController, SafetySwitch};
use crate::logic::error::{CoreError, CoreResult};
use crate::logic::never_block::NeverBlockList;
use crate::logic::store::{AuditKind, Deployment, Proposal, ProposalState, Store};

pub use breaker::{CircuitBreaker, RateGate};

// ============================================================================
// LEVEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Never deploys; alerts and writes pending proposals only
    Monitor,
    /// Deploys on strong, corroborated evidence
    Cautious,
    /// Deploys on a single high-score signal
    Aggressive,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyLevel::Monitor => "monitor",
            AutonomyLevel::Cautious => "cautious",
            AutonomyLevel::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitor" => Some(AutonomyLevel::Monitor),
            "cautious" => Some(AutonomyLevel::Cautious),
            "aggressive" => Some(AutonomyLevel::Aggressive),
            _ => None,
        }
    }
}

/// What happened to one assessment.
#[derive(Debug)]
pub enum AutonomyOutcome {
    Deployed(Deployment),
    /// Monitor level: queued for a human
    Proposed(Proposal),
    AlertOnly(String),
    Suppressed(String),
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct AutonomyController {
    store: Arc<Store>,
    never_block: Arc<NeverBlockList>,
    safety: Arc<SafetySwitch>,
    deploy: Arc<DeployController>,
    adapter: RwLock<Arc<dyn BackendAdapter>>,
    level: RwLock<AutonomyLevel>,
    breaker: CircuitBreaker,
    rate: RateGate,
    max_cidr_v4: u8,
    cooldowns: Mutex<HashMap<IpNetwork, DateTime<Utc>>>,
}

impl AutonomyController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        never_block: Arc<NeverBlockList>,
        safety: Arc<SafetySwitch>,
        deploy: Arc<DeployController>,
        adapter: Arc<dyn BackendAdapter>,
        level: AutonomyLevel,
        breaker: CircuitBreaker,
        rate_per_min: u32,
        max_cidr_v4: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            never_block,
            safety,
            deploy,
            adapter: RwLock::new(adapter),
            level: RwLock::new(level),
            breaker,
            rate: RateGate::new(rate_per_min),
            max_cidr_v4,
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    pub fn level(&self) -> AutonomyLevel {
        *self.level.read()
    }

    pub fn breaker_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn set_adapter(&self, adapter: Arc<dyn BackendAdapter>) {
        *self.adapter.write() = adapter;
    }

    /// Operator level change; also the operator's breaker reset.
    pub async fn set_level(&self, level: AutonomyLevel) -> CoreResult<()> {
        let correlation = Uuid::new_v4();
        *self.level.write() = level;
        self.breaker.reset();
        self.store
            .append_audit(
                AuditKind::AutonomyLevelChanged,
                None,
                level.as_str(),
                None,
                Some(correlation),
            )
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        log::info!("autonomy level set to {}", level.as_str());
        Ok(())
    }

    /// Consume assessments until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ThreatAssessment>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("autonomy controller started ({})", self.level().as_str());
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(assessment) = maybe else { break };
                    match self.handle(assessment).await {
                        Ok(AutonomyOutcome::Deployed(d)) => {
                            log::warn!("autonomous deployment {} applied", d.id);
                        }
                        Ok(AutonomyOutcome::Proposed(p)) => {
                            log::info!("autonomous proposal {} pending approval", p.id);
                        }
                        Ok(AutonomyOutcome::AlertOnly(msg)) => log::info!("alert: {}", msg),
                        Ok(AutonomyOutcome::Suppressed(reason)) => {
                            log::info!("autonomy suppressed: {}", reason);
                        }
                        Err(err) => log::warn!("autonomy aborted: {}", err),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("autonomy controller stopped");
    }

    /// The gate pipeline. Gates run in their specified order; the first
    /// failure wins and is audited.
    pub async fn handle(&self, assessment: ThreatAssessment) -> CoreResult<AutonomyOutcome> {
        // one correlation id per assessment handled; audit rows and any
        // surfaced error share it
        let correlation = Uuid::new_v4();
        self.handle_inner(assessment, correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))
    }

    async fn handle_inner(
        &self,
        assessment: ThreatAssessment,
        correlation: Uuid,
    ) -> CoreResult<AutonomyOutcome> {
        self.store
            .append_audit(
                AuditKind::ThreatEscalated,
                Some(assessment.id),
                &format!(
                    "{} subject {} score {:.2} ({} events, {} sources)",
                    assessment.kind.as_str(),
                    assessment.subject,
                    assessment.score,
                    assessment.event_count,
                    assessment.distinct_sources
                ),
                None,
                Some(correlation),
            )
            .await?;

        if assessment.recommendation == Recommendation::AlertOnly {
            return Ok(AutonomyOutcome::AlertOnly(format!(
                "{} from {}",
                assessment.kind.as_str(),
                assessment.subject
            )));
        }

        // catastrophic lockout: a failed rollback disables autonomy outright
        if self.safety.is_tripped() {
            return self
                .suppress(&assessment, "catastrophic-lockout", "rollback previously failed", correlation)
                .await;
        }

        // gate 1: never-block entries
        if let Some(entry) = self.never_block.match_entries_net(&assessment.subject) {
            return self
                .suppress(&assessment, "never-block-match", &entry, correlation)
                .await;
        }

        // gate 2: circuit breaker over the trailing window
        let recent = self
            .store
            .count_recent_daemon_deployments(chrono::Duration::from_std(self.breaker.window()).unwrap())
            .await?;
        let was_tripped = self.breaker.is_tripped();
        if self.breaker.check(recent) {
            if !was_tripped {
                self.store
                    .append_audit(
                        AuditKind::BreakerTripped,
                        Some(assessment.id),
                        &format!("{} daemon deployments in window", recent),
                        Some("policy-violation"),
                        Some(correlation),
                    )
                    .await?;
            }
            return Err(CoreError::policy_violation(
                "autonomy circuit breaker is open; operator reset required",
            ));
        }

        // gate 3: per-subject cooldown
        if self.in_cooldown(&assessment.subject) {
            return self
                .suppress(&assessment, "subject-cooldown", "recently acted on this subject", correlation)
                .await;
        }

        // deterministic template; subject width is checked right after
        let rule = templates::rule_for(&assessment);
        if !self.narrow_enough(&assessment.subject) {
            return self
                .suppress(
                    &assessment,
                    "subject-too-broad",
                    &format!("{} wider than the configured maximum", assessment.subject),
                    correlation,
                )
                .await;
        }

        // gate 4: no shadowing or contradicting a user rule
        let existing: Vec<ExistingRule> = self
            .store
            .active_rules()
            .await?
            .into_iter()
            .enumerate()
            .map(|(position, (_, rule))| ExistingRule { rule, position })
            .collect();
        let order = self.adapter.read().capabilities().evaluation_order;
        let report = conflict::analyze(&rule, &existing, order);
        if report.blocks_autonomy() {
            return self
                .suppress(
                    &assessment,
                    "user-rule-conflict",
                    "would shadow or contradict a user rule",
                    correlation,
                )
                .await;
        }

        // gate 5: self-lockout
        if let Some(hit) = self.never_block.match_management_net(&assessment.subject) {
            return self
                .suppress(&assessment, "management-self-block", &hit, correlation)
                .await;
        }

        // gate 6: autonomy level
        let level = self.level();
        match level {
            AutonomyLevel::Monitor => {
                let proposal = self
                    .build_proposal(rule, report, &assessment, ProposalState::PendingApproval, correlation)
                    .await?;
                return Ok(AutonomyOutcome::Proposed(proposal));
            }
            AutonomyLevel::Cautious => {
                let corroborated = assessment.distinct_sources >= 2
                    || assessment.event_count as f64 >= assessment.kind.threshold() * 3.0;
                if assessment.score < constants::ESCALATION_SCORE || !corroborated {
                    return self
                        .suppress(
                            &assessment,
                            "insufficient-corroboration",
                            "cautious level wants more evidence",
                            correlation,
                        )
                        .await;
                }
            }
            AutonomyLevel::Aggressive => {
                if assessment.score < constants::ESCALATION_SCORE {
                    return self
                        .suppress(
                            &assessment,
                            "score-below-threshold",
                            "not a high-confidence signal",
                            correlation,
                        )
                        .await;
                }
            }
        }

        // global creation ceiling, independent of the breaker
        if !self.rate.admit(Utc::now()) {
            return self
                .suppress(&assessment, "rate-limit", "autonomous rule creation ceiling hit", correlation)
                .await;
        }

        let proposal = self
            .build_proposal(rule, report, &assessment, ProposalState::Approved, correlation)
            .await?;
        let deployment = self.deploy.deploy(proposal.id).await?;
        self.set_cooldown(assessment.subject);
        self.store
            .append_audit(
                AuditKind::AutonomousApplied,
                Some(deployment.id),
                &format!("assessment {}", assessment.id),
                None,
                Some(correlation),
            )
            .await?;
        Ok(AutonomyOutcome::Deployed(deployment))
    }

    async fn build_proposal(
        &self,
        rule: crate::logic::policy::PolicyRule,
        conflicts: crate::logic::conflict::ConflictReport,
        assessment: &ThreatAssessment,
        state: ProposalState,
        correlation: Uuid,
    ) -> CoreResult<Proposal> {
        let adapter = self.adapter.read().clone();
        let mut rule = rule;
        if state == ProposalState::PendingApproval {
            rule.origin = crate::logic::policy::Origin::DaemonPropose;
        }
        let rendered = adapter.render(&rule)?;
        let mut proposal = Proposal::new(rule, adapter.name());
        proposal.rendered = Some(rendered);
        proposal.verdict = Some(Verdict::ok());
        proposal.conflicts = conflicts;
        proposal.explanation = Some(format!(
            "templated response to {} assessment {}",
            assessment.kind.as_str(),
            assessment.id
        ));
        proposal.state = state;
        self.store.insert_proposal(&proposal, Some(correlation)).await?;
        Ok(proposal)
    }

    async fn suppress(
        &self,
        assessment: &ThreatAssessment,
        reason: &'static str,
        detail: &str,
        correlation: Uuid,
    ) -> CoreResult<AutonomyOutcome> {
        self.store
            .append_audit(
                AuditKind::AutonomySuppressed,
                Some(assessment.id),
                &format!("{}: {}", reason, detail),
                Some(reason),
                Some(correlation),
            )
            .await?;
        Ok(AutonomyOutcome::Suppressed(reason.to_string()))
    }

    /// Equal to the configured maximum is accepted; anything wider is not.
    fn narrow_enough(&self, subject: &IpNetwork) -> bool {
        if subject.is_ipv4() {
            subject.prefix() >= self.max_cidr_v4
        } else {
            // same number of free host bits as the v4 ceiling allows
            subject.prefix() >= 128 - (32 - self.max_cidr_v4.min(32))
        }
    }

    fn in_cooldown(&self, subject: &IpNetwork) -> bool {
        let now = Utc::now();
        self.cooldowns
            .lock()
            .get(subject)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    fn set_cooldown(&self, subject: IpNetwork) {
        let now = Utc::now();
        let until = now
            + ChronoDuration::from_std(constants::SUBJECT_COOLDOWN)
                .unwrap_or_else(|_| ChronoDuration::minutes(10));
        let mut cooldowns = self.cooldowns.lock();
        cooldowns.retain(|_, u| *u > now);
        cooldowns.insert(subject, until);
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use crate::logic::backend::mock::MockAdapter;
    use crate::logic::correlator::ThreatKind;
    use crate::logic::deploy::heartbeat::{HeartbeatProbe, ProbeMode};
    use crate::logic::deploy::DeployTuning;
    use crate::logic::events::EventBus;
    use crate::logic::never_block::NeverBlockEntry;
    use crate::logic::store::DeploymentState;
    use uuid::Uuid;

    struct Rig {
        autonomy: Arc<AutonomyController>,
        store: Arc<Store>,
        deploy: Arc<DeployController>,
        never_block: Arc<NeverBlockList>,
    }

    async fn rig(level: AutonomyLevel, breaker_limit: u32, rate_per_min: u32) -> Rig {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let never_block = Arc::new(NeverBlockList::new());
        let adapter: Arc<MockAdapter> = Arc::new(MockAdapter::new());
        let safety = Arc::new(SafetySwitch::new());
        let probe = HeartbeatProbe::new(ProbeMode::Scripted(Arc::new(AtomicBool::new(true))));
        let deploy = DeployController::new(
            store.clone(),
            bus,
            never_block.clone(),
            adapter.clone(),
            probe,
            safety.clone(),
            DeployTuning {
                lock_timeout: Duration::from_millis(300),
                heartbeat_timeout: Duration::from_millis(30),
                probe_interval: Duration::from_millis(10),
                backup_retain_days: 7,
            },
        );
        let autonomy = AutonomyController::new(
            store.clone(),
            never_block.clone(),
            safety,
            deploy.clone(),
            adapter,
            level,
            CircuitBreaker::new(breaker_limit, Duration::from_secs(600)),
            rate_per_min,
            24,
        );
        Rig { autonomy, store, deploy, never_block }
    }

    fn assessment(subject: &str, kind: ThreatKind, count: u64, sources: usize) -> ThreatAssessment {
        ThreatAssessment {
            id: Uuid::new_v4(),
            kind,
            subject: subject.parse().unwrap(),
            score: 0.9,
            evidence: vec![],
            event_count: count,
            distinct_sources: sources,
            ports: vec![],
            recommendation: Recommendation::BlockSubject,
            expires_suggestion: kind.block_ttl(),
            templated_rule: None,
            created_at: Utc::now(),
        }
    }

    async fn settle(rig: &Rig, deployment: &Deployment) {
        // commit so the next deployment can take the backend lock
        for _ in 0..100 {
            let d = rig.store.get_deployment(deployment.id).await.unwrap().unwrap();
            if d.state == DeploymentState::Committed {
                return;
            }
            let _ = rig.deploy.commit(deployment.id).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn cautious_brute_force_deploys_and_audits() {
        let rig = rig(AutonomyLevel::Cautious, 10, 10).await;
        let a = assessment("203.0.113.7/32", ThreatKind::BruteForce, 60, 1);
        let a_id = a.id;

        let outcome = rig.autonomy.handle(a).await.unwrap();
        let AutonomyOutcome::Deployed(deployment) = outcome else {
            panic!("expected a deployment");
        };
        settle(&rig, &deployment).await;

        let kinds: Vec<String> = rig
            .store
            .audit_tail(30)
            .await
            .unwrap()
            .iter()
            .map(|r| r.kind.clone())
            .collect();
        assert!(kinds.contains(&"threat-escalated".to_string()));
        assert!(kinds.contains(&"autonomous-applied".to_string()));

        let applied = rig
            .store
            .audit_by_kind(AuditKind::AutonomousApplied)
            .await
            .unwrap();
        assert!(applied[0].detail.contains(&a_id.to_string()));
    }

    #[tokio::test]
    async fn never_block_entry_suppresses_feed_hit() {
        let rig = rig(AutonomyLevel::Aggressive, 10, 10).await;
        rig.never_block
            .add(NeverBlockEntry::parse("10.0.0.1/32").unwrap());

        let outcome = rig
            .autonomy
            .handle(assessment("10.0.0.1/32", ThreatKind::FeedHit, 1, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Suppressed(ref r) if r == "never-block-match"));

        // no proposal was created
        assert!(rig.store.list_proposals(None).await.unwrap().is_empty());
        let suppressed = rig
            .store
            .audit_by_kind(AuditKind::AutonomySuppressed)
            .await
            .unwrap();
        assert_eq!(suppressed[0].error_kind.as_deref(), Some("never-block-match"));
    }

    #[tokio::test]
    async fn breaker_suppresses_after_limit_with_policy_violation() {
        let rig = rig(AutonomyLevel::Aggressive, 2, 100).await;
        for i in 0..2 {
            let a = assessment(
                &format!("203.0.113.{}/32", i + 1),
                ThreatKind::BruteForce,
                60,
                2,
            );
            let outcome = rig.autonomy.handle(a).await.unwrap();
            let AutonomyOutcome::Deployed(d) = outcome else { panic!("expected deploy") };
            settle(&rig, &d).await;
        }

        let err = rig
            .autonomy
            .handle(assessment("203.0.113.99/32", ThreatKind::BruteForce, 60, 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "policy-violation");
        assert!(rig.autonomy.breaker_tripped());
        let tripped = rig.store.audit_by_kind(AuditKind::BreakerTripped).await.unwrap();
        assert_eq!(tripped.len(), 1);

        // operator reset through a level change
        rig.autonomy.set_level(AutonomyLevel::Aggressive).await.unwrap();
        assert!(!rig.autonomy.breaker_tripped());
    }

    #[tokio::test]
    async fn monitor_level_proposes_instead_of_deploying() {
        let rig = rig(AutonomyLevel::Monitor, 10, 10).await;
        let outcome = rig
            .autonomy
            .handle(assessment("198.51.100.9/32", ThreatKind::PortScan, 40, 1))
            .await
            .unwrap();
        let AutonomyOutcome::Proposed(proposal) = outcome else {
            panic!("monitor level must not deploy");
        };
        assert_eq!(proposal.state, ProposalState::PendingApproval);
        assert_eq!(proposal.origin().as_str(), "daemon-propose");
        assert!(rig
            .store
            .deployment_for_proposal(proposal.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cautious_wants_corroboration() {
        let rig = rig(AutonomyLevel::Cautious, 10, 10).await;
        // single source, only 15 events: not 3x the threshold
        let outcome = rig
            .autonomy
            .handle(assessment("198.51.100.9/32", ThreatKind::BruteForce, 15, 1))
            .await
            .unwrap();
        assert!(
            matches!(outcome, AutonomyOutcome::Suppressed(ref r) if r == "insufficient-corroboration")
        );
    }

    #[tokio::test]
    async fn subject_cooldown_blocks_double_response() {
        let rig = rig(AutonomyLevel::Aggressive, 10, 10).await;
        let first = rig
            .autonomy
            .handle(assessment("198.51.100.9/32", ThreatKind::BruteForce, 60, 2))
            .await
            .unwrap();
        let AutonomyOutcome::Deployed(d) = first else { panic!() };
        settle(&rig, &d).await;

        let second = rig
            .autonomy
            .handle(assessment("198.51.100.9/32", ThreatKind::PortScan, 40, 2))
            .await
            .unwrap();
        assert!(matches!(second, AutonomyOutcome::Suppressed(ref r) if r == "subject-cooldown"));
    }

    #[tokio::test]
    async fn broad_subject_refused_equal_accepted() {
        let rig = rig(AutonomyLevel::Aggressive, 10, 10).await;
        // wider than /24: refused
        let outcome = rig
            .autonomy
            .handle(assessment("198.51.0.0/16", ThreatKind::FeedHit, 1, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Suppressed(ref r) if r == "subject-too-broad"));

        // exactly /24: accepted
        let outcome = rig
            .autonomy
            .handle(assessment("198.51.100.0/24", ThreatKind::FeedHit, 1, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Deployed(_)));
    }

    #[tokio::test]
    async fn user_contradiction_suppresses() {
        let rig = rig(AutonomyLevel::Aggressive, 10, 10).await;
        // a committed user accept rule for the subject
        let mut allow = crate::logic::policy::PolicyRule::new(
            crate::logic::policy::Direction::Input,
            crate::logic::policy::Action::Accept,
            crate::logic::policy::Origin::User,
        );
        allow.family = crate::logic::policy::Family::Ipv4;
        allow.source = Some(crate::logic::policy::AddrSpec::Network(
            "198.51.100.9/32".parse().unwrap(),
        ));
        // user explicitly accepted SSH from this host; the templated block
        // would contradict it
        allow.protocol = crate::logic::policy::Protocol::Tcp;
        allow.destination_port = Some(crate::logic::policy::PortSpec::Single(22));
        let mut proposal = Proposal::new(allow, "mock");
        proposal.state = ProposalState::Approved;
        proposal.verdict = Some(Verdict::ok());
        rig.store.insert_proposal(&proposal, None).await.unwrap();
        let deployment = rig.deploy.deploy(proposal.id).await.unwrap();
        settle(&rig, &deployment).await;

        let outcome = rig
            .autonomy
            .handle(assessment("198.51.100.9/32", ThreatKind::BruteForce, 60, 2))
            .await
            .unwrap();
        assert!(matches!(outcome, AutonomyOutcome::Suppressed(ref r) if r == "user-rule-conflict"));
    }
}

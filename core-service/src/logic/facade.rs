//! Service Facade
//!
//! The single entry point for every consumer, interactive or daemon. Owns
//! the active adapter, the never-block list and the controllers; it is the
//! only writer against the store and the backend. Consumers get read
//! snapshots and a subscribable event stream, never direct access.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants;
use crate::logic::autonomy::{AutonomyController, AutonomyLevel, CircuitBreaker};
use crate::logic::backend::{
    AdapterHealth, AdapterRegistry, BackendAdapter, BackendOptions, ImportResult,
};
use crate::logic::config::Config;
use crate::logic::conflict::{self, ExistingRule};
use crate::logic::deploy::{DeployController, HeartbeatProbe, SafetySwitch};
use crate::logic::error::{CoreError, CoreResult};
use crate::logic::events::{EventBus, LifecycleNotice, SecurityEvent, StreamItem};
use crate::logic::intel::IndicatorSet;
use crate::logic::never_block::{NeverBlockEntry, NeverBlockList};
use crate::logic::policy::{self, PolicyRule, RenderedRule};
use crate::logic::store::{
    AuditKind, Deployment, Proposal, ProposalState, Store,
};
use crate::logic::translator::TranslatorClient;
use crate::logic::{netctx, Shutdown};

pub struct Facade {
    config: parking_lot::RwLock<Arc<Config>>,
    store: Arc<Store>,
    registry: AdapterRegistry,
    adapter: parking_lot::RwLock<Arc<dyn BackendAdapter>>,
    pub deploy: Arc<DeployController>,
    pub autonomy: Arc<AutonomyController>,
    pub bus: Arc<EventBus>,
    pub never_block: Arc<NeverBlockList>,
    pub probe: Arc<HeartbeatProbe>,
    pub indicators: Arc<IndicatorSet>,
    pub translator: Option<Arc<TranslatorClient>>,
    started_at: DateTime<Utc>,
}

impl Facade {
    /// Wire the whole core from one config snapshot.
    pub async fn build(config: Config, store: Arc<Store>) -> CoreResult<Arc<Self>> {
        Self::build_with_registry(config, store, AdapterRegistry::with_builtin()).await
    }

    pub async fn build_with_registry(
        config: Config,
        store: Arc<Store>,
        registry: AdapterRegistry,
    ) -> CoreResult<Arc<Self>> {
        let mut options: BackendOptions = config.backend.options.clone();
        options
            .entry("backup_dir".into())
            .or_insert_with(|| config.backup_dir().to_string_lossy().to_string());
        let adapter = registry.activate(&config.backend.name, &options)?;

        let bus = Arc::new(EventBus::new());
        for (name, source) in &config.sources {
            bus.set_budget(name, source.budget);
        }

        let never_block = Arc::new(NeverBlockList::new());
        let mut entries = Vec::new();
        for text in &config.never_block.entries {
            entries.push(NeverBlockEntry::parse(text)?);
        }
        for row in store.never_block_rows().await? {
            if let Ok(entry) = NeverBlockEntry::parse(&row.entry) {
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        never_block.replace_entries(entries);
        if config.never_block.management_discovery {
            let ctx = netctx::gather();
            let nets = ctx
                .host_addresses()
                .into_iter()
                .map(|ip| {
                    let prefix = if ip.is_ipv4() { 32 } else { 128 };
                    ipnetwork::IpNetwork::new(ip, prefix).expect("host prefix")
                })
                .collect::<Vec<_>>();
            log::info!(
                "management discovery: protecting {} host addresses on {}",
                nets.len(),
                ctx.hostname
            );
            never_block.set_management(nets);
        }

        let probe = HeartbeatProbe::new(config.deploy.heartbeat.probe.to_mode()?);
        let safety = Arc::new(SafetySwitch::new());
        let deploy = DeployController::new(
            store.clone(),
            bus.clone(),
            never_block.clone(),
            adapter.clone(),
            probe.clone(),
            safety.clone(),
            config.deploy_tuning(),
        );

        let translator = config.translator.as_ref().map(|t| {
            Arc::new(TranslatorClient::new(
                t.url.clone(),
                std::time::Duration::from_secs(t.timeout_secs),
            ))
        });

        let autonomy = AutonomyController::new(
            store.clone(),
            never_block.clone(),
            safety,
            deploy.clone(),
            adapter.clone(),
            config.autonomy.level,
            CircuitBreaker::new(config.autonomy.breaker.count, config.breaker_window()),
            config.autonomy.rate_per_min,
            config.autonomy.max_cidr,
        );

        Ok(Arc::new(Self {
            config: parking_lot::RwLock::new(Arc::new(config)),
            store,
            registry,
            adapter: parking_lot::RwLock::new(adapter),
            deploy,
            autonomy,
            bus,
            never_block,
            probe,
            indicators: IndicatorSet::new(),
            translator,
            started_at: Utc::now(),
        }))
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn adapter(&self) -> Arc<dyn BackendAdapter> {
        self.adapter.read().clone()
    }

    // ------------------------------------------------------------------
    // propose / approve / reject
    // ------------------------------------------------------------------

    /// Natural-language path: the external translator drafts, the normal
    /// validation pipeline judges.
    pub async fn propose_text(&self, text: String) -> CoreResult<Proposal> {
        log::info!("facade: propose (text, {} chars)", text.len());
        let translator = self
            .translator
            .clone()
            .ok_or_else(|| CoreError::validation("no translator endpoint is configured"))?;

        let adapter = self.adapter();
        let context = tokio::task::spawn_blocking(move || adapter.list_rules())
            .await
            .map_err(|e| CoreError::integrity(e.to_string()))?
            .map(|rules| {
                rules
                    .iter()
                    .map(|r| r.text.clone())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let draft = tokio::task::spawn_blocking(move || translator.draft(&text, &context))
            .await
            .map_err(|e| CoreError::integrity(e.to_string()))??;
        let explanation = draft.explanation.clone();
        self.propose_rule(draft.rule.into_policy_rule(), Some(explanation))
            .await
    }

    /// Structured path: validate, capability-check, render, dry-run, conflict
    /// analyze, persist as pending-approval.
    pub async fn propose_rule(
        &self,
        rule: PolicyRule,
        explanation: Option<String>,
    ) -> CoreResult<Proposal> {
        // one correlation id per call; it lands in the audit rows and on any
        // error this call returns
        let correlation = Uuid::new_v4();
        self.propose_rule_inner(rule, explanation, correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))
    }

    async fn propose_rule_inner(
        &self,
        rule: PolicyRule,
        explanation: Option<String>,
        correlation: Uuid,
    ) -> CoreResult<Proposal> {
        log::info!("facade: propose {}", rule.summary());
        policy::validate_rule(&rule)?;

        let adapter = self.adapter();
        if let Some(missing) = adapter.capabilities().missing_for(&rule) {
            return Err(CoreError::validation(format!(
                "backend {} does not support {}",
                adapter.name(),
                missing
            )));
        }

        let rendered = adapter.render(&rule)?;

        let verdict = {
            let adapter = adapter.clone();
            let rule = rule.clone();
            tokio::time::timeout(
                constants::ADAPTER_CALL_TIMEOUT,
                tokio::task::spawn_blocking(move || {
                    let image = adapter.render_image(std::slice::from_ref(&rule))?;
                    adapter.validate(&image)
                }),
            )
            .await
            .map_err(|_| {
                CoreError::adapter(crate::logic::error::AdapterError::transient(
                    "validation timed out",
                ))
            })?
            .map_err(|e| CoreError::integrity(e.to_string()))??
        };

        let existing: Vec<ExistingRule> = self
            .store
            .active_rules()
            .await?
            .into_iter()
            .enumerate()
            .map(|(position, (_, rule))| ExistingRule { rule, position })
            .collect();
        let conflicts =
            conflict::analyze(&rule, &existing, adapter.capabilities().evaluation_order);
        if !conflicts.is_clean() {
            log::warn!(
                "proposal for {} has {} conflict findings",
                rule.summary(),
                conflicts.findings.len()
            );
        }

        let mut proposal = Proposal::new(rule, adapter.name());
        proposal.rendered = Some(rendered);
        proposal.verdict = Some(verdict);
        proposal.conflicts = conflicts;
        proposal.explanation = explanation;
        proposal.state = ProposalState::PendingApproval;
        self.store.insert_proposal(&proposal, Some(correlation)).await?;
        self.bus.publish_lifecycle(LifecycleNotice::new(
            "proposal-created",
            proposal.id,
            proposal.rule.summary(),
        ));
        Ok(proposal)
    }

    pub async fn approve(&self, proposal_id: Uuid) -> CoreResult<Deployment> {
        log::info!("facade: approve {}", proposal_id);
        let correlation = Uuid::new_v4();
        self.approve_inner(proposal_id, correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))
    }

    async fn approve_inner(
        &self,
        proposal_id: Uuid,
        correlation: Uuid,
    ) -> CoreResult<Deployment> {
        let mut proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| CoreError::not_found("proposal", proposal_id))?;
        if proposal.state != ProposalState::PendingApproval {
            return Err(CoreError::validation(format!(
                "proposal {} is {}, not awaiting approval",
                proposal_id,
                proposal.state.as_str()
            )));
        }
        if !proposal.verdict.as_ref().map(|v| v.valid).unwrap_or(false) {
            return Err(CoreError::validation(
                "proposal failed validation and cannot be approved",
            ));
        }
        proposal.state = ProposalState::Approved;
        self.store
            .update_proposal(
                &proposal,
                AuditKind::ProposalApproved,
                "approved by consumer",
                Some(correlation),
            )
            .await?;
        // the controller stamps the apply attempt with its own id
        self.deploy.deploy(proposal.id).await
    }

    pub async fn reject(&self, proposal_id: Uuid) -> CoreResult<Proposal> {
        log::info!("facade: reject {}", proposal_id);
        let correlation = Uuid::new_v4();
        let mut proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| CoreError::not_found("proposal", proposal_id))?;
        if proposal.state.is_terminal() {
            return Err(CoreError::validation(format!(
                "proposal {} already {}",
                proposal_id,
                proposal.state.as_str()
            )));
        }
        proposal.state = ProposalState::Rejected;
        self.store
            .update_proposal(
                &proposal,
                AuditKind::ProposalRejected,
                "rejected by consumer",
                Some(correlation),
            )
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        self.bus.publish_lifecycle(LifecycleNotice::new(
            "proposal-rejected",
            proposal.id,
            "",
        ));
        Ok(proposal)
    }

    /// Cancel an approved-but-not-yet-applied proposal waiting in the queue.
    pub async fn cancel_queued(&self, proposal_id: Uuid) -> CoreResult<Proposal> {
        log::info!("facade: cancel queued {}", proposal_id);
        let correlation = Uuid::new_v4();
        let mut proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| CoreError::not_found("proposal", proposal_id))?;
        if proposal.state != ProposalState::Approved {
            return Err(CoreError::validation(format!(
                "proposal {} is {}, not queued",
                proposal_id,
                proposal.state.as_str()
            )));
        }
        if self.store.deployment_for_proposal(proposal_id).await?.is_some() {
            return Err(CoreError::concurrency(
                "proposal already reached the controller; roll the deployment back instead",
            ));
        }
        proposal.state = ProposalState::Superseded;
        self.store
            .update_proposal(
                &proposal,
                AuditKind::ProposalSuperseded,
                "cancelled while queued",
                Some(correlation),
            )
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        Ok(proposal)
    }

    // ------------------------------------------------------------------
    // deployment lifecycle
    // ------------------------------------------------------------------

    pub async fn commit(&self, deployment_id: Uuid) -> CoreResult<Deployment> {
        log::info!("facade: commit {}", deployment_id);
        self.deploy.commit(deployment_id).await
    }

    pub async fn rollback(&self, deployment_id: Uuid) -> CoreResult<Deployment> {
        log::info!("facade: rollback {}", deployment_id);
        self.deploy.rollback(deployment_id).await
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    pub async fn list_rules(&self) -> CoreResult<Vec<RenderedRule>> {
        let adapter = self.adapter();
        let rules = tokio::task::spawn_blocking(move || adapter.list_rules())
            .await
            .map_err(|e| CoreError::integrity(e.to_string()))??;
        Ok(rules)
    }

    pub async fn import_rules(&self) -> CoreResult<ImportResult> {
        log::info!("facade: import rules");
        let adapter = self.adapter();
        let result = tokio::task::spawn_blocking(move || adapter.import_rules())
            .await
            .map_err(|e| CoreError::integrity(e.to_string()))??;
        Ok(result)
    }

    pub async fn proposals(&self, state: Option<ProposalState>) -> CoreResult<Vec<Proposal>> {
        self.store.list_proposals(state).await
    }

    pub async fn proposal(&self, id: Uuid) -> CoreResult<Proposal> {
        self.store
            .get_proposal(id)
            .await?
            .ok_or_else(|| CoreError::not_found("proposal", id))
    }

    pub async fn deployment(&self, id: Uuid) -> CoreResult<Deployment> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("deployment", id))
    }

    /// Catch-up page plus a live receiver; the cursor orders the handoff.
    pub async fn subscribe_events(
        &self,
        since: Option<i64>,
    ) -> CoreResult<(Vec<(i64, SecurityEvent)>, broadcast::Receiver<StreamItem>)> {
        let receiver = self.bus.subscribe();
        let backlog = self.store.events_since(since.unwrap_or(0), 1000).await?;
        Ok((backlog, receiver))
    }

    pub async fn daemon_status(&self) -> CoreResult<DaemonStatus> {
        let adapter = self.adapter();
        let health = {
            let adapter = adapter.clone();
            tokio::task::spawn_blocking(move || adapter.health())
                .await
                .map_err(|e| CoreError::integrity(e.to_string()))?
        };
        let pending = self
            .store
            .list_proposals(Some(ProposalState::PendingApproval))
            .await?
            .len();
        let active = self.store.active_rules().await?.len();

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        Ok(DaemonStatus {
            version: constants::APP_VERSION.to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            backend: adapter.name().to_string(),
            backend_health: health,
            autonomy_level: self.autonomy.level(),
            breaker_tripped: self.autonomy.breaker_tripped(),
            pending_proposals: pending,
            active_rules: active,
            feed_indicators: self.indicators.len(),
            never_block_entries: self.never_block.entries().len(),
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
        })
    }

    // ------------------------------------------------------------------
    // operator controls
    // ------------------------------------------------------------------

    pub async fn autonomy_set_level(&self, level: AutonomyLevel) -> CoreResult<()> {
        log::info!("facade: autonomy level -> {}", level.as_str());
        self.autonomy.set_level(level).await
    }

    pub async fn never_block_add(&self, entry_text: &str) -> CoreResult<NeverBlockEntry> {
        log::info!("facade: never-block add {}", entry_text);
        let correlation = Uuid::new_v4();
        let entry = NeverBlockEntry::parse(entry_text)?;
        self.store
            .never_block_insert(
                &entry.display(),
                entry.kind_str(),
                "operator",
                Some(correlation),
            )
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        self.never_block.add(entry.clone());
        Ok(entry)
    }

    pub async fn never_block_remove(&self, entry_text: &str) -> CoreResult<bool> {
        log::info!("facade: never-block remove {}", entry_text);
        let correlation = Uuid::new_v4();
        let display = NeverBlockEntry::parse(entry_text)
            .map(|e| e.display())
            .unwrap_or_else(|_| entry_text.to_string());
        let removed_row = self
            .store
            .never_block_delete(&display, Some(correlation))
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        let removed_mem = self.never_block.remove(&display);
        Ok(removed_row || removed_mem)
    }

    /// Inbound heartbeat witness (POST /probe).
    pub fn probe_witness(&self) {
        self.probe.record_inbound();
    }

    /// SIGHUP: swap in a new config snapshot without touching in-flight
    /// deployments. Sources and pollers pick the new values up on restart.
    pub async fn reload(&self, fresh: Config) -> CoreResult<()> {
        let correlation = Uuid::new_v4();
        self.reload_inner(fresh, correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))
    }

    async fn reload_inner(&self, fresh: Config, correlation: Uuid) -> CoreResult<()> {
        if fresh.backend.name != self.config.read().backend.name {
            let mut options: BackendOptions = fresh.backend.options.clone();
            options
                .entry("backup_dir".into())
                .or_insert_with(|| fresh.backup_dir().to_string_lossy().to_string());
            self.activate_backend(&fresh.backend.name, &options)?;
        }
        let mut entries = Vec::new();
        for text in &fresh.never_block.entries {
            entries.push(NeverBlockEntry::parse(text)?);
        }
        for row in self.store.never_block_rows().await? {
            if let Ok(entry) = NeverBlockEntry::parse(&row.entry) {
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        self.never_block.replace_entries(entries);
        self.probe.set_mode(fresh.deploy.heartbeat.probe.to_mode()?);
        self.autonomy.set_level(fresh.autonomy.level).await?;
        *self.config.write() = Arc::new(fresh);
        self.store
            .append_audit(
                AuditKind::ConfigReloaded,
                None,
                "SIGHUP reload",
                None,
                Some(correlation),
            )
            .await?;
        log::info!("configuration reloaded");
        Ok(())
    }

    /// Switch the active backend. Refused with `coexistence` when the new
    /// adapter collides with the current kernel subsystem.
    pub fn activate_backend(&self, name: &str, options: &BackendOptions) -> CoreResult<()> {
        let adapter = self.registry.activate(name, options)?;
        *self.adapter.write() = adapter.clone();
        self.deploy.set_adapter(adapter.clone());
        self.autonomy.set_adapter(adapter);
        Ok(())
    }

    /// Graceful drain for SIGTERM: stop intake, settle in-flight work.
    pub async fn drain(&self, shutdown: &Shutdown) -> CoreResult<()> {
        log::info!("facade: draining");
        shutdown.trigger();
        // roll back anything still on probation; committed rules stay
        let probation = self
            .store
            .deployments_in_state(crate::logic::store::DeploymentState::Probation)
            .await?;
        for deployment in probation {
            if let Err(err) = self.deploy.rollback(deployment.id).await {
                log::error!("drain rollback {} failed: {}", deployment.id, err);
            }
        }
        self.store.close().await;
        Ok(())
    }
}

/// Status snapshot for consumers and the SIGUSR1 dump.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub backend: String,
    pub backend_health: AdapterHealth,
    pub autonomy_level: AutonomyLevel,
    pub breaker_tripped: bool,
    pub pending_proposals: usize,
    pub active_rules: usize,
    pub feed_indicators: usize,
    pub never_block_entries: usize,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::backend::mock;
    use crate::logic::policy::{Action, AddrSpec, Direction, Origin, PortSpec, Protocol};
    use crate::logic::store::DeploymentState;

    async fn facade() -> Arc<Facade> {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut registry = AdapterRegistry::new();
        registry.register("mock-a", mock::construct_netfilter_a);
        let mut config = Config::default();
        config.backend.name = "mock-a".into();
        config.deploy.heartbeat.probe = crate::logic::config::ProbeConfig::Word("disabled".into());
        config.never_block.management_discovery = false;
        Facade::build_with_registry(config, store, registry)
            .await
            .unwrap()
    }

    fn drop_rule(src: &str) -> PolicyRule {
        let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::User);
        rule.source = Some(AddrSpec::Network(src.parse().unwrap()));
        rule.protocol = Protocol::Tcp;
        rule.destination_port = Some(PortSpec::Single(22));
        rule
    }

    #[tokio::test]
    async fn propose_approve_commit_flow() {
        let facade = facade().await;
        let proposal = facade
            .propose_rule(drop_rule("203.0.113.7/32"), None)
            .await
            .unwrap();
        assert_eq!(proposal.state, ProposalState::PendingApproval);
        assert!(proposal.rendered.is_some());

        let deployment = facade.approve(proposal.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Probation);

        let committed = facade.commit(deployment.id).await.unwrap();
        assert_eq!(committed.state, DeploymentState::Committed);
        assert_eq!(facade.list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reject_leaves_ruleset_untouched() {
        let facade = facade().await;
        let before = facade.list_rules().await.unwrap();

        let proposal = facade
            .propose_rule(drop_rule("198.51.100.9/32"), None)
            .await
            .unwrap();
        let rejected = facade.reject(proposal.id).await.unwrap();
        assert_eq!(rejected.state, ProposalState::Rejected);
        assert_eq!(facade.list_rules().await.unwrap(), before);

        // terminal: cannot approve afterwards
        assert!(facade.approve(proposal.id).await.is_err());
    }

    #[tokio::test]
    async fn invalid_rule_is_refused_up_front() {
        let facade = facade().await;
        let mut rule = drop_rule("203.0.113.7/32");
        rule.comment = Some("x; nft flush ruleset".into());
        let err = facade.propose_rule(rule, None).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(facade.proposals(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflict_report_is_attached_but_not_blocking() {
        let facade = facade().await;
        let first = facade
            .propose_rule(drop_rule("203.0.113.7/32"), None)
            .await
            .unwrap();
        let deployment = facade.approve(first.id).await.unwrap();
        facade.commit(deployment.id).await.unwrap();

        // identical rule: redundant, yet still proposable and approvable
        let second = facade
            .propose_rule(drop_rule("203.0.113.7/32"), None)
            .await
            .unwrap();
        assert!(!second.conflicts.is_clean());
        let deployment = facade.approve(second.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Probation);
    }

    #[tokio::test]
    async fn never_block_round_trip() {
        let facade = facade().await;
        facade.never_block_add("10.0.0.1").await.unwrap();
        assert_eq!(facade.never_block.entries().len(), 1);
        assert!(facade.never_block_remove("10.0.0.1").await.unwrap());
        assert!(facade.never_block.entries().is_empty());
    }

    #[tokio::test]
    async fn status_reports_the_essentials() {
        let facade = facade().await;
        let status = facade.daemon_status().await.unwrap();
        assert_eq!(status.backend, "mock-a");
        assert!(!status.breaker_tripped);
        assert_eq!(status.active_rules, 0);
    }

    #[tokio::test]
    async fn subscribe_returns_backlog_and_live_handle() {
        let facade = facade().await;
        let event = SecurityEvent::new(
            "sshd",
            crate::logic::events::EventKind::AuthFail,
            crate::logic::events::EventSeverity::Medium,
            "line",
        );
        facade.store().record_event(&event).await.unwrap();

        let (backlog, _rx) = facade.subscribe_events(None).await.unwrap();
        assert_eq!(backlog.len(), 1);
        let (after, _rx) = facade.subscribe_events(Some(backlog[0].0)).await.unwrap();
        assert!(after.is_empty());
    }
}

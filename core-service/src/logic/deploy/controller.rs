//! Deployment state machine
//!
//! ```text
//! approved ──apply──▶ applying ──ok──▶ probation ──heartbeat-ok──▶ committed
//!                          │                 │
//!                          │                 └──heartbeat-miss──▶ rolled-back
//!                          └──error──▶ failed
//! ```
//!
//! The per-backend lock is held from apply until the deployment leaves
//! probation, so exactly one deployment is in `applying|probation` at a time
//! and further approvals queue FIFO behind it. The snapshot is persisted with
//! the deployment record before `apply_atomic` runs; rollback is one atomic
//! restore, never flush-then-load.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::constants;
use crate::logic::backend::{BackendAdapter, BackupRef, DeltaOp};
use crate::logic::deploy::heartbeat::HeartbeatProbe;
use crate::logic::deploy::{DeployTuning, SafetySwitch};
use crate::logic::error::{AdapterError, CoreError, CoreResult};
use crate::logic::events::bus::CausalWindow;
use crate::logic::events::{EventBus, LifecycleNotice};
use crate::logic::never_block::NeverBlockList;
use crate::logic::policy::{AddrSpec, PolicyRule};
use crate::logic::store::{AuditKind, Deployment, DeploymentState, ProposalState, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorCmd {
    Run,
    Wake,
}

pub struct DeployController {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    never_block: Arc<NeverBlockList>,
    adapter: parking_lot::RwLock<Arc<dyn BackendAdapter>>,
    probe: Arc<HeartbeatProbe>,
    safety: Arc<SafetySwitch>,
    tuning: DeployTuning,
    /// Per-backend exclusive lock; one active backend per host, one lock.
    backend_lock: Arc<Mutex<()>>,
    /// Serializes state transitions so a probe miss and an explicit commit
    /// cannot both win.
    transitions: Mutex<()>,
    monitors: parking_lot::Mutex<HashMap<Uuid, watch::Sender<MonitorCmd>>>,
}

impl DeployController {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        never_block: Arc<NeverBlockList>,
        adapter: Arc<dyn BackendAdapter>,
        probe: Arc<HeartbeatProbe>,
        safety: Arc<SafetySwitch>,
        tuning: DeployTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            never_block,
            adapter: parking_lot::RwLock::new(adapter),
            probe,
            safety,
            tuning,
            backend_lock: Arc::new(Mutex::new(())),
            transitions: Mutex::new(()),
            monitors: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn set_adapter(&self, adapter: Arc<dyn BackendAdapter>) {
        *self.adapter.write() = adapter;
    }

    pub fn safety(&self) -> Arc<SafetySwitch> {
        self.safety.clone()
    }

    fn adapter(&self) -> Arc<dyn BackendAdapter> {
        self.adapter.read().clone()
    }

    // ------------------------------------------------------------------
    // apply path
    // ------------------------------------------------------------------

    /// Deploy an approved proposal. Queues FIFO behind any in-flight
    /// deployment of this backend; the returned record is in `probation`.
    pub async fn deploy(self: &Arc<Self>, proposal_id: Uuid) -> CoreResult<Deployment> {
        // one correlation id per attempt, shared by the audit rows and any
        // error this attempt surfaces
        let correlation = Uuid::new_v4();
        self.deploy_inner(proposal_id, correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))
    }

    async fn deploy_inner(
        self: &Arc<Self>,
        proposal_id: Uuid,
        correlation: Uuid,
    ) -> CoreResult<Deployment> {
        // (1) per-backend exclusive lock, bounded wait
        let guard = tokio::time::timeout(
            self.tuning.lock_timeout,
            self.backend_lock.clone().lock_owned(),
        )
        .await
        .map_err(|_| {
            CoreError::concurrency("timed out waiting for the backend lock")
        })?;

        // Approval may have been cancelled while queued.
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| CoreError::not_found("proposal", proposal_id))?;
        if proposal.state != ProposalState::Approved {
            return Err(CoreError::concurrency(format!(
                "proposal {} left the queue (state {})",
                proposal_id,
                proposal.state.as_str()
            )));
        }

        let adapter = self.adapter();
        let mut deployment = Deployment::new(&proposal);

        // (2) snapshot first, persisted with the record before any mutation
        let backup = adapter_call(adapter.clone(), |a| a.snapshot()).await?;
        deployment.backup_ref = Some(rename_backup(backup, deployment.id));
        self.store
            .insert_deployment(&deployment, Some(correlation))
            .await?;

        // (3) never-block pre-check on the rule about to go live
        if let Some(hit) = self.never_block.match_rule(&proposal.rule) {
            let reason = format!("rule matches never-block entry {}", hit);
            deployment.state = DeploymentState::Failed;
            deployment.failure_reason = Some(reason.clone());
            self.store
                .update_deployment(
                    &deployment,
                    AuditKind::DeploymentFailed,
                    &reason,
                    Some("policy-violation"),
                    Some(correlation),
                )
                .await?;
            return Err(CoreError::policy_violation(reason));
        }

        // (4) apply: delta for additive single-rule changes when supported,
        //     full-image atomic replace otherwise
        let desired = self.desired_rules(Some(proposal.rule.clone())).await?;
        let use_delta = adapter.capabilities().supports_delta_ops;
        let apply_result = if use_delta {
            let rule = proposal.rule.clone();
            adapter_call(adapter.clone(), move |a| {
                let rendered = a.render(&rule)?;
                a.apply_delta(&DeltaOp::Add(rendered))
            })
            .await
        } else {
            let rules = desired.clone();
            adapter_call(adapter.clone(), move |a| {
                let image = a.render_image(&rules)?;
                a.apply_atomic(&image)
            })
            .await
        };

        if let Err(err) = apply_result {
            deployment.state = DeploymentState::Failed;
            deployment.failure_reason = Some(err.to_string());
            self.store
                .update_deployment(
                    &deployment,
                    AuditKind::DeploymentFailed,
                    &err.to_string(),
                    Some(err.kind.as_str()),
                    Some(correlation),
                )
                .await?;
            return Err(err.into());
        }

        // (5) probation, heartbeat armed
        let now = Utc::now();
        deployment.state = DeploymentState::Probation;
        deployment.applied_at = Some(now);
        deployment.heartbeat_deadline = Some(
            now + ChronoDuration::from_std(self.tuning.heartbeat_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(120)),
        );
        self.store
            .update_deployment(
                &deployment,
                AuditKind::DeploymentApplied,
                &proposal.rule.summary(),
                None,
                Some(correlation),
            )
            .await?;
        self.publish_causal_window(&proposal.rule, &deployment);
        self.bus.publish_lifecycle(LifecycleNotice::new(
            "deployment-probation",
            deployment.id,
            proposal.rule.summary(),
        ));

        // (6) monitor owns the backend lock until the deployment leaves
        //     probation
        self.spawn_monitor(deployment.clone(), guard);
        Ok(deployment)
    }

    /// The full rule set that should be live: committed + probation rules
    /// that have not expired, plus an optional candidate.
    async fn desired_rules(&self, extra: Option<PolicyRule>) -> CoreResult<Vec<PolicyRule>> {
        let now = Utc::now();
        let mut rules: Vec<PolicyRule> = self
            .store
            .active_rules()
            .await?
            .into_iter()
            .map(|(_, rule)| rule)
            .filter(|rule| !rule.expired(now))
            .collect();
        if let Some(extra) = extra {
            rules.retain(|r| r.id != extra.id);
            rules.push(extra);
        }
        Ok(rules)
    }

    fn publish_causal_window(&self, rule: &PolicyRule, deployment: &Deployment) {
        let subject = [&rule.source, &rule.destination]
            .into_iter()
            .flatten()
            .find_map(|spec| match spec {
                AddrSpec::Network(net) => Some(*net),
                AddrSpec::Set(_) => None,
            });
        let Some(subject) = subject else { return };
        let until = rule
            .expires_at
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(24));
        self.bus.publish_causal_window(CausalWindow {
            deployment_id: deployment.id,
            subject,
            kinds: Vec::new(),
            until,
        });
    }

    // ------------------------------------------------------------------
    // probation monitor
    // ------------------------------------------------------------------

    fn spawn_monitor(self: &Arc<Self>, deployment: Deployment, guard: OwnedMutexGuard<()>) {
        let (tx, rx) = watch::channel(MonitorCmd::Run);
        self.monitors.lock().insert(deployment.id, tx);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.monitor_loop(deployment, rx).await;
            drop(guard);
        });
    }

    async fn monitor_loop(
        self: Arc<Self>,
        deployment: Deployment,
        mut rx: watch::Receiver<MonitorCmd>,
    ) {
        let id = deployment.id;
        let mut interval = tokio::time::interval(self.tuning.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                result = rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                    // woken by an external commit/rollback; fall through to
                    // re-read state
                }
            }

            let current = match self.store.get_deployment(id).await {
                Ok(Some(d)) => d,
                _ => break,
            };
            if current.state.is_terminal() {
                break;
            }

            let deadline = current.heartbeat_deadline.unwrap_or_else(Utc::now);
            let now = Utc::now();

            if self.probe.check().await {
                let mut touched = current.clone();
                touched.last_heartbeat_at = Some(now);
                if let Err(err) = self.store.touch_deployment(&touched).await {
                    log::warn!("heartbeat touch failed for {}: {}", id, err);
                }
                // probation elapsed with every probe green
                if now >= deadline {
                    let correlation = Uuid::new_v4();
                    let _ = self
                        .finalize_commit(id, "probation elapsed, probes green", correlation)
                        .await;
                    break;
                }
            } else {
                // a single red probe fails closed, deadline or not; the miss
                // and its rollback share one correlation id
                log::warn!("deployment {}: heartbeat miss, rolling back", id);
                let correlation = Uuid::new_v4();
                let miss = CoreError::heartbeat_miss(
                    "reachability probe failed during probation",
                )
                .with_correlation(correlation);
                let _ = self
                    .store
                    .append_audit(
                        AuditKind::HeartbeatMiss,
                        Some(id),
                        miss.message(),
                        Some(miss.kind()),
                        miss.correlation_id(),
                    )
                    .await;
                let _ = self.rollback_inner(id, "heartbeat miss", correlation).await;
                break;
            }
        }

        self.monitors.lock().remove(&id);
    }

    fn nudge_monitor(&self, id: Uuid) {
        if let Some(tx) = self.monitors.lock().get(&id) {
            let _ = tx.send(MonitorCmd::Wake);
        }
    }

    // ------------------------------------------------------------------
    // commit / rollback
    // ------------------------------------------------------------------

    /// Explicit consumer commit, or the monitor's own green-deadline commit.
    pub async fn commit(&self, id: Uuid) -> CoreResult<Deployment> {
        let correlation = Uuid::new_v4();
        let deployment = self
            .finalize_commit(id, "committed by consumer", correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        self.nudge_monitor(id);
        Ok(deployment)
    }

    async fn finalize_commit(
        &self,
        id: Uuid,
        detail: &str,
        correlation: Uuid,
    ) -> CoreResult<Deployment> {
        let _t = self.transitions.lock().await;
        let mut deployment = self
            .store
            .get_deployment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("deployment", id))?;
        if deployment.state == DeploymentState::Committed {
            return Ok(deployment);
        }
        if deployment.state != DeploymentState::Probation {
            return Err(CoreError::concurrency(format!(
                "deployment {} is {}, not in probation",
                id,
                deployment.state.as_str()
            )));
        }
        deployment.state = DeploymentState::Committed;
        self.store
            .update_deployment(
                &deployment,
                AuditKind::DeploymentCommitted,
                detail,
                None,
                Some(correlation),
            )
            .await?;
        // backup is not needed once committed
        if let Some(backup) = &deployment.backup_ref {
            let _ = std::fs::remove_file(&backup.path);
        }
        self.bus.publish_lifecycle(LifecycleNotice::new(
            "deployment-committed",
            deployment.id,
            detail,
        ));
        Ok(deployment)
    }

    /// Consumer rollback; also what cancellation of an in-probation
    /// deployment means.
    pub async fn rollback(&self, id: Uuid) -> CoreResult<Deployment> {
        let correlation = Uuid::new_v4();
        let deployment = self
            .rollback_inner(id, "rollback requested", correlation)
            .await
            .map_err(|e| e.with_correlation(correlation))?;
        self.nudge_monitor(id);
        Ok(deployment)
    }

    async fn rollback_inner(
        &self,
        id: Uuid,
        detail: &str,
        correlation: Uuid,
    ) -> CoreResult<Deployment> {
        let _t = self.transitions.lock().await;
        let mut deployment = self
            .store
            .get_deployment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("deployment", id))?;
        if deployment.state == DeploymentState::RolledBack {
            return Ok(deployment);
        }
        if deployment.state.is_terminal() {
            return Err(CoreError::concurrency(format!(
                "deployment {} already {}",
                id,
                deployment.state.as_str()
            )));
        }

        let Some(backup) = deployment.backup_ref.clone() else {
            return self
                .catastrophic(
                    deployment,
                    "no backup reference at rollback time",
                    "integrity",
                    correlation,
                )
                .await;
        };

        let adapter = self.adapter();
        let backup_for_call = backup.clone();
        match adapter_call(adapter, move |a| a.restore(&backup_for_call)).await {
            Ok(true) => {
                deployment.state = DeploymentState::RolledBack;
                deployment.failure_reason = Some(detail.to_string());
                self.store
                    .update_deployment(
                        &deployment,
                        AuditKind::RollbackOk,
                        detail,
                        None,
                        Some(correlation),
                    )
                    .await?;
                self.bus.retract_causal_window(deployment.id);
                self.bus.publish_lifecycle(LifecycleNotice::new(
                    "deployment-rolled-back",
                    deployment.id,
                    detail,
                ));
                Ok(deployment)
            }
            Ok(false) => {
                self.catastrophic(
                    deployment,
                    "backup missing at rollback time",
                    "integrity",
                    correlation,
                )
                .await
            }
            Err(err) => {
                let message = format!("restore failed: {}", err);
                self.catastrophic(deployment, &message, err.kind.as_str(), correlation)
                    .await
            }
        }
    }

    /// Rollback itself failed: record, trip the safety switch, leave the
    /// deployment for a human.
    async fn catastrophic(
        &self,
        mut deployment: Deployment,
        message: &str,
        error_kind: &str,
        correlation: Uuid,
    ) -> CoreResult<Deployment> {
        deployment.state = DeploymentState::Failed;
        deployment.failure_reason = Some(message.to_string());
        self.store
            .update_deployment(
                &deployment,
                AuditKind::Catastrophic,
                &format!("{}; operator attention required", message),
                Some(error_kind),
                Some(correlation),
            )
            .await?;
        self.safety.trip();
        self.bus.publish_lifecycle(LifecycleNotice::new(
            "deployment-catastrophic",
            deployment.id,
            message,
        ));
        Err(CoreError::catastrophic(message.to_string()).with_correlation(correlation))
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Startup pass: a deployment left in `applying|probation` by a previous
    /// process fails closed into rollback.
    pub async fn recover(self: &Arc<Self>) -> CoreResult<usize> {
        let mut recovered = 0;
        for state in [DeploymentState::Applying, DeploymentState::Probation] {
            for deployment in self.store.deployments_in_state(state).await? {
                log::warn!(
                    "recovering deployment {} left in {}",
                    deployment.id,
                    deployment.state.as_str()
                );
                match self
                    .rollback_inner(deployment.id, "recovered after restart", Uuid::new_v4())
                    .await
                {
                    Ok(_) => recovered += 1,
                    Err(err) => log::error!(
                        "recovery rollback for {} failed: {}",
                        deployment.id,
                        err
                    ),
                }
            }
        }
        Ok(recovered)
    }

    /// Remove expired rules from the live ruleset. Skips the cycle entirely
    /// when a deployment is mid-flight (the lock is busy).
    pub async fn sweep_expired(&self) -> CoreResult<usize> {
        let Ok(_guard) = self.backend_lock.clone().try_lock_owned() else {
            return Ok(0);
        };
        // one correlation id per sweep run
        let correlation = Uuid::new_v4();
        let now = Utc::now();
        let expired: Vec<PolicyRule> = self
            .store
            .active_rules()
            .await?
            .into_iter()
            .map(|(_, rule)| rule)
            .filter(|rule| rule.expired(now))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let adapter = self.adapter();
        if adapter.capabilities().supports_delta_ops {
            for rule in &expired {
                let rule = rule.clone();
                let adapter = adapter.clone();
                adapter_call(adapter, move |a| {
                    let rendered = a.render(&rule)?;
                    a.apply_delta(&DeltaOp::Remove(rendered))
                })
                .await?;
            }
        } else {
            let remaining = self.desired_rules(None).await?;
            adapter_call(adapter, move |a| {
                let image = a.render_image(&remaining)?;
                a.apply_atomic(&image)
            })
            .await?;
        }

        for rule in &expired {
            self.store
                .append_audit(
                    AuditKind::RuleExpired,
                    Some(rule.id),
                    &rule.summary(),
                    None,
                    Some(correlation),
                )
                .await?;
        }
        Ok(expired.len())
    }

    /// Delete backups older than the retention window (commit already
    /// removes its own).
    pub fn prune_backups(&self, backup_dir: &std::path::Path) {
        let cutoff =
            std::time::SystemTime::now() - std::time::Duration::from_secs(
                self.tuning.backup_retain_days.max(0) as u64 * 86_400,
            );
        let Ok(entries) = std::fs::read_dir(backup_dir) else { return };
        for entry in entries.flatten() {
            let keep = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|t| t >= cutoff)
                .unwrap_or(true);
            if !keep {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Bound, retried, timed adapter invocation off the async path.
async fn adapter_call<T, F>(adapter: Arc<dyn BackendAdapter>, op: F) -> Result<T, AdapterError>
where
    F: Fn(&dyn BackendAdapter) -> Result<T, AdapterError> + Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        let adapter = adapter.clone();
        let op_run = op.clone();
        let joined = tokio::time::timeout(
            constants::ADAPTER_CALL_TIMEOUT,
            tokio::task::spawn_blocking(move || op_run(adapter.as_ref())),
        )
        .await;
        let outcome = match joined {
            Err(_) => Err(AdapterError::transient("adapter call timed out")),
            Ok(Err(join_err)) => Err(AdapterError::system(join_err.to_string())),
            Ok(Ok(result)) => result,
        };
        match outcome {
            Err(err)
                if err.kind.is_retryable()
                    && attempt + 1 < constants::ADAPTER_RETRY_ATTEMPTS =>
            {
                attempt += 1;
                tokio::time::sleep(constants::ADAPTER_RETRY_BACKOFF * attempt).await;
            }
            other => return other,
        }
    }
}

/// Backups are named by (timestamp, deployment id); the adapter produced a
/// provisional name before the deployment record existed.
fn rename_backup(backup: BackupRef, deployment_id: Uuid) -> BackupRef {
    let path = std::path::Path::new(&backup.path);
    let Some(dir) = path.parent() else { return backup };
    let renamed = dir.join(format!(
        "backup_{}_{}.nft",
        backup.taken_at.format("%Y%m%d_%H%M%S"),
        deployment_id
    ));
    match std::fs::rename(path, &renamed) {
        Ok(()) => BackupRef {
            path: renamed.to_string_lossy().to_string(),
            ..backup
        },
        Err(_) => backup,
    }
}

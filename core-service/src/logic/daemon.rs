//! Daemon wiring
//!
//! Spawns and supervises the long-running tasks: the bus pump, the
//! correlator, the autonomy controller, one task per log source, the feed
//! pollers, and the expiry sweep. Crashed sources restart with exponential
//! backoff; a stalled source never blocks the rest. One shutdown channel
//! drains everything.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::constants;
use crate::logic::correlator::Correlator;
use crate::logic::events::sources::{SourceContext, TailSource};
use crate::logic::events::{EventKind, EventSeverity, SecurityEvent};
use crate::logic::facade::Facade;
use crate::logic::intel::FeedPoller;

// ============================================================================
// SHUTDOWN
// ============================================================================

/// Cancellation signal propagated to every task.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// DAEMON
// ============================================================================

pub struct Daemon {
    facade: Arc<Facade>,
    shutdown: Arc<Shutdown>,
}

impl Daemon {
    pub fn new(facade: Arc<Facade>) -> Self {
        Self { facade, shutdown: Arc::new(Shutdown::new()) }
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    /// Spawn every background task. Returns once everything is launched;
    /// tasks run until the shutdown channel fires.
    pub async fn start(&self) -> crate::logic::error::CoreResult<()> {
        let facade = &self.facade;

        // deployments left mid-flight by a previous process fail closed
        let recovered = facade.deploy.recover().await?;
        if recovered > 0 {
            log::warn!("rolled back {} deployments found mid-flight at startup", recovered);
        }

        let (event_tx, event_rx) = mpsc::channel::<SecurityEvent>(1024);
        let (assess_tx, assess_rx) = mpsc::channel(64);

        self.spawn_bus_pump(event_tx);

        // correlator: single consumer keeps scoring deterministic
        let correlator = Correlator::new(facade.bus.clone(), facade.translator.clone())
            .with_indicators(facade.indicators.clone());
        tokio::spawn(correlator.run(event_rx, assess_tx, self.shutdown.subscribe()));

        tokio::spawn(
            facade
                .autonomy
                .clone()
                .run(assess_rx, self.shutdown.subscribe()),
        );

        self.spawn_sources();
        self.spawn_feed_pollers();
        self.spawn_maintenance();

        log::info!("daemon tasks started");
        Ok(())
    }

    /// Single consumer of the bus queues: persist, fan out, forward.
    fn spawn_bus_pump(&self, event_tx: mpsc::Sender<SecurityEvent>) {
        let facade = self.facade.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let events = tokio::select! {
                    events = facade.bus.drained() => events,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                for event in events {
                    if let Err(err) = facade.store().record_event(&event).await {
                        log::error!("event persist failed: {}", err);
                    }
                    facade.bus.forward_to_subscribers(&event);
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// One supervised task per enabled source; restart with backoff on any
    /// error or panic.
    fn spawn_sources(&self) {
        let config = self.facade.config();
        let ctx = SourceContext {
            bus: self.facade.bus.clone(),
            store: self.facade.store(),
        };

        for (name, source_config) in &config.sources {
            if !source_config.enabled {
                log::info!("source {} disabled", name);
                continue;
            }
            let source = Arc::new(TailSource::new(
                name.clone(),
                source_config.path.clone(),
                source_config.parser,
            ));
            let ctx = ctx.clone();
            let shutdown = self.shutdown.clone();
            let bus = self.facade.bus.clone();
            let name = name.clone();
            tokio::spawn(async move {
                supervise(&name, shutdown, Some(bus), move |stop| {
                    let source = source.clone();
                    let ctx = ctx.clone();
                    async move { source.run(&ctx, stop).await }
                })
                .await;
            });
        }
    }

    fn spawn_feed_pollers(&self) {
        let config = self.facade.config();
        for spec in config.feed_specs() {
            let poller = FeedPoller::new(
                spec,
                config.feed_cache_dir(),
                self.facade.bus.clone(),
                self.facade.indicators.clone(),
            );
            let stop = self.shutdown.subscribe();
            tokio::spawn(async move { poller.run(stop).await });
        }
    }

    /// Expiry sweep, event retention, backup retention.
    fn spawn_maintenance(&self) {
        let facade = self.facade.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(constants::EXPIRY_SWEEP_INTERVAL);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = sweep.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match facade.deploy.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("expired {} rules out of the live ruleset", n),
                    Err(err) => log::warn!("expiry sweep failed: {}", err),
                }

                // retention work roughly hourly
                ticks += 1;
                if ticks % 120 == 0 {
                    let config = facade.config();
                    match facade.store().prune_events(config.store.retain_days).await {
                        Ok(0) => {}
                        Ok(n) => log::info!("pruned {} events past retention", n),
                        Err(err) => log::warn!("event pruning failed: {}", err),
                    }
                    facade.deploy.prune_backups(&config.backup_dir());
                }
            }
        });
    }
}

/// Run a task factory forever, restarting on error/panic with exponential
/// backoff and announcing failures on the bus via a source-error event.
async fn supervise<F, Fut>(
    name: &str,
    shutdown: Arc<Shutdown>,
    bus: Option<Arc<crate::logic::events::EventBus>>,
    factory: F,
) where
    F: Fn(watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = crate::logic::error::CoreResult<()>> + Send + 'static,
{
    let mut backoff = constants::RESTART_BACKOFF_BASE;
    loop {
        if shutdown.is_triggered() {
            return;
        }
        let handle = tokio::spawn(factory(shutdown.subscribe()));
        match handle.await {
            Ok(Ok(())) => {
                // clean exit means shutdown
                return;
            }
            Ok(Err(err)) => {
                log::warn!("source {} failed: {}; restarting in {:?}", name, err, backoff);
                if let Some(bus) = &bus {
                    bus.publish(source_error_event(name, &err));
                }
            }
            Err(join_err) => {
                log::error!(
                    "source {} panicked: {}; restarting in {:?}",
                    name,
                    join_err,
                    backoff
                );
                if let Some(bus) = &bus {
                    bus.publish(source_error_event(name, &join_err));
                }
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(constants::RESTART_BACKOFF_CAP);
    }
}

fn source_error_event(name: &str, err: &dyn std::fmt::Display) -> SecurityEvent {
    SecurityEvent::new(
        name,
        EventKind::SourceError,
        EventSeverity::Low,
        format!("source failed and will restart: {}", err),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn supervisor_restarts_failing_tasks_with_backoff() {
        let shutdown = Arc::new(Shutdown::new());
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_in = attempts.clone();
        let shutdown_in = shutdown.clone();
        let supervisor = tokio::spawn(async move {
            supervise("test", shutdown_in.clone(), None, move |_stop| {
                let attempts = attempts_in.clone();
                let shutdown = shutdown_in.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n >= 2 {
                        shutdown.trigger();
                        return Ok(());
                    }
                    Err(crate::logic::error::CoreError::integrity("boom"))
                }
            })
            .await;
        });

        tokio::time::timeout(Duration::from_secs(10), supervisor)
            .await
            .expect("supervisor should finish")
            .unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn brute_force_pipeline_blocks_and_breaks_the_feedback_loop() {
        use crate::logic::autonomy::{AutonomyLevel, AutonomyOutcome};
        use crate::logic::backend::{mock, AdapterRegistry};
        use crate::logic::config::{Config, ProbeConfig};
        use crate::logic::facade::Facade;
        use crate::logic::store::Store;
        use chrono::Utc;

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut registry = AdapterRegistry::new();
        registry.register("mock-a", mock::construct_netfilter_a);
        let mut config = Config::default();
        config.backend.name = "mock-a".into();
        config.autonomy.level = AutonomyLevel::Cautious;
        config.deploy.heartbeat.probe = ProbeConfig::Word("disabled".into());
        config.never_block.management_discovery = false;
        let facade = Facade::build_with_registry(config, store, registry)
            .await
            .unwrap();

        // sixty SSH failures from one host across a minute
        let mut correlator = Correlator::new(facade.bus.clone(), None);
        let start = Utc::now();
        let mut assessment = None;
        for i in 0..60 {
            let event = SecurityEvent::new(
                "sshd",
                EventKind::AuthFail,
                EventSeverity::Medium,
                "Failed password for root from 203.0.113.7 port 50000",
            )
            .with_source_ip("203.0.113.7".parse().unwrap())
            .with_target("sshd:root");
            if let Some(a) = correlator.ingest(&event, start + chrono::Duration::seconds(i)) {
                assessment = Some(a);
            }
        }
        let assessment = assessment.expect("burst escalates");
        assert!(assessment.event_count >= 30, "evidence accumulates across re-assessments");

        let outcome = facade.autonomy.handle(assessment).await.unwrap();
        let AutonomyOutcome::Deployed(deployment) = outcome else {
            panic!("cautious autonomy should deploy on this evidence");
        };
        let committed = facade.commit(deployment.id).await.unwrap();
        assert_eq!(
            committed.state,
            crate::logic::store::DeploymentState::Committed
        );
        let live = facade.list_rules().await.unwrap();
        assert!(live.iter().any(|r| r.text.contains("203.0.113.7/32")));

        // the block's own side effects carry the causal tag and never
        // re-score the subject
        facade.bus.publish(
            SecurityEvent::new(
                "kernel",
                EventKind::PortScanHit,
                EventSeverity::Low,
                "netwarden IN=eth0 SRC=203.0.113.7 DST=10.0.0.5 DPT=22",
            )
            .with_source_ip("203.0.113.7".parse().unwrap()),
        );
        let drained = facade.bus.drain_now();
        assert_eq!(drained[0].causal_tag, Some(deployment.id));
        assert!(correlator.ingest(&drained[0], Utc::now()).is_none());

        let kinds: Vec<String> = facade
            .store()
            .audit_tail(50)
            .await
            .unwrap()
            .iter()
            .map(|r| r.kind.clone())
            .collect();
        assert!(kinds.contains(&"threat-escalated".to_string()));
        assert!(kinds.contains(&"autonomous-applied".to_string()));
        assert!(kinds.contains(&"deployment-committed".to_string()));
    }

    #[tokio::test]
    async fn shutdown_flag_round_trips() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());
        shutdown.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.is_triggered());
    }
}

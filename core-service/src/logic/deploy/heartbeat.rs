//! Reachability probe
//!
//! While a deployment sits in probation the probe must stay green: the host
//! can still reach a configured liveness target, and something outside has
//! recently probed the management endpoint inbound. Environments that cannot
//! arrange either must disable the probe explicitly; an unconfigurable probe
//! fails closed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::constants;

#[derive(Debug, Clone)]
pub enum ProbeMode {
    /// Operator explicitly opted out; probes always pass.
    Disabled,
    /// Outbound TCP connect plus an inbound witness.
    Network {
        /// host:port the host must be able to reach
        liveness_target: Option<String>,
        /// whether an inbound probe stamp is required
        require_inbound: bool,
    },
    #[cfg(test)]
    Scripted(Arc<std::sync::atomic::AtomicBool>),
}

pub struct HeartbeatProbe {
    mode: RwLock<ProbeMode>,
    /// Stamped by the facade whenever POST /probe arrives
    last_inbound: RwLock<Option<DateTime<Utc>>>,
}

impl HeartbeatProbe {
    pub fn new(mode: ProbeMode) -> Arc<Self> {
        Arc::new(Self {
            mode: RwLock::new(mode),
            last_inbound: RwLock::new(None),
        })
    }

    pub fn set_mode(&self, mode: ProbeMode) {
        *self.mode.write() = mode;
    }

    /// Facade-side witness: an external prober reached the management
    /// endpoint through the live ruleset.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Some(Utc::now());
    }

    fn inbound_fresh(&self) -> bool {
        let window = Duration::from_std(constants::HEARTBEAT_PROBE_INTERVAL * 4)
            .unwrap_or_else(|_| Duration::seconds(20));
        self.last_inbound
            .read()
            .map(|at| Utc::now() - at <= window)
            .unwrap_or(false)
    }

    /// One probe round. Anything unconfigured while required counts as a
    /// failure.
    pub async fn check(&self) -> bool {
        let mode = self.mode.read().clone();
        match mode {
            ProbeMode::Disabled => true,
            ProbeMode::Network { liveness_target, require_inbound } => {
                let outbound_ok = match liveness_target {
                    Some(target) => outbound_reachable(&target).await,
                    None => false,
                };
                let inbound_ok = !require_inbound || self.inbound_fresh();
                outbound_ok && inbound_ok
            }
            #[cfg(test)]
            ProbeMode::Scripted(flag) => flag.load(std::sync::atomic::Ordering::SeqCst),
        }
    }
}

async fn outbound_reachable(target: &str) -> bool {
    matches!(
        tokio::time::timeout(
            std::time::Duration::from_secs(3),
            tokio::net::TcpStream::connect(target),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn disabled_probe_always_passes() {
        let probe = HeartbeatProbe::new(ProbeMode::Disabled);
        assert!(probe.check().await);
    }

    #[tokio::test]
    async fn unconfigured_liveness_target_fails_closed() {
        let probe = HeartbeatProbe::new(ProbeMode::Network {
            liveness_target: None,
            require_inbound: false,
        });
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn inbound_witness_required_and_stamped() {
        // loopback listener gives the outbound leg something to hit
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let probe = HeartbeatProbe::new(ProbeMode::Network {
            liveness_target: Some(target),
            require_inbound: true,
        });
        assert!(!probe.check().await, "no inbound stamp yet");

        probe.record_inbound();
        assert!(probe.check().await);
    }

    #[tokio::test]
    async fn scripted_probe_flips() {
        let flag = Arc::new(AtomicBool::new(true));
        let probe = HeartbeatProbe::new(ProbeMode::Scripted(flag.clone()));
        assert!(probe.check().await);
        flag.store(false, Ordering::SeqCst);
        assert!(!probe.check().await);
    }
}

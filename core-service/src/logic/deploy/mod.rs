//! Deployment Controller
//!
//! Atomic apply with snapshot-first ordering, probation heartbeats, and
//! single-transaction rollback.

pub mod controller;
pub mod heartbeat;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::constants;

pub use controller::DeployController;
pub use heartbeat::{HeartbeatProbe, ProbeMode};

/// Tripped when a rollback itself fails. While tripped, the autonomy
/// controller refuses to act regardless of its configured level; only an
/// operator reset clears it.
#[derive(Debug, Default)]
pub struct SafetySwitch {
    catastrophic: AtomicBool,
}

impl SafetySwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.catastrophic.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.catastrophic.store(false, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.catastrophic.load(Ordering::SeqCst)
    }
}

/// Controller knobs, frozen from the config at startup.
#[derive(Debug, Clone)]
pub struct DeployTuning {
    pub lock_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub probe_interval: Duration,
    pub backup_retain_days: i64,
}

impl Default for DeployTuning {
    fn default() -> Self {
        Self {
            lock_timeout: constants::DEFAULT_LOCK_TIMEOUT,
            heartbeat_timeout: constants::DEFAULT_HEARTBEAT_TIMEOUT,
            probe_interval: constants::HEARTBEAT_PROBE_INTERVAL,
            backup_retain_days: constants::DEFAULT_BACKUP_RETAIN_DAYS,
        }
    }
}

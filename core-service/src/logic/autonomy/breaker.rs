//! Circuit breaker and global rate gate
//!
//! The breaker counts daemon-origin deployments in a trailing window; once
//! more than the configured number have landed, the next attempt trips it
//! and autonomy degrades to alert-only until an operator resets it. The rate
//! gate is a plain requests-per-minute ceiling, independent of the breaker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

pub struct CircuitBreaker {
    limit: u32,
    window: Duration,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, tripped: AtomicBool::new(false) }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Evaluate against the deployment count the store reported for the
    /// trailing window. Returns true when this attempt must be suppressed.
    pub fn check(&self, recent_daemon_deployments: u32) -> bool {
        if self.is_tripped() {
            return true;
        }
        if recent_daemon_deployments >= self.limit {
            self.tripped.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Operator reset.
    pub fn reset(&self) {
        self.tripped.store(false, Ordering::SeqCst);
    }
}

/// Global autonomous-rule creation ceiling.
pub struct RateGate {
    per_minute: u32,
    stamps: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateGate {
    pub fn new(per_minute: u32) -> Self {
        Self { per_minute, stamps: Mutex::new(VecDeque::new()) }
    }

    /// Try to take a slot; false means the ceiling is hit.
    pub fn admit(&self, now: DateTime<Utc>) -> bool {
        let mut stamps = self.stamps.lock();
        let cutoff = now - ChronoDuration::seconds(60);
        while stamps.front().map(|t| *t < cutoff).unwrap_or(false) {
            stamps.pop_front();
        }
        if stamps.len() as u32 >= self.per_minute {
            return false;
        }
        stamps.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_trips_at_limit_and_latches() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(600));
        assert!(!breaker.check(4));
        assert!(breaker.check(5), "the attempt after N deployments trips");
        // latched even if the window empties
        assert!(breaker.check(0));
        breaker.reset();
        assert!(!breaker.check(0));
    }

    #[test]
    fn rate_gate_admits_up_to_ceiling_per_minute() {
        let gate = RateGate::new(3);
        let now = Utc::now();
        assert!(gate.admit(now));
        assert!(gate.admit(now));
        assert!(gate.admit(now));
        assert!(!gate.admit(now));
        // a minute later the window has rolled
        assert!(gate.admit(now + ChronoDuration::seconds(61)));
    }
}

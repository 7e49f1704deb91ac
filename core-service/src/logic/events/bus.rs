//! Event Bus
//!
//! Bounded multi-producer queues per source-class drained by a single pump.
//! Under backpressure the low-severity tail is shed first and the shedding
//! itself becomes an event; critical events are never dropped. The bus also
//! stamps causal tags: the deployment controller publishes
//! (subject, kinds, valid-until) windows on apply, and any matching event is
//! tagged with the deployment id so the correlator can ignore the daemon's
//! own side effects.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::constants;
use crate::logic::events::{
    EventKind, EventSeverity, LifecycleNotice, SecurityEvent, StreamItem,
};

// ============================================================================
// CAUSAL WINDOWS
// ============================================================================

/// Published by the deployment controller on apply: events matching the
/// subject within the window are plausibly our own doing.
#[derive(Debug, Clone)]
pub struct CausalWindow {
    pub deployment_id: Uuid,
    pub subject: IpNetwork,
    /// Empty = any kind
    pub kinds: Vec<EventKind>,
    pub until: DateTime<Utc>,
}

impl CausalWindow {
    fn matches(&self, event: &SecurityEvent, now: DateTime<Utc>) -> bool {
        if now > self.until {
            return false;
        }
        let Some(ip) = event.source_ip else { return false };
        if !self.subject.contains(ip) {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&event.kind)
    }
}

// ============================================================================
// SOURCE QUEUES
// ============================================================================

struct SourceQueue {
    budget: usize,
    inner: Mutex<VecDeque<SecurityEvent>>,
    dropped: AtomicU64,
}

impl SourceQueue {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            inner: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: SecurityEvent) {
        let mut queue = self.inner.lock();
        if event.severity == EventSeverity::Critical || queue.len() < self.budget {
            queue.push_back(event);
            return;
        }

        // Shed the lowest-severity entry closest to the tail; if the incoming
        // event is itself the lowest, it is the one shed.
        let victim = queue
            .iter()
            .enumerate()
            .rev()
            .min_by_key(|(_, e)| e.severity)
            .map(|(i, e)| (i, e.severity));
        match victim {
            Some((index, severity)) if severity <= event.severity => {
                queue.remove(index);
                queue.push_back(event);
            }
            _ => {}
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn drain(&self, source_name: &str, out: &mut Vec<SecurityEvent>) {
        let mut queue = self.inner.lock();
        out.extend(queue.drain(..));
        drop(queue);

        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            // shed accounting is itself an event and is never shed
            out.push(
                SecurityEvent::new(
                    source_name,
                    EventKind::EventsDropped,
                    EventSeverity::Low,
                    format!("{} events shed under backpressure", dropped),
                )
                .with_target(dropped.to_string()),
            );
        }
    }
}

// ============================================================================
// BUS
// ============================================================================

pub struct EventBus {
    queues: RwLock<HashMap<String, Arc<SourceQueue>>>,
    budgets: RwLock<HashMap<String, usize>>,
    notify: Notify,
    stream_tx: broadcast::Sender<StreamItem>,
    suppressions: RwLock<Vec<CausalWindow>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (stream_tx, _) = broadcast::channel(1024);
        Self {
            queues: RwLock::new(HashMap::new()),
            budgets: RwLock::new(HashMap::new()),
            notify: Notify::new(),
            stream_tx,
            suppressions: RwLock::new(Vec::new()),
        }
    }

    /// Override the queue budget for one source-class.
    pub fn set_budget(&self, source_name: &str, budget: usize) {
        self.budgets.write().insert(source_name.to_string(), budget);
    }

    fn queue_for(&self, source_name: &str) -> Arc<SourceQueue> {
        if let Some(queue) = self.queues.read().get(source_name) {
            return queue.clone();
        }
        let budget = self
            .budgets
            .read()
            .get(source_name)
            .copied()
            .unwrap_or(constants::DEFAULT_SOURCE_BUDGET);
        let mut queues = self.queues.write();
        queues
            .entry(source_name.to_string())
            .or_insert_with(|| Arc::new(SourceQueue::new(budget)))
            .clone()
    }

    /// Producer side. Stamps causal tags before enqueueing.
    pub fn publish(&self, mut event: SecurityEvent) {
        let now = Utc::now();
        if event.causal_tag.is_none() {
            let suppressions = self.suppressions.read();
            if let Some(window) = suppressions.iter().find(|w| w.matches(&event, now)) {
                event.causal_tag = Some(window.deployment_id);
            }
        }
        self.queue_for(&event.source_name).push(event);
        self.notify.notify_one();
    }

    /// Single-consumer side: the pump awaits activity, then drains every
    /// queue. Ordering within one source is preserved; ordering across
    /// sources is unspecified by design.
    pub async fn drained(&self) -> Vec<SecurityEvent> {
        self.notify.notified().await;
        self.drain_now()
    }

    pub fn drain_now(&self) -> Vec<SecurityEvent> {
        let queues: Vec<(String, Arc<SourceQueue>)> = self
            .queues
            .read()
            .iter()
            .map(|(name, queue)| (name.clone(), queue.clone()))
            .collect();
        let mut out = Vec::new();
        for (name, queue) in queues {
            queue.drain(&name, &mut out);
        }
        out
    }

    // ------------------------------------------------------------------
    // causal windows
    // ------------------------------------------------------------------

    pub fn publish_causal_window(&self, window: CausalWindow) {
        let now = Utc::now();
        let mut suppressions = self.suppressions.write();
        suppressions.retain(|w| w.until > now);
        suppressions.push(window);
    }

    pub fn retract_causal_window(&self, deployment_id: Uuid) {
        self.suppressions
            .write()
            .retain(|w| w.deployment_id != deployment_id);
    }

    // ------------------------------------------------------------------
    // live subscribers
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<StreamItem> {
        self.stream_tx.subscribe()
    }

    /// Fan an event out to live subscribers (called by the pump after the
    /// store write so cursors stay consistent).
    pub fn forward_to_subscribers(&self, event: &SecurityEvent) {
        let _ = self.stream_tx.send(StreamItem::Event(event.clone()));
    }

    pub fn publish_lifecycle(&self, notice: LifecycleNotice) {
        let _ = self.stream_tx.send(StreamItem::Lifecycle(notice));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(severity: EventSeverity, raw: &str) -> SecurityEvent {
        SecurityEvent::new("test-source", EventKind::AuthFail, severity, raw)
    }

    #[test]
    fn preserves_single_source_order() {
        let bus = EventBus::new();
        for i in 0..5 {
            bus.publish(event(EventSeverity::Medium, &format!("e{}", i)));
        }
        let drained = bus.drain_now();
        let raws: Vec<&str> = drained.iter().map(|e| e.raw.as_str()).collect();
        assert_eq!(raws, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn sheds_low_severity_tail_first_and_accounts_for_it() {
        let bus = EventBus::new();
        bus.set_budget("test-source", 3);
        bus.publish(event(EventSeverity::Low, "low-1"));
        bus.publish(event(EventSeverity::High, "high-1"));
        bus.publish(event(EventSeverity::Low, "low-2"));
        // over budget: the low tail goes, not the high event
        bus.publish(event(EventSeverity::Medium, "med-1"));

        let drained = bus.drain_now();
        let raws: Vec<&str> = drained.iter().map(|e| e.raw.as_str()).collect();
        assert!(raws.contains(&"high-1"));
        assert!(raws.contains(&"med-1"));
        assert!(!raws.contains(&"low-2"));
        // the shed is recorded
        assert!(drained
            .iter()
            .any(|e| e.kind == EventKind::EventsDropped && e.raw.contains("1 events")));
    }

    #[test]
    fn incoming_lowest_is_the_one_shed() {
        let bus = EventBus::new();
        bus.set_budget("test-source", 2);
        bus.publish(event(EventSeverity::High, "keep-1"));
        bus.publish(event(EventSeverity::High, "keep-2"));
        bus.publish(event(EventSeverity::Low, "shed-me"));

        let drained = bus.drain_now();
        let raws: Vec<&str> = drained.iter().map(|e| e.raw.as_str()).collect();
        assert!(raws.contains(&"keep-1") && raws.contains(&"keep-2"));
        assert!(!raws.contains(&"shed-me"));
    }

    #[test]
    fn critical_events_always_survive() {
        let bus = EventBus::new();
        bus.set_budget("test-source", 2);
        for i in 0..10 {
            bus.publish(event(EventSeverity::Critical, &format!("crit-{}", i)));
        }
        let drained = bus.drain_now();
        let crits = drained
            .iter()
            .filter(|e| e.severity == EventSeverity::Critical)
            .count();
        assert_eq!(crits, 10);
    }

    #[test]
    fn causal_window_stamps_matching_events() {
        let bus = EventBus::new();
        let deployment_id = Uuid::new_v4();
        bus.publish_causal_window(CausalWindow {
            deployment_id,
            subject: "198.51.100.9/32".parse().unwrap(),
            kinds: vec![],
            until: Utc::now() + chrono::Duration::hours(1),
        });

        bus.publish(
            event(EventSeverity::Medium, "hit").with_source_ip("198.51.100.9".parse().unwrap()),
        );
        bus.publish(
            event(EventSeverity::Medium, "other").with_source_ip("203.0.113.1".parse().unwrap()),
        );

        let drained = bus.drain_now();
        let tagged = drained.iter().find(|e| e.raw == "hit").unwrap();
        assert_eq!(tagged.causal_tag, Some(deployment_id));
        let untagged = drained.iter().find(|e| e.raw == "other").unwrap();
        assert!(untagged.causal_tag.is_none());
    }

    #[test]
    fn expired_window_does_not_stamp() {
        let bus = EventBus::new();
        bus.publish_causal_window(CausalWindow {
            deployment_id: Uuid::new_v4(),
            subject: "198.51.100.9/32".parse().unwrap(),
            kinds: vec![],
            until: Utc::now() - chrono::Duration::seconds(1),
        });
        bus.publish(
            event(EventSeverity::Medium, "late").with_source_ip("198.51.100.9".parse().unwrap()),
        );
        let drained = bus.drain_now();
        assert!(drained[0].causal_tag.is_none());
    }
}

//! Scripted in-memory adapter for controller and facade tests.
//!
//! Keeps the "live" ruleset as a Vec of rendered lines, snapshots into a
//! shared map instead of files, and lets tests inject failures per
//! operation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::logic::backend::{
    AdapterHealth, ApplyReceipt, BackendAdapter, BackendOptions, BackupRef, Capabilities,
    DeltaOp, EvaluationOrder, ImportResult, Verdict,
};
use crate::logic::error::AdapterError;
use crate::logic::policy::{PolicyRule, RenderedRule, RulesetImage};

#[derive(Default)]
pub struct MockState {
    pub live: Vec<RenderedRule>,
    pub backups: HashMap<String, Vec<RenderedRule>>,
    pub fail_apply: Option<AdapterError>,
    pub fail_restore: Option<AdapterError>,
    pub fail_snapshot: Option<AdapterError>,
    pub apply_count: usize,
    pub restore_count: usize,
}

pub struct MockAdapter {
    name: &'static str,
    subsystem: &'static str,
    supports_delta: bool,
    pub state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::named("mock", "mock-subsystem")
    }

    pub fn named(name: &'static str, subsystem: &'static str) -> Self {
        Self {
            name,
            subsystem,
            supports_delta: true,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn without_delta(mut self) -> Self {
        self.supports_delta = false;
        self
    }

    pub fn live_texts(&self) -> Vec<String> {
        self.state.lock().live.iter().map(|r| r.text.clone()).collect()
    }

    fn render_text(&self, rule: &PolicyRule) -> String {
        format!("{} # id={}", rule.summary(), rule.id)
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendAdapter for MockAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn kernel_subsystem(&self) -> &str {
        self.subsystem
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_deny: true,
            supports_stateful: true,
            supports_rate_limit: true,
            supports_ipv6: true,
            supports_priority: true,
            evaluation_order: EvaluationOrder::FirstMatch,
            supports_atomic_replace: true,
            supports_delta_ops: self.supports_delta,
        }
    }

    fn render(&self, rule: &PolicyRule) -> Result<RenderedRule, AdapterError> {
        Ok(RenderedRule {
            backend_name: self.name.into(),
            text: self.render_text(rule),
            rule_id: Some(rule.id),
        })
    }

    fn render_image(&self, rules: &[PolicyRule]) -> Result<RulesetImage, AdapterError> {
        let mut sorted: Vec<&PolicyRule> = rules.iter().collect();
        sorted.sort_by_key(|r| r.priority);
        let mut text = String::from("flush ruleset\n");
        for rule in sorted {
            text.push_str(&self.render_text(rule));
            text.push('\n');
        }
        Ok(RulesetImage { backend_name: self.name.into(), text })
    }

    fn validate(&self, _image: &RulesetImage) -> Result<Verdict, AdapterError> {
        Ok(Verdict::ok())
    }

    fn snapshot(&self) -> Result<BackupRef, AdapterError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_snapshot.clone() {
            return Err(err);
        }
        let key = Uuid::new_v4().to_string();
        let live = state.live.clone();
        state.backups.insert(key.clone(), live);
        Ok(BackupRef {
            backend_name: self.name.into(),
            path: key,
            taken_at: Utc::now(),
        })
    }

    fn apply_atomic(&self, image: &RulesetImage) -> Result<ApplyReceipt, AdapterError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_apply.clone() {
            return Err(err);
        }
        state.apply_count += 1;
        state.live = image
            .text
            .lines()
            .filter(|l| !l.starts_with("flush") && !l.trim().is_empty())
            .map(|l| RenderedRule {
                backend_name: self.name.into(),
                text: l.to_string(),
                rule_id: l
                    .rsplit("id=")
                    .next()
                    .and_then(|s| Uuid::parse_str(s.trim()).ok()),
            })
            .collect();
        Ok(ApplyReceipt {
            backend_name: self.name.into(),
            applied_at: Utc::now(),
            rules_applied: state.live.len(),
        })
    }

    fn apply_delta(&self, delta: &DeltaOp) -> Result<ApplyReceipt, AdapterError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_apply.clone() {
            return Err(err);
        }
        state.apply_count += 1;
        match delta {
            DeltaOp::Add(rendered) => state.live.push(rendered.clone()),
            DeltaOp::Remove(rendered) => {
                state.live.retain(|r| r.rule_id != rendered.rule_id);
            }
        }
        Ok(ApplyReceipt {
            backend_name: self.name.into(),
            applied_at: Utc::now(),
            rules_applied: 1,
        })
    }

    fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_restore.clone() {
            return Err(err);
        }
        state.restore_count += 1;
        match state.backups.get(&backup.path).cloned() {
            Some(saved) => {
                state.live = saved;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError> {
        Ok(self.state.lock().live.clone())
    }

    fn import_rules(&self) -> Result<ImportResult, AdapterError> {
        Ok(ImportResult { rules: Vec::new(), warnings: Vec::new() })
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth { reachable: true, writable: true }
    }
}

// Constructors with a shared kernel subsystem, for coexistence tests.
pub fn construct_netfilter_a(
    _options: &BackendOptions,
) -> Result<Arc<dyn BackendAdapter>, AdapterError> {
    Ok(Arc::new(MockAdapter::named("mock-a", "netfilter")))
}

pub fn construct_netfilter_b(
    _options: &BackendOptions,
) -> Result<Arc<dyn BackendAdapter>, AdapterError> {
    Ok(Arc::new(MockAdapter::named("mock-b", "netfilter")))
}

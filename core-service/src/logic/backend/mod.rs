//! Backend Adapter Contract
//!
//! Every firewall backend sits behind this trait. Adapters advertise a
//! capability set, speak only in `RenderedRule`/`RulesetImage`, and fail with
//! typed errors. Exactly one adapter is active per host; activating a second
//! one whose kernel subsystem collides with the active adapter is refused.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::logic::error::{AdapterError, AdapterErrorKind};
use crate::logic::policy::{PolicyRule, RenderedRule, RulesetImage};

pub mod nft_parse;
pub mod nftables;

#[cfg(test)]
pub mod mock;

// ============================================================================
// CAPABILITIES
// ============================================================================

/// How the backend walks its ruleset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluationOrder {
    FirstMatch,
    LastMatch,
}

/// What the backend can express. Checked by the facade before a rule is
/// accepted for this backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_deny: bool,
    pub supports_stateful: bool,
    pub supports_rate_limit: bool,
    pub supports_ipv6: bool,
    pub supports_priority: bool,
    pub evaluation_order: EvaluationOrder,
    pub supports_atomic_replace: bool,
    pub supports_delta_ops: bool,
}

impl Capabilities {
    /// First capability a rule requires that this backend lacks.
    pub fn missing_for(&self, rule: &PolicyRule) -> Option<&'static str> {
        use crate::logic::policy::Family;
        if rule.action.is_deny() && !self.supports_deny {
            return Some("deny actions");
        }
        if rule.stateful && !self.supports_stateful {
            return Some("stateful matching");
        }
        if rule.rate_limit.is_some() && !self.supports_rate_limit {
            return Some("rate limiting");
        }
        if matches!(rule.family, Family::Ipv6 | Family::Both) && !self.supports_ipv6 {
            return Some("ipv6");
        }
        if rule.priority != 0 && !self.supports_priority {
            return Some("rule priority");
        }
        None
    }
}

// ============================================================================
// OPERATION RESULTS
// ============================================================================

/// Outcome of a dry-run validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn ok() -> Self {
        Self { valid: true, errors: Vec::new(), warnings: Vec::new() }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self { valid: false, errors, warnings: Vec::new() }
    }
}

/// Handle to a snapshot usable by `restore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub backend_name: String,
    pub path: String,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

/// Receipt of a successful mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReceipt {
    pub backend_name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
    pub rules_applied: usize,
}

/// Single-rule mutation, preferred for autonomous responses so connection
/// tracking state survives.
#[derive(Debug, Clone)]
pub enum DeltaOp {
    Add(RenderedRule),
    Remove(RenderedRule),
}

/// Best-effort lift of the live ruleset into the neutral model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub rules: Vec<PolicyRule>,
    /// Live constructs the model cannot express; never silently dropped
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub reachable: bool,
    pub writable: bool,
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// The contract every backend implements. All operations may block (they
/// usually shell out); callers on the async side wrap them in
/// `spawn_blocking`.
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Token identifying the kernel machinery underneath; two adapters with
    /// the same token cannot be active together.
    fn kernel_subsystem(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Pure translation of one rule; no side effects.
    fn render(&self, rule: &PolicyRule) -> Result<RenderedRule, AdapterError>;

    /// Complete image for the given rules, ready for one-transaction load.
    fn render_image(&self, rules: &[PolicyRule]) -> Result<RulesetImage, AdapterError>;

    /// Dry-run check; must not mutate the live ruleset.
    fn validate(&self, image: &RulesetImage) -> Result<Verdict, AdapterError>;

    /// Capture the live ruleset in a restorable form.
    fn snapshot(&self) -> Result<BackupRef, AdapterError>;

    /// Replace the live ruleset in one kernel transaction.
    fn apply_atomic(&self, image: &RulesetImage) -> Result<ApplyReceipt, AdapterError>;

    /// Apply a single-rule change without replacing the ruleset.
    fn apply_delta(&self, delta: &DeltaOp) -> Result<ApplyReceipt, AdapterError>;

    /// Atomic restore from a snapshot. `Ok(false)` means the backup was
    /// missing or unreadable.
    fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError>;

    fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError>;

    fn import_rules(&self) -> Result<ImportResult, AdapterError>;

    fn health(&self) -> AdapterHealth;
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Per-backend options straight from `backend.options.*`.
pub type BackendOptions = HashMap<String, String>;

type AdapterCtor = fn(&BackendOptions) -> Result<Arc<dyn BackendAdapter>, AdapterError>;

/// In-process adapter registry keyed by backend name. No plugin loading:
/// registration happens in `with_builtin` (and in tests).
pub struct AdapterRegistry {
    constructors: HashMap<String, AdapterCtor>,
    active: RwLock<Option<Arc<dyn BackendAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            active: RwLock::new(None),
        }
    }

    /// Registry with the reference adapters present.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("nftables", nftables::construct);
        registry
    }

    pub fn register(&mut self, name: &str, ctor: AdapterCtor) {
        self.constructors.insert(name.to_string(), ctor);
    }

    /// Construct and activate a backend. Fails with `coexistence` when the
    /// new adapter's kernel subsystem collides with the active one; the
    /// active adapter is left untouched.
    pub fn activate(
        &self,
        name: &str,
        options: &BackendOptions,
    ) -> Result<Arc<dyn BackendAdapter>, AdapterError> {
        let ctor = self.constructors.get(name).ok_or_else(|| {
            AdapterError::unavailable(format!("no adapter registered for backend {:?}", name))
        })?;
        let adapter = ctor(options)?;

        let mut active = self.active.write();
        if let Some(current) = active.as_ref() {
            if current.name() != adapter.name()
                && current.kernel_subsystem() == adapter.kernel_subsystem()
            {
                return Err(AdapterError::new(
                    AdapterErrorKind::Coexistence,
                    format!(
                        "backend {} collides with active backend {} over kernel subsystem {}",
                        adapter.name(),
                        current.name(),
                        current.kernel_subsystem()
                    ),
                ));
            }
        }
        *active = Some(adapter.clone());
        Ok(adapter)
    }

    pub fn active(&self) -> Option<Arc<dyn BackendAdapter>> {
        self.active.read().clone()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::{Action, Direction, Origin, PolicyRule};

    fn caps_no_ipv6() -> Capabilities {
        Capabilities {
            supports_deny: true,
            supports_stateful: true,
            supports_rate_limit: false,
            supports_ipv6: false,
            supports_priority: true,
            evaluation_order: EvaluationOrder::FirstMatch,
            supports_atomic_replace: true,
            supports_delta_ops: true,
        }
    }

    #[test]
    fn capability_check_reports_first_gap() {
        let rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::User);
        // Family defaults to Both, which needs ipv6
        assert_eq!(caps_no_ipv6().missing_for(&rule), Some("ipv6"));
    }

    #[test]
    fn coexistence_refused_same_subsystem() {
        let mut registry = AdapterRegistry::new();
        registry.register("mock-a", mock::construct_netfilter_a);
        registry.register("mock-b", mock::construct_netfilter_b);

        let opts = BackendOptions::new();
        registry.activate("mock-a", &opts).unwrap();
        let err = match registry.activate("mock-b", &opts) {
            Err(e) => e,
            Ok(_) => panic!("expected activate to fail"),
        };
        assert_eq!(err.kind, AdapterErrorKind::Coexistence);
        // active adapter unaffected
        assert_eq!(registry.active().unwrap().name(), "mock-a");
    }

    #[test]
    fn reactivating_same_backend_is_allowed() {
        let mut registry = AdapterRegistry::new();
        registry.register("mock-a", mock::construct_netfilter_a);
        let opts = BackendOptions::new();
        registry.activate("mock-a", &opts).unwrap();
        assert!(registry.activate("mock-a", &opts).is_ok());
    }

    #[test]
    fn unknown_backend_is_unavailable() {
        let registry = AdapterRegistry::new();
        let err = match registry.activate("pf", &BackendOptions::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected activate to fail"),
        };
        assert_eq!(err.kind, AdapterErrorKind::Unavailable);
    }
}

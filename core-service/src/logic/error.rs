//! Error taxonomy
//!
//! One structured error type crosses every internal boundary. Consumers never
//! see an opaque internal error: each error carries a stable kind, a human
//! message, and an optional correlation id. The correlation id is stamped
//! once per operation attempt and written into the audit rows of the same
//! attempt, so a failing call can be matched to its audit trail.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

/// Failure classes of a backend adapter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterErrorKind {
    /// The backend rejected the rule text
    Syntax,
    /// The backend tool failed (non-zero exit, unexpected output)
    System,
    /// Insufficient privileges for the requested operation
    Permission,
    /// Backend tooling is not present or not responding
    Unavailable,
    /// Momentary failure worth retrying (timeout, busy ruleset)
    Transient,
    /// A second adapter collides with the active adapter's kernel subsystem
    Coexistence,
}

impl AdapterErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterErrorKind::Syntax => "syntax",
            AdapterErrorKind::System => "system",
            AdapterErrorKind::Permission => "permission",
            AdapterErrorKind::Unavailable => "unavailable",
            AdapterErrorKind::Transient => "transient",
            AdapterErrorKind::Coexistence => "coexistence",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterErrorKind::Transient)
    }
}

/// Typed failure from a backend adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Syntax, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::System, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Permission, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transient, message)
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter error ({}): {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Error class of the service-wide taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreErrorKind {
    /// Malformed PolicyRule, unsupported capability, conflicting fields
    Validation,
    /// Never-block match, autonomy gate failure, management self-block
    PolicyViolation,
    /// Typed backend failure
    Adapter(AdapterErrorKind),
    /// Lock timeout, queue overflow
    Concurrency,
    /// Probation deadline elapsed with failing probe
    HeartbeatMiss,
    /// Store constraint violation, backup missing at rollback time
    Integrity,
    /// Rollback itself failed; operator attention required
    Catastrophic,
    /// Resource lookup failed
    NotFound,
}

/// The service-wide error type: kind + human message + optional correlation
/// id pointing at the audit rows of the failing attempt.
#[derive(Debug, Clone)]
pub struct CoreError {
    kind: CoreErrorKind,
    message: String,
    correlation_id: Option<Uuid>,
}

impl CoreError {
    fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), correlation_id: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Validation, message)
    }

    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::PolicyViolation, message)
    }

    pub fn adapter(err: AdapterError) -> Self {
        Self::new(CoreErrorKind::Adapter(err.kind), err.message)
    }

    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Concurrency, message)
    }

    pub fn heartbeat_miss(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::HeartbeatMiss, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Integrity, message)
    }

    pub fn catastrophic(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Catastrophic, message)
    }

    pub fn not_found(what: impl Into<String>, id: Uuid) -> Self {
        Self::new(
            CoreErrorKind::NotFound,
            format!("{} {} not found", what.into(), id),
        )
    }

    /// Stamp the operation's correlation id. The first stamp wins: an inner
    /// layer that already tied the error to its audit rows is more specific
    /// than any wrapper.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(correlation_id);
        }
        self
    }

    pub fn class(&self) -> CoreErrorKind {
        self.kind
    }

    /// Stable kind tag used on the wire and in audit rows.
    pub fn kind(&self) -> &'static str {
        match self.kind {
            CoreErrorKind::Validation => "validation",
            CoreErrorKind::PolicyViolation => "policy-violation",
            CoreErrorKind::Adapter(kind) => kind.as_str(),
            CoreErrorKind::Concurrency => "concurrency",
            CoreErrorKind::HeartbeatMiss => "heartbeat-miss",
            CoreErrorKind::Integrity => "integrity",
            CoreErrorKind::Catastrophic => "catastrophic",
            CoreErrorKind::NotFound => "not-found",
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.correlation_id {
            Some(id) => write!(f, "{}: {} [{}]", self.kind(), self.message, id),
            None => write!(f, "{}: {}", self.kind(), self.message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<AdapterError> for CoreError {
    fn from(err: AdapterError) -> Self {
        CoreError::adapter(err)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::integrity(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::adapter(AdapterError::system(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_kind_round_trips_through_core_error() {
        let err: CoreError = AdapterError::transient("ruleset busy").into();
        assert_eq!(err.kind(), "transient");
        assert!(err.message().contains("busy"));
        assert_eq!(err.class(), CoreErrorKind::Adapter(AdapterErrorKind::Transient));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(AdapterErrorKind::Transient.is_retryable());
        assert!(!AdapterErrorKind::Syntax.is_retryable());
        assert!(!AdapterErrorKind::Coexistence.is_retryable());
    }

    #[test]
    fn first_correlation_stamp_wins() {
        let inner = Uuid::new_v4();
        let outer = Uuid::new_v4();
        let err = CoreError::concurrency("lock timeout")
            .with_correlation(inner)
            .with_correlation(outer);
        assert_eq!(err.correlation_id(), Some(inner));
        assert!(err.to_string().contains(&inner.to_string()));
    }

    #[test]
    fn errors_start_without_a_correlation() {
        assert!(CoreError::validation("bad rule").correlation_id().is_none());
    }
}

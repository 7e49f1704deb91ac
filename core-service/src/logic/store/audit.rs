//! Audit trail
//!
//! Append-only, gaplessly sequenced records of every state transition. The
//! process never updates or deletes audit rows; schema-level triggers abort
//! any attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection};
use uuid::Uuid;

use crate::logic::error::CoreResult;

/// Every auditable transition in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    ProposalCreated,
    ProposalApproved,
    ProposalRejected,
    ProposalSuperseded,
    DeploymentApplying,
    DeploymentApplied,
    DeploymentCommitted,
    DeploymentCancelled,
    HeartbeatMiss,
    RollbackOk,
    Catastrophic,
    DeploymentFailed,
    EventObserved,
    EventsDropped,
    ThreatEscalated,
    AutonomousApplied,
    AutonomySuppressed,
    BreakerTripped,
    BreakerReset,
    AutonomyLevelChanged,
    NeverBlockAdded,
    NeverBlockRemoved,
    RuleExpired,
    ConfigReloaded,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ProposalCreated => "proposal-created",
            AuditKind::ProposalApproved => "proposal-approved",
            AuditKind::ProposalRejected => "proposal-rejected",
            AuditKind::ProposalSuperseded => "proposal-superseded",
            AuditKind::DeploymentApplying => "deployment-applying",
            AuditKind::DeploymentApplied => "deployment-applied",
            AuditKind::DeploymentCommitted => "deployment-committed",
            AuditKind::DeploymentCancelled => "deployment-cancelled",
            AuditKind::HeartbeatMiss => "heartbeat-miss",
            AuditKind::RollbackOk => "rollback-ok",
            AuditKind::Catastrophic => "catastrophic",
            AuditKind::DeploymentFailed => "deployment-failed",
            AuditKind::EventObserved => "event-observed",
            AuditKind::EventsDropped => "events-dropped",
            AuditKind::ThreatEscalated => "threat-escalated",
            AuditKind::AutonomousApplied => "autonomous-applied",
            AuditKind::AutonomySuppressed => "autonomy-suppressed",
            AuditKind::BreakerTripped => "breaker-tripped",
            AuditKind::BreakerReset => "breaker-reset",
            AuditKind::AutonomyLevelChanged => "autonomy-level-changed",
            AuditKind::NeverBlockAdded => "never-block-added",
            AuditKind::NeverBlockRemoved => "never-block-removed",
            AuditKind::RuleExpired => "rule-expired",
            AuditKind::ConfigReloaded => "config-reloaded",
        }
    }
}

/// One audit row as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub kind: String,
    pub entity_id: Option<Uuid>,
    pub detail: String,
    pub error_kind: Option<String>,
    pub correlation_id: Option<Uuid>,
}

impl FromRow<'_, SqliteRow> for AuditRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let entity: Option<String> = row.try_get("entity_id")?;
        let correlation: Option<String> = row.try_get("correlation_id")?;
        Ok(Self {
            seq: row.try_get("seq")?,
            at: row.try_get("at")?,
            kind: row.try_get("kind")?,
            entity_id: entity.and_then(|s| Uuid::parse_str(&s).ok()),
            detail: row.try_get("detail")?,
            error_kind: row.try_get("error_kind")?,
            correlation_id: correlation.and_then(|s| Uuid::parse_str(&s).ok()),
        })
    }
}

/// Append one audit row inside the caller's transaction so the row update
/// and its audit record commit together or not at all. The correlation id
/// is the per-attempt id callers also stamp onto any `CoreError` they
/// return, independent of the entity acted on.
pub async fn append(
    conn: &mut SqliteConnection,
    kind: AuditKind,
    entity_id: Option<Uuid>,
    detail: &str,
    error_kind: Option<&str>,
    correlation_id: Option<Uuid>,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO audit (at, kind, entity_id, detail, error_kind, correlation_id)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Utc::now())
    .bind(kind.as_str())
    .bind(entity_id.map(|id| id.to_string()))
    .bind(detail)
    .bind(error_kind)
    .bind(correlation_id.map(|id| id.to_string()))
    .execute(conn)
    .await?;
    Ok(())
}

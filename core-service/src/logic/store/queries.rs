//! Store queries
//!
//! All writes go through here (and only the facade calls here), each state
//! transition paired with its audit row in one transaction. Reads are plain
//! `query_as` lookups; dashboards may issue their own read-only queries
//! against the same file.

use chrono::{Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::logic::error::{CoreError, CoreResult};
use crate::logic::events::SecurityEvent;
use crate::logic::policy::PolicyRule;
use crate::logic::store::audit::{self, AuditKind, AuditRecord};
use crate::logic::store::records::{
    Deployment, DeploymentState, NeverBlockRow, Proposal, ProposalState,
};
use crate::logic::store::Store;

impl Store {
    // ------------------------------------------------------------------
    // proposals
    // ------------------------------------------------------------------

    pub async fn insert_proposal(
        &self,
        proposal: &Proposal,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let doc = serde_json::to_string(proposal)
            .map_err(|e| CoreError::integrity(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO proposals (id, state, origin, backend, doc, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(proposal.id.to_string())
        .bind(proposal.state.as_str())
        .bind(proposal.origin().as_str())
        .bind(&proposal.backend)
        .bind(doc)
        .bind(proposal.created_at)
        .bind(proposal.updated_at)
        .execute(&mut *tx)
        .await?;
        audit::append(
            &mut *tx,
            AuditKind::ProposalCreated,
            Some(proposal.id),
            &format!("{} ({})", proposal.rule.summary(), proposal.origin().as_str()),
            None,
            correlation_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a proposal transition together with its audit record.
    pub async fn update_proposal(
        &self,
        proposal: &Proposal,
        kind: AuditKind,
        detail: &str,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let doc = serde_json::to_string(proposal)
            .map_err(|e| CoreError::integrity(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE proposals SET state = ?, doc = ?, updated_at = ? WHERE id = ?",
        )
        .bind(proposal.state.as_str())
        .bind(doc)
        .bind(Utc::now())
        .bind(proposal.id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("proposal", proposal.id));
        }
        audit::append(&mut *tx, kind, Some(proposal.id), detail, None, correlation_id)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_proposal(&self, id: Uuid) -> CoreResult<Option<Proposal>> {
        let row = sqlx::query("SELECT doc FROM proposals WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            let doc: String = r.get("doc");
            serde_json::from_str(&doc).map_err(|e| CoreError::integrity(e.to_string()))
        })
        .transpose()
    }

    pub async fn list_proposals(
        &self,
        state: Option<ProposalState>,
    ) -> CoreResult<Vec<Proposal>> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT doc FROM proposals WHERE state = ? ORDER BY created_at")
                    .bind(state.as_str())
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT doc FROM proposals ORDER BY created_at")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CoreError::integrity(e.to_string()))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // deployments
    // ------------------------------------------------------------------

    pub async fn insert_deployment(
        &self,
        deployment: &Deployment,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let doc = serde_json::to_string(deployment)
            .map_err(|e| CoreError::integrity(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO deployments
             (id, proposal_id, backend, origin, state, doc, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id.to_string())
        .bind(deployment.proposal_id.to_string())
        .bind(&deployment.backend)
        .bind(deployment.origin.as_str())
        .bind(deployment.state.as_str())
        .bind(doc)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&mut *tx)
        .await?;
        audit::append(
            &mut *tx,
            AuditKind::DeploymentApplying,
            Some(deployment.id),
            &format!("proposal {}", deployment.proposal_id),
            None,
            correlation_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_deployment(
        &self,
        deployment: &Deployment,
        kind: AuditKind,
        detail: &str,
        error_kind: Option<&str>,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let doc = serde_json::to_string(deployment)
            .map_err(|e| CoreError::integrity(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE deployments SET state = ?, doc = ?, updated_at = ? WHERE id = ?",
        )
        .bind(deployment.state.as_str())
        .bind(doc)
        .bind(Utc::now())
        .bind(deployment.id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("deployment", deployment.id));
        }
        audit::append(
            &mut *tx,
            kind,
            Some(deployment.id),
            detail,
            error_kind,
            correlation_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Heartbeat bookkeeping: refresh the row without an audit record. Not a
    /// state transition, so the audit pairing rule does not apply.
    pub async fn touch_deployment(&self, deployment: &Deployment) -> CoreResult<()> {
        let doc = serde_json::to_string(deployment)
            .map_err(|e| CoreError::integrity(e.to_string()))?;
        // guarded on the state column so a touch racing a transition can
        // never resurrect a terminal deployment
        sqlx::query(
            "UPDATE deployments SET doc = ?, updated_at = ?
             WHERE id = ? AND state = 'probation'",
        )
        .bind(doc)
        .bind(Utc::now())
        .bind(deployment.id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<Deployment>> {
        let row = sqlx::query("SELECT doc FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            let doc: String = r.get("doc");
            serde_json::from_str(&doc).map_err(|e| CoreError::integrity(e.to_string()))
        })
        .transpose()
    }

    pub async fn deployment_for_proposal(
        &self,
        proposal_id: Uuid,
    ) -> CoreResult<Option<Deployment>> {
        let row = sqlx::query("SELECT doc FROM deployments WHERE proposal_id = ?")
            .bind(proposal_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            let doc: String = r.get("doc");
            serde_json::from_str(&doc).map_err(|e| CoreError::integrity(e.to_string()))
        })
        .transpose()
    }

    pub async fn deployments_in_state(
        &self,
        state: DeploymentState,
    ) -> CoreResult<Vec<Deployment>> {
        let rows = sqlx::query("SELECT doc FROM deployments WHERE state = ? ORDER BY created_at")
            .bind(state.as_str())
            .fetch_all(self.pool())
            .await?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CoreError::integrity(e.to_string()))
            })
            .collect()
    }

    /// Rules currently meant to be live: proposals behind deployments in
    /// probation or committed state.
    pub async fn active_rules(&self) -> CoreResult<Vec<(Deployment, PolicyRule)>> {
        let rows = sqlx::query(
            "SELECT d.doc AS dep_doc, p.doc AS prop_doc
             FROM deployments d JOIN proposals p ON p.id = d.proposal_id
             WHERE d.state IN ('probation', 'committed')
             ORDER BY d.created_at",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|r| {
                let dep_doc: String = r.get("dep_doc");
                let prop_doc: String = r.get("prop_doc");
                let deployment: Deployment = serde_json::from_str(&dep_doc)
                    .map_err(|e| CoreError::integrity(e.to_string()))?;
                let proposal: Proposal = serde_json::from_str(&prop_doc)
                    .map_err(|e| CoreError::integrity(e.to_string()))?;
                Ok((deployment, proposal.rule))
            })
            .collect()
    }

    /// Circuit-breaker evidence: daemon-origin deployments created inside
    /// the trailing window.
    pub async fn count_recent_daemon_deployments(
        &self,
        window: Duration,
    ) -> CoreResult<u32> {
        let since = Utc::now() - window;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM deployments
             WHERE origin = 'daemon-auto' AND created_at >= ?",
        )
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        let n: i64 = row.get("n");
        Ok(n as u32)
    }

    // ------------------------------------------------------------------
    // events
    // ------------------------------------------------------------------

    pub async fn record_event(&self, event: &SecurityEvent) -> CoreResult<i64> {
        let doc =
            serde_json::to_string(event).map_err(|e| CoreError::integrity(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "INSERT INTO events (id, kind, severity, source_name, observed_at, doc)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.kind.as_str())
        .bind(event.severity.as_str())
        .bind(&event.source_name)
        .bind(event.observed_at)
        .bind(doc)
        .execute(&mut *tx)
        .await?;
        let seq = result.last_insert_rowid();
        let audit_kind = if event.kind == crate::logic::events::EventKind::EventsDropped {
            AuditKind::EventsDropped
        } else {
            AuditKind::EventObserved
        };
        // observations are tied to their event id, not to an operation
        audit::append(
            &mut *tx,
            audit_kind,
            Some(event.id),
            &format!("{} from {}", event.kind.as_str(), event.source_name),
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(seq)
    }

    /// Events after a sequence cursor, for catch-up subscriptions.
    pub async fn events_since(
        &self,
        cursor: i64,
        limit: i64,
    ) -> CoreResult<Vec<(i64, SecurityEvent)>> {
        let rows = sqlx::query(
            "SELECT seq, doc FROM events WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|r| {
                let seq: i64 = r.get("seq");
                let doc: String = r.get("doc");
                let event = serde_json::from_str(&doc)
                    .map_err(|e| CoreError::integrity(e.to_string()))?;
                Ok((seq, event))
            })
            .collect()
    }

    pub async fn prune_events(&self, retain_days: i64) -> CoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(retain_days);
        let result = sqlx::query("DELETE FROM events WHERE observed_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // audit (reads + standalone appends)
    // ------------------------------------------------------------------

    /// Append an audit record not tied to any row transition (gate trips,
    /// suppressions, breaker events).
    pub async fn append_audit(
        &self,
        kind: AuditKind,
        entity_id: Option<Uuid>,
        detail: &str,
        error_kind: Option<&str>,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let mut tx = self.pool().begin().await?;
        audit::append(&mut *tx, kind, entity_id, detail, error_kind, correlation_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Audit rows of one operation attempt, oldest first.
    pub async fn audit_by_correlation(
        &self,
        correlation_id: Uuid,
    ) -> CoreResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            "SELECT * FROM audit WHERE correlation_id = ? ORDER BY seq",
        )
        .bind(correlation_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    pub async fn audit_tail(&self, limit: i64) -> CoreResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            "SELECT * FROM (SELECT * FROM audit ORDER BY seq DESC LIMIT ?) ORDER BY seq",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    pub async fn audit_by_kind(&self, kind: AuditKind) -> CoreResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            "SELECT * FROM audit WHERE kind = ? ORDER BY seq",
        )
        .bind(kind.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    // ------------------------------------------------------------------
    // daemon state
    // ------------------------------------------------------------------

    pub async fn get_state(&self, key: &str) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM daemon_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_state(&self, key: &str, value: &str) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO daemon_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // never-block
    // ------------------------------------------------------------------

    pub async fn never_block_insert(
        &self,
        entry: &str,
        kind: &str,
        added_by: &str,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO never_block (entry, kind, added_by, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(entry)
        .bind(kind)
        .bind(added_by)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        audit::append(
            &mut *tx,
            AuditKind::NeverBlockAdded,
            None,
            entry,
            None,
            correlation_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn never_block_delete(
        &self,
        entry: &str,
        correlation_id: Option<Uuid>,
    ) -> CoreResult<bool> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("DELETE FROM never_block WHERE entry = ?")
            .bind(entry)
            .execute(&mut *tx)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            audit::append(
                &mut *tx,
                AuditKind::NeverBlockRemoved,
                None,
                entry,
                None,
                correlation_id,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn never_block_rows(&self) -> CoreResult<Vec<NeverBlockRow>> {
        let rows = sqlx::query("SELECT entry, kind, added_by, created_at FROM never_block")
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| NeverBlockRow {
                entry: r.get("entry"),
                kind: r.get("kind"),
                added_by: r.get("added_by"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

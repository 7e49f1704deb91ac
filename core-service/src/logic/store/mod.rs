//! Audit & State Store
//!
//! Embedded single-file SQLite database shared by the interactive and daemon
//! consumers. WAL journaling survives unclean shutdown; readers tolerate the
//! single writer. Every row transition commits together with its audit record
//! or not at all.

pub mod audit;
pub mod queries;
pub mod records;

use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::logic::error::CoreResult;

pub use audit::{AuditKind, AuditRecord};
pub use records::{
    Deployment, DeploymentState, NeverBlockRow, Proposal, ProposalState,
};

/// Database schema. `audit` is append-only: the process never issues
/// UPDATE/DELETE against it, and the triggers make sure nothing else does
/// either (SQLite has no GRANT machinery to lean on).
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS proposals (
    id          TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    origin      TEXT NOT NULL,
    backend     TEXT NOT NULL,
    doc         TEXT NOT NULL,
    created_at  TIMESTAMP NOT NULL,
    updated_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS deployments (
    id          TEXT PRIMARY KEY,
    proposal_id TEXT NOT NULL UNIQUE REFERENCES proposals(id),
    backend     TEXT NOT NULL,
    origin      TEXT NOT NULL,
    state       TEXT NOT NULL,
    doc         TEXT NOT NULL,
    created_at  TIMESTAMP NOT NULL,
    updated_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    kind        TEXT NOT NULL,
    severity    TEXT NOT NULL,
    source_name TEXT NOT NULL,
    observed_at TIMESTAMP NOT NULL,
    doc         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    at             TIMESTAMP NOT NULL,
    kind           TEXT NOT NULL,
    entity_id      TEXT,
    detail         TEXT NOT NULL,
    error_kind     TEXT,
    correlation_id TEXT
);

CREATE TABLE IF NOT EXISTS daemon_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS never_block (
    entry      TEXT PRIMARY KEY,
    kind       TEXT NOT NULL,
    added_by   TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_proposals_state ON proposals(state);
CREATE INDEX IF NOT EXISTS idx_deployments_state ON deployments(state);
CREATE INDEX IF NOT EXISTS idx_deployments_origin ON deployments(origin, created_at);
CREATE INDEX IF NOT EXISTS idx_events_observed ON events(observed_at);
CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit(kind);
CREATE INDEX IF NOT EXISTS idx_audit_correlation ON audit(correlation_id);

CREATE TRIGGER IF NOT EXISTS audit_no_update
BEFORE UPDATE ON audit
BEGIN
    SELECT RAISE(ABORT, 'audit is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_no_delete
BEFORE DELETE ON audit
BEGIN
    SELECT RAISE(ABORT, 'audit is append-only');
END;
"#;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the single-file database.
    pub async fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database (tests). A single connection keeps the
    /// schema visible to every query.
    pub async fn open_in_memory() -> CoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> CoreResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        log::info!("store schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audit_is_append_only() {
        let store = Store::open_in_memory().await.unwrap();
        let mut tx = store.pool().begin().await.unwrap();
        audit::append(&mut *tx, AuditKind::ProposalCreated, None, "x", None, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let update = sqlx::query("UPDATE audit SET detail = 'tampered'")
            .execute(store.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM audit").execute(store.pool()).await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn audit_sequence_is_monotonic_and_gapless() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            let mut tx = store.pool().begin().await.unwrap();
            audit::append(
                &mut *tx,
                AuditKind::EventObserved,
                None,
                &format!("event {}", i),
                None,
                None,
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        let records = store.audit_tail(100).await.unwrap();
        let seqs: Vec<i64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }
}

//! Store traits the engine consumes.
//!
//! The engine owns none of the persistence; these traits are the entire
//! surface a storage collaborator must satisfy. `jnl-db` provides the
//! Postgres implementation ([`crate::PgStores`]); `jnl-testkit` provides an
//! in-memory one for scenario tests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use jnl_schemas::{ExecutionRecord, IntegrityIssue, Position};

/// Append-only execution facts.
pub trait ExecutionStore {
    /// A scope's records in canonical (ts, id) order.
    async fn fetch_executions(
        &self,
        account: &str,
        instrument: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Atomically void superseded records and insert their replacements.
    async fn apply_correction(
        &self,
        voided_ids: &[Uuid],
        inserted: &[ExecutionRecord],
    ) -> Result<()>;

    /// Every (account, instrument) scope with at least one record.
    async fn list_scopes(&self) -> Result<Vec<(String, String)>>;
}

/// Derived position rows. The builder is the only writer.
pub trait PositionStore {
    async fn load_positions(&self, account: &str, instrument: &str) -> Result<Vec<Position>>;

    /// Replace a scope's rows atomically; readers never see a half-rebuilt
    /// scope.
    async fn replace_positions(
        &self,
        account: &str,
        instrument: &str,
        positions: &[Position],
    ) -> Result<()>;
}

/// Append-only issue records with write-once repair outcomes.
pub trait IssueStore {
    async fn insert_issue(&self, issue: &IntegrityIssue) -> Result<()>;

    /// Record a repair outcome exactly once; a second attempt on the same
    /// issue must be rejected (file a new issue instead).
    async fn archive_issue_repair(
        &self,
        issue_id: Uuid,
        method: &str,
        successful: bool,
        details: &str,
    ) -> Result<()>;
}

//! Postgres store wiring.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use jnl_schemas::{ExecutionRecord, IntegrityIssue, Position};

use crate::stores::{ExecutionStore, IssueStore, PositionStore};

/// The production store: all three store traits over one Postgres pool.
#[derive(Clone)]
pub struct PgStores {
    pool: PgPool,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ExecutionStore for PgStores {
    async fn fetch_executions(
        &self,
        account: &str,
        instrument: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        jnl_db::fetch_executions(&self.pool, account, instrument, since).await
    }

    async fn apply_correction(
        &self,
        voided_ids: &[Uuid],
        inserted: &[ExecutionRecord],
    ) -> Result<()> {
        jnl_db::apply_correction(&self.pool, voided_ids, inserted).await
    }

    async fn list_scopes(&self) -> Result<Vec<(String, String)>> {
        jnl_db::list_scopes(&self.pool).await
    }
}

impl PositionStore for PgStores {
    async fn load_positions(&self, account: &str, instrument: &str) -> Result<Vec<Position>> {
        jnl_db::load_positions(&self.pool, account, instrument).await
    }

    async fn replace_positions(
        &self,
        account: &str,
        instrument: &str,
        positions: &[Position],
    ) -> Result<()> {
        jnl_db::replace_positions(&self.pool, account, instrument, positions).await
    }
}

impl IssueStore for PgStores {
    async fn insert_issue(&self, issue: &IntegrityIssue) -> Result<()> {
        jnl_db::insert_issue(&self.pool, issue).await
    }

    async fn archive_issue_repair(
        &self,
        issue_id: Uuid,
        method: &str,
        successful: bool,
        details: &str,
    ) -> Result<()> {
        jnl_db::archive_issue_repair(&self.pool, issue_id, method, successful, details).await
    }
}

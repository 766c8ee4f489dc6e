//! jnl-testkit
//!
//! In-memory store implementation plus fixtures for the cross-crate
//! scenario tests under `tests/`. The in-memory store honors the same
//! contracts as the Postgres store: canonical fetch order, atomic scope
//! replacement, append-only issues with write-once repair outcomes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use jnl_config::EngineConfig;
use jnl_runtime::{ExecutionStore, IssueStore, PositionStore};
use jnl_schemas::{ExecutionRecord, IntegrityIssue, Position, RoleHint, Side, MICROS_SCALE};

// ---------------------------------------------------------------------------
// In-memory stores
// ---------------------------------------------------------------------------

/// Full store contents, for before/after comparisons in purity tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreDump {
    pub executions: Vec<ExecutionRecord>,
    pub positions: BTreeMap<(String, String), Vec<Position>>,
    pub issues: Vec<IntegrityIssue>,
}

#[derive(Clone)]
pub struct MemStores {
    inner: Arc<Mutex<StoreDump>>,
}

impl Default for MemStores {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStores {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreDump::default())),
        }
    }

    pub fn seed_executions(&self, records: impl IntoIterator<Item = ExecutionRecord>) {
        let mut state = self.inner.lock().unwrap();
        state.executions.extend(records);
    }

    /// Snapshot of everything the store holds.
    pub fn dump(&self) -> StoreDump {
        self.inner.lock().unwrap().clone()
    }

    pub fn positions_for(&self, account: &str, instrument: &str) -> Vec<Position> {
        self.inner
            .lock()
            .unwrap()
            .positions
            .get(&(account.to_string(), instrument.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn issues(&self) -> Vec<IntegrityIssue> {
        self.inner.lock().unwrap().issues.clone()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.inner.lock().unwrap().executions.clone()
    }

    /// Corrupt a stored position row in place; test-only, for exercising
    /// the validator against drifted store state.
    pub fn tamper_position(
        &self,
        account: &str,
        instrument: &str,
        index: usize,
        f: impl FnOnce(&mut Position),
    ) {
        let mut state = self.inner.lock().unwrap();
        let rows = state
            .positions
            .get_mut(&(account.to_string(), instrument.to_string()))
            .expect("scope has stored positions");
        f(&mut rows[index]);
    }
}

impl ExecutionStore for MemStores {
    async fn fetch_executions(
        &self,
        account: &str,
        instrument: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        let state = self.inner.lock().unwrap();
        let mut records: Vec<ExecutionRecord> = state
            .executions
            .iter()
            .filter(|r| r.account == account && r.instrument == instrument)
            .filter(|r| since.map_or(true, |s| r.ts_utc >= s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.ts_utc.cmp(&b.ts_utc).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn apply_correction(
        &self,
        voided_ids: &[Uuid],
        inserted: &[ExecutionRecord],
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        for id in voided_ids {
            match state.executions.iter_mut().find(|r| r.id == *id) {
                Some(rec) => rec.voided = true,
                None => bail!("void target {id} not found"),
            }
        }
        state.executions.extend(inserted.iter().cloned());
        Ok(())
    }

    async fn list_scopes(&self) -> Result<Vec<(String, String)>> {
        let state = self.inner.lock().unwrap();
        let mut scopes: Vec<(String, String)> = state
            .executions
            .iter()
            .map(|r| (r.account.clone(), r.instrument.clone()))
            .collect();
        scopes.sort();
        scopes.dedup();
        Ok(scopes)
    }
}

impl PositionStore for MemStores {
    async fn load_positions(&self, account: &str, instrument: &str) -> Result<Vec<Position>> {
        Ok(self.positions_for(account, instrument))
    }

    async fn replace_positions(
        &self,
        account: &str,
        instrument: &str,
        positions: &[Position],
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.positions.insert(
            (account.to_string(), instrument.to_string()),
            positions.to_vec(),
        );
        Ok(())
    }
}

impl IssueStore for MemStores {
    async fn insert_issue(&self, issue: &IntegrityIssue) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.issues.push(issue.clone());
        Ok(())
    }

    async fn archive_issue_repair(
        &self,
        issue_id: Uuid,
        method: &str,
        successful: bool,
        details: &str,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let Some(issue) = state.issues.iter_mut().find(|i| i.id == issue_id) else {
            bail!("issue {issue_id} not found");
        };
        if issue.repair_attempted {
            bail!("issue {issue_id} already has a repair recorded");
        }
        issue.repair_attempted = true;
        issue.repair_method = Some(method.to_string());
        issue.repair_successful = Some(successful);
        issue.repair_details = Some(details.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// A complete execution record fixture. Price in whole dollars.
pub fn exec(
    id: u128,
    account: &str,
    instrument: &str,
    side: Side,
    qty: i64,
    price: i64,
    t_secs: i64,
) -> ExecutionRecord {
    ExecutionRecord {
        id: Uuid::from_u128(id),
        account: account.to_string(),
        instrument: instrument.to_string(),
        side: Some(side),
        role_hint: RoleHint::Unknown,
        quantity: Some(qty),
        price_micros: Some(price * MICROS_SCALE),
        ts_utc: ts(t_secs),
        commission_micros: 0,
        source_seq: None,
        supersedes: None,
        voided: false,
    }
}

pub fn strict_config() -> EngineConfig {
    EngineConfig::from_yaml_str(
        r#"
engine:
  sign_flip_policy: strict
instruments:
  ES: { multiplier: "50" }
"#,
    )
    .expect("fixture config parses")
}

pub fn permissive_config() -> EngineConfig {
    EngineConfig::from_yaml_str(
        r#"
engine:
  sign_flip_policy: permissive
instruments:
  ES: { multiplier: "50" }
"#,
    )
    .expect("fixture config parses")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jnl_positions::CancelToken;
    use jnl_runtime::PositionService;

    #[tokio::test]
    async fn mem_store_fetch_is_canonically_ordered() {
        let stores = MemStores::new();
        stores.seed_executions([
            exec(2, "acct", "ES", Side::Sell, 1, 101, 10),
            exec(1, "acct", "ES", Side::Buy, 1, 100, 0),
        ]);
        let records = stores.fetch_executions("acct", "ES", None).await.unwrap();
        assert_eq!(records[0].id, Uuid::from_u128(1));
        assert_eq!(records[1].id, Uuid::from_u128(2));
    }

    #[tokio::test]
    async fn archive_is_write_once() {
        let stores = MemStores::new();
        let service = PositionService::new(stores.clone(), strict_config());
        stores.seed_executions([
            exec(1, "acct", "ES", Side::Buy, 5, 100, 0),
            exec(2, "acct", "ES", Side::Sell, 8, 110, 10),
        ]);
        service
            .rebuild_scope("acct", "ES", &CancelToken::new())
            .await
            .unwrap();
        let issue = stores.issues()[0].clone();

        stores
            .archive_issue_repair(issue.id, "fifo_reconciliation", false, "first")
            .await
            .unwrap();
        let err = stores
            .archive_issue_repair(issue.id, "fifo_reconciliation", true, "second")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already"));
    }
}

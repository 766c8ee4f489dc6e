//! Rebuild / validate / repair orchestration.

use std::sync::Mutex as StdMutex;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use jnl_audit::AuditLog;
use jnl_config::EngineConfig;
use jnl_positions::{
    build_positions, sort_executions_canonical, validate_execution, CancelToken,
};
use jnl_repair::{apply_plan, propose, CorrectionPlan, RepairResult};
use jnl_schemas::{Execution, ExecutionRecord, IntegrityIssue, Position};

use crate::locks::ScopeLocks;
use crate::stores::{ExecutionStore, IssueStore, PositionStore};

/// What one scope rebuild produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebuildSummary {
    pub positions: usize,
    pub issues_raised: usize,
    pub open_tail: bool,
}

/// Per-scope result of a batch rebuild.
#[derive(Debug)]
pub struct ScopeOutcome {
    pub account: String,
    pub instrument: String,
    pub result: Result<RebuildSummary>,
}

/// Outcome of an `apply_repair` call.
#[derive(Clone, Debug)]
pub struct RepairReport {
    pub result: RepairResult,
    /// The position rows the scope would hold (dry-run) or now holds after
    /// the correction.
    pub predicted_positions: Vec<Position>,
    /// Fresh issues surfaced by the post-correction rebuild.
    pub follow_up_issues: Vec<IntegrityIssue>,
    pub dry_run: bool,
}

/// The engine's service facade over a store implementation.
///
/// Holds no per-scope computation state: every walk builds its own
/// accumulator. The service only owns the store handle, the policy config,
/// the scope locks, and (optionally) the audit log.
pub struct PositionService<S> {
    store: S,
    config: EngineConfig,
    locks: ScopeLocks,
    audit: Option<StdMutex<AuditLog>>,
}

/// The complete, well-formed, non-voided executions of a record set.
fn usable_executions(records: &[ExecutionRecord]) -> Vec<Execution> {
    records
        .iter()
        .filter(|r| !r.voided)
        .filter_map(|r| r.validate().ok())
        .filter(|ex| validate_execution(ex).is_ok())
        .collect()
}

/// Record-level diff after a repair: which originals were voided and which
/// superseding records are new.
fn diff_corrections(
    before: &[ExecutionRecord],
    after: &[ExecutionRecord],
) -> (Vec<Uuid>, Vec<ExecutionRecord>) {
    let voided: Vec<Uuid> = before
        .iter()
        .filter(|orig| !orig.voided)
        .filter(|orig| {
            after
                .iter()
                .any(|rec| rec.id == orig.id && rec.voided)
        })
        .map(|orig| orig.id)
        .collect();
    let inserted: Vec<ExecutionRecord> = after
        .iter()
        .filter(|rec| !before.iter().any(|orig| orig.id == rec.id))
        .cloned()
        .collect();
    (voided, inserted)
}

impl<S> PositionService<S>
where
    S: ExecutionStore + PositionStore + IssueStore,
{
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            locks: ScopeLocks::new(),
            audit: None,
        }
    }

    /// Attach an audit log; every issue, repair, and rebuild commit is
    /// appended to it.
    pub fn with_audit(mut self, log: AuditLog) -> Self {
        self.audit = Some(StdMutex::new(log));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn audit_with(
        &self,
        f: impl FnOnce(&mut AuditLog) -> Result<jnl_audit::AuditEvent>,
    ) -> Result<()> {
        if let Some(audit) = &self.audit {
            let mut log = audit.lock().expect("audit log poisoned");
            f(&mut log)?;
        }
        Ok(())
    }

    fn audit_issue(&self, issue: &IntegrityIssue) -> Result<()> {
        self.audit_with(|log| {
            log.issue_raised(
                issue.id,
                issue.kind.as_str(),
                issue.severity.as_str(),
                &issue.detail,
            )
        })
    }

    // -----------------------------------------------------------------------
    // Rebuild
    // -----------------------------------------------------------------------

    /// Rebuild one scope's positions from its execution stream and commit
    /// them atomically. Holds the scope lock for the duration.
    pub async fn rebuild_scope(
        &self,
        account: &str,
        instrument: &str,
        cancel: &CancelToken,
    ) -> Result<RebuildSummary> {
        let lock = self.locks.lock_for(account, instrument);
        let _guard = lock.lock().await;
        self.rebuild_scope_locked(account, instrument, cancel).await
    }

    async fn rebuild_scope_locked(
        &self,
        account: &str,
        instrument: &str,
        cancel: &CancelToken,
    ) -> Result<RebuildSummary> {
        let records = self
            .store
            .fetch_executions(account, instrument, None)
            .await?;
        let mut executions = usable_executions(&records);
        sort_executions_canonical(&mut executions);

        let multiplier = self.config.instrument_multiplier(instrument);
        let outcome = build_positions(
            &self.config.flow_config(),
            account,
            instrument,
            &executions,
            multiplier,
            cancel,
        )?;

        // Commit-at-end: a cancellation observed here leaves the prior
        // position rows exactly as they were.
        if cancel.is_cancelled() {
            bail!("rebuild of ({account}, {instrument}) cancelled before commit");
        }
        let positions = outcome.position_records();
        self.store
            .replace_positions(account, instrument, &positions)
            .await?;
        for issue in &outcome.issues {
            self.store.insert_issue(issue).await?;
            self.audit_issue(issue)?;
        }
        self.audit_with(|log| {
            log.rebuild_committed(account, instrument, positions.len(), outcome.issues.len())
        })?;
        info!(
            account,
            instrument,
            positions = positions.len(),
            issues = outcome.issues.len(),
            "scope rebuilt"
        );

        Ok(RebuildSummary {
            positions: positions.len(),
            issues_raised: outcome.issues.len(),
            open_tail: outcome.tail.is_some(),
        })
    }

    /// Rebuild every known scope, fanning out in parallel. Scopes are
    /// independent; one failing scope does not stop the others.
    pub async fn rebuild_all(&self, cancel: &CancelToken) -> Result<Vec<ScopeOutcome>> {
        let scopes = self.store.list_scopes().await?;
        let tasks: Vec<_> = scopes
            .into_iter()
            .map(|(account, instrument)| {
                let cancel = cancel.clone();
                async move {
                    let result = self.rebuild_scope(&account, &instrument, &cancel).await;
                    ScopeOutcome {
                        account,
                        instrument,
                        result,
                    }
                }
            })
            .collect();
        Ok(futures_util::future::join_all(tasks).await)
    }

    // -----------------------------------------------------------------------
    // Validate
    // -----------------------------------------------------------------------

    /// Validate one scope and archive any issues found. Takes the scope lock
    /// so validation never observes a half-committed rebuild of its own
    /// scope; other scopes are unaffected.
    pub async fn validate_scope(
        &self,
        account: &str,
        instrument: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<IntegrityIssue>> {
        let lock = self.locks.lock_for(account, instrument);
        let _guard = lock.lock().await;

        let records = self
            .store
            .fetch_executions(account, instrument, None)
            .await?;
        let stored = self.store.load_positions(account, instrument).await?;
        let multiplier = self.config.instrument_multiplier(instrument);

        let issues = jnl_integrity::validate_scope(
            &self.config.flow_config(),
            account,
            instrument,
            &records,
            &stored,
            multiplier,
            Utc::now(),
            cancel,
        )?;

        for issue in &issues {
            self.store.insert_issue(issue).await?;
            self.audit_issue(issue)?;
        }
        info!(account, instrument, issues = issues.len(), "scope validated");
        Ok(issues)
    }

    /// Validate every known scope.
    pub async fn validate_all(&self, cancel: &CancelToken) -> Result<Vec<IntegrityIssue>> {
        let scopes = self.store.list_scopes().await?;
        let tasks: Vec<_> = scopes
            .into_iter()
            .map(|(account, instrument)| {
                let cancel = cancel.clone();
                async move {
                    self.validate_scope(&account, &instrument, &cancel).await
                }
            })
            .collect();
        let mut all = Vec::new();
        for result in futures_util::future::join_all(tasks).await {
            all.extend(result?);
        }
        Ok(all)
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Compute a correction plan for an issue against current records.
    pub async fn propose_repair(&self, issue: &IntegrityIssue) -> Result<CorrectionPlan> {
        let lock = self
            .locks
            .lock_for(&issue.scope.account, &issue.scope.instrument);
        let _guard = lock.lock().await;

        let records = self
            .store
            .fetch_executions(&issue.scope.account, &issue.scope.instrument, None)
            .await?;
        let plan = propose(issue, &records);
        self.audit_with(|log| {
            log.repair_proposed(issue.id, plan.method().as_str(), !plan.is_unrepairable())
        })?;
        Ok(plan)
    }

    /// Apply a plan. With `dry_run` the stores are left byte-identical and
    /// only the predicted effect is returned. A real apply holds the scope
    /// lock across correction + rebuild + archive; a repair that cannot
    /// complete cleanly fails closed, mutating nothing but the issue's own
    /// repair-outcome record.
    pub async fn apply_repair(
        &self,
        issue: &IntegrityIssue,
        plan: &CorrectionPlan,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> Result<RepairReport> {
        let account = issue.scope.account.clone();
        let instrument = issue.scope.instrument.clone();
        let lock = self.locks.lock_for(&account, &instrument);
        let _guard = lock.lock().await;

        let records = self
            .store
            .fetch_executions(&account, &instrument, None)
            .await?;
        let multiplier = self.config.instrument_multiplier(&instrument);
        let outcome = apply_plan(
            &self.config.flow_config(),
            &account,
            &instrument,
            plan,
            &records,
            multiplier,
            cancel,
        );

        let predicted_positions = outcome
            .rebuilt
            .as_ref()
            .map(|r| r.position_records())
            .unwrap_or_default();
        let follow_up_issues = outcome
            .rebuilt
            .as_ref()
            .map(|r| r.issues.clone())
            .unwrap_or_default();

        if dry_run {
            return Ok(RepairReport {
                result: outcome.result,
                predicted_positions,
                follow_up_issues,
                dry_run: true,
            });
        }

        if !outcome.result.successful {
            // Fail closed: the flagged scope stays visibly inconsistent
            // instead of receiving a partially-consistent correction.
            self.store
                .archive_issue_repair(
                    issue.id,
                    outcome.result.method.as_str(),
                    false,
                    &outcome.result.details,
                )
                .await?;
            self.audit_with(|log| {
                log.repair_applied(
                    issue.id,
                    outcome.result.method.as_str(),
                    false,
                    &outcome.result.details,
                )
            })?;
            warn!(
                account = %account,
                instrument = %instrument,
                issue = %issue.id,
                details = %outcome.result.details,
                "repair failed closed"
            );
            return Ok(RepairReport {
                result: outcome.result,
                predicted_positions: Vec::new(),
                follow_up_issues,
                dry_run: false,
            });
        }

        if cancel.is_cancelled() {
            bail!("repair of ({account}, {instrument}) cancelled before commit");
        }

        let (voided, inserted) = diff_corrections(&records, &outcome.records);
        self.store.apply_correction(&voided, &inserted).await?;
        self.store
            .replace_positions(&account, &instrument, &predicted_positions)
            .await?;
        for follow_up in &follow_up_issues {
            self.store.insert_issue(follow_up).await?;
            self.audit_issue(follow_up)?;
        }
        self.store
            .archive_issue_repair(
                issue.id,
                outcome.result.method.as_str(),
                true,
                &outcome.result.details,
            )
            .await?;
        self.audit_with(|log| {
            log.repair_applied(
                issue.id,
                outcome.result.method.as_str(),
                true,
                &outcome.result.details,
            )
        })?;
        self.audit_with(|log| {
            log.rebuild_committed(
                &account,
                &instrument,
                predicted_positions.len(),
                follow_up_issues.len(),
            )
        })?;
        info!(
            account = %account,
            instrument = %instrument,
            issue = %issue.id,
            corrections = voided.len(),
            "repair applied and scope rebuilt"
        );

        Ok(RepairReport {
            result: outcome.result,
            predicted_positions,
            follow_up_issues,
            dry_run: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use jnl_schemas::{RoleHint, Side, MICROS_SCALE};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(id: u128, voided: bool) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::from_u128(id),
            account: "acct".into(),
            instrument: "ES".into(),
            side: Some(Side::Buy),
            role_hint: RoleHint::Unknown,
            quantity: Some(1),
            price_micros: Some(100 * MICROS_SCALE),
            ts_utc: ts(0),
            commission_micros: 0,
            source_seq: None,
            supersedes: None,
            voided,
        }
    }

    #[test]
    fn diff_picks_up_voids_and_inserts() {
        let before = vec![record(1, false), record(2, false)];
        let mut after = before.clone();
        after[0].voided = true;
        let mut replacement = record(3, false);
        replacement.supersedes = Some(Uuid::from_u128(1));
        after.push(replacement.clone());

        let (voided, inserted) = diff_corrections(&before, &after);
        assert_eq!(voided, vec![Uuid::from_u128(1)]);
        assert_eq!(inserted, vec![replacement]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let before = vec![record(1, false)];
        let (voided, inserted) = diff_corrections(&before, &before.clone());
        assert!(voided.is_empty());
        assert!(inserted.is_empty());
    }
}

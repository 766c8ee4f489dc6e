//! Propose/apply entry points.

use uuid::Uuid;

use jnl_positions::{
    build_positions, sort_executions_canonical, validate_execution, CancelToken, FlowConfig,
    FlowOutcome,
};
use jnl_schemas::{Execution, ExecutionRecord, IntegrityIssue, IssueKind, RoleHint};

use crate::completion::plan_completion;
use crate::fifo::reconcile_fifo;
use crate::plan::{CorrectionAction, CorrectionPlan, RepairMethod, RepairResult};
use crate::timestamp::plan_reorder;

/// Namespace for deriving superseding record ids. Deterministic so that a
/// dry-run and the subsequent real apply produce byte-identical corrections.
const SUPERSEDE_ID_NS: Uuid = Uuid::from_u128(0x6a6e_6c2d_7265_7061_6972_2d73_7570_6572);

fn superseding_id(original: Uuid, part: u8) -> Uuid {
    let mut buf = [0u8; 17];
    buf[..16].copy_from_slice(original.as_bytes());
    buf[16] = part;
    Uuid::new_v5(&SUPERSEDE_ID_NS, &buf)
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

// ---------------------------------------------------------------------------
// propose
// ---------------------------------------------------------------------------

/// Compute a correction plan for an issue against the scope's records.
///
/// Pure and deterministic: proposing twice over the same inputs yields the
/// same plan. Nothing is read from or written to any store.
pub fn propose(issue: &IntegrityIssue, records: &[ExecutionRecord]) -> CorrectionPlan {
    match issue.kind {
        IssueKind::QuantityMismatch => {
            let mut sandbox = usable_executions(records);
            sort_executions_canonical(&mut sandbox);
            let findings = reconcile_fifo(&sandbox);
            CorrectionPlan::Apply {
                issue_id: issue.id,
                method: RepairMethod::FifoReconciliation,
                actions: findings.actions,
                unresolved: findings.unresolved,
            }
        }
        IssueKind::TimestampAnomaly => match plan_reorder(issue, records) {
            Ok(actions) => CorrectionPlan::Apply {
                issue_id: issue.id,
                method: RepairMethod::TimestampCorrection,
                actions,
                unresolved: Vec::new(),
            },
            Err(reason) => CorrectionPlan::Unrepairable {
                issue_id: issue.id,
                method: RepairMethod::TimestampCorrection,
                reason,
            },
        },
        IssueKind::IncompleteData => match plan_completion(records) {
            Ok(actions) => CorrectionPlan::Apply {
                issue_id: issue.id,
                method: RepairMethod::DataCompletion,
                actions,
                unresolved: Vec::new(),
            },
            Err(reason) => CorrectionPlan::Unrepairable {
                issue_id: issue.id,
                method: RepairMethod::DataCompletion,
                reason,
            },
        },
    }
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// What applying a plan produced.
///
/// `records` is the corrected record set (or the untouched originals when
/// the apply failed closed); `rebuilt` is the scope rebuilt from the
/// corrected records. Persisting either is the caller's decision; this
/// function mutates nothing, which is what makes dry-run trivially pure.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    pub records: Vec<ExecutionRecord>,
    pub rebuilt: Option<FlowOutcome>,
    pub result: RepairResult,
}

fn fail_closed(records: &[ExecutionRecord], method: RepairMethod, details: String) -> ApplyOutcome {
    ApplyOutcome {
        records: records.to_vec(),
        rebuilt: None,
        result: RepairResult {
            successful: false,
            method,
            details,
        },
    }
}

/// Apply a plan to a record set and rebuild the scope.
///
/// Fails closed: if any action's target is missing, or the rebuild over the
/// corrected records violates the flow invariants, the original records are
/// returned untouched with `successful = false`. A plan with unresolved
/// remainders applies its confirmed corrections but still reports
/// `successful = false`; the orphan volume resurfaces as a fresh issue in
/// `rebuilt.issues` rather than disappearing into a fabricated fill.
pub fn apply_plan(
    cfg: &FlowConfig,
    account: &str,
    instrument: &str,
    plan: &CorrectionPlan,
    records: &[ExecutionRecord],
    multiplier_micros: i64,
    cancel: &CancelToken,
) -> ApplyOutcome {
    let (actions, unresolved, method) = match plan {
        CorrectionPlan::Unrepairable { method, reason, .. } => {
            return fail_closed(records, *method, format!("unrepairable: {reason}"));
        }
        CorrectionPlan::Apply {
            actions,
            unresolved,
            method,
            ..
        } => (actions, unresolved, *method),
    };

    let mut corrected = records.to_vec();
    for action in actions {
        if !apply_action(&mut corrected, action) {
            return fail_closed(
                records,
                method,
                format!(
                    "target execution {} missing or already voided",
                    action.execution_id()
                ),
            );
        }
    }

    let mut sandbox = usable_executions(&corrected);
    sort_executions_canonical(&mut sandbox);
    let rebuilt = match build_positions(
        cfg,
        account,
        instrument,
        &sandbox,
        multiplier_micros,
        cancel,
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            return fail_closed(records, method, format!("rebuild failed: {err}"));
        }
    };

    let clean = unresolved.is_empty() && rebuilt.issues.is_empty();
    let details = if clean {
        format!(
            "applied {} correction(s); scope rebuilt consistent",
            actions.len()
        )
    } else {
        let orphans: Vec<String> = unresolved
            .iter()
            .map(|u| format!("{} lot(s) of execution {}", u.quantity, u.execution_id))
            .collect();
        format!(
            "applied {} correction(s); unmatched volume remains open: {}",
            actions.len(),
            if orphans.is_empty() {
                "see rebuild issues".to_string()
            } else {
                orphans.join("; ")
            }
        )
    };

    ApplyOutcome {
        records: corrected,
        rebuilt: Some(rebuilt),
        result: RepairResult {
            successful: clean,
            method,
            details,
        },
    }
}

/// Supersede the target record according to the action. Returns false when
/// the target is absent or voided.
fn apply_action(records: &mut Vec<ExecutionRecord>, action: &CorrectionAction) -> bool {
    let Some(idx) = records
        .iter()
        .position(|r| r.id == action.execution_id() && !r.voided)
    else {
        return false;
    };
    let original = records[idx].clone();
    records[idx].voided = true;

    match action {
        CorrectionAction::RelabelHint { to, .. } => {
            let mut rec = original.clone();
            rec.id = superseding_id(original.id, 0);
            rec.role_hint = *to;
            rec.supersedes = Some(original.id);
            records.push(rec);
        }
        CorrectionAction::SplitExecution {
            close_qty, open_qty, ..
        } => {
            // The exit part must sort before the entry part on the canonical
            // id tie-break (they share a timestamp), so the rebuild closes
            // before it reopens.
            let id_a = superseding_id(original.id, 0);
            let id_b = superseding_id(original.id, 1);
            let (exit_id, entry_id) = if id_a < id_b { (id_a, id_b) } else { (id_b, id_a) };

            let mut exit_part = original.clone();
            exit_part.id = exit_id;
            exit_part.quantity = Some(*close_qty);
            exit_part.role_hint = RoleHint::Exit;
            exit_part.supersedes = Some(original.id);

            let mut entry_part = original.clone();
            entry_part.id = entry_id;
            entry_part.quantity = Some(*open_qty);
            entry_part.role_hint = RoleHint::Entry;
            entry_part.supersedes = Some(original.id);
            // Commission stays with the part that closes the old position.
            entry_part.commission_micros = 0;

            records.push(exit_part);
            records.push(entry_part);
        }
        CorrectionAction::ReassignTimestamp { new_ts, .. } => {
            let mut rec = original.clone();
            rec.id = superseding_id(original.id, 0);
            rec.ts_utc = *new_ts;
            rec.supersedes = Some(original.id);
            records.push(rec);
        }
        CorrectionAction::FillQuantity { quantity, .. } => {
            let mut rec = original.clone();
            rec.id = superseding_id(original.id, 0);
            rec.quantity = Some(*quantity);
            rec.supersedes = Some(original.id);
            records.push(rec);
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

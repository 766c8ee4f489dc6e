//! Timestamp correction.
//!
//! Only applicable when the upstream feed stamped every affected execution
//! with an auxiliary `source_seq`. The existing timestamps are reassigned
//! across the affected records in sequence order; no timestamp is ever
//! invented, only redistributed.

use std::collections::BTreeSet;

use jnl_schemas::{ExecutionRecord, IntegrityIssue};

use crate::plan::CorrectionAction;

/// Plan a reorder for the executions an anomaly names.
///
/// Returns the reassignment actions, or a reason the anomaly is
/// unrepairable.
pub(crate) fn plan_reorder(
    issue: &IntegrityIssue,
    records: &[ExecutionRecord],
) -> Result<Vec<CorrectionAction>, String> {
    let mut members: Vec<&ExecutionRecord> = Vec::new();
    for id in &issue.scope.execution_ids {
        match records.iter().find(|r| r.id == *id && !r.voided) {
            Some(rec) => members.push(rec),
            None => return Err(format!("referenced execution {id} not found or voided")),
        }
    }
    if members.len() < 2 {
        return Err("fewer than two executions in scope; nothing to reorder".to_string());
    }

    let mut seqs: Vec<u64> = Vec::with_capacity(members.len());
    for rec in &members {
        match rec.source_seq {
            Some(seq) => seqs.push(seq),
            None => {
                return Err(format!(
                    "execution {} has no source sequence id; true fill order unrecoverable",
                    rec.id
                ))
            }
        }
    }
    let distinct: BTreeSet<u64> = seqs.iter().copied().collect();
    if distinct.len() != seqs.len() {
        return Err("duplicate source sequence ids; true fill order ambiguous".to_string());
    }

    // Redistribute the existing timestamps over the members in sequence
    // order.
    let mut timestamps: Vec<_> = members.iter().map(|r| r.ts_utc).collect();
    timestamps.sort();
    let mut by_seq = members.clone();
    by_seq.sort_by_key(|r| r.source_seq.expect("checked above"));

    let mut actions = Vec::new();
    for (rec, new_ts) in by_seq.iter().zip(timestamps) {
        if rec.ts_utc != new_ts {
            actions.push(CorrectionAction::ReassignTimestamp {
                execution_id: rec.id,
                new_ts,
            });
        }
    }
    if actions.is_empty() {
        return Err(
            "source sequence order already matches stored timestamps; manual resolution required"
                .to_string(),
        );
    }
    Ok(actions)
}

//! Read-only sandbox replay + diff.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jnl_positions::{
    build_positions, sort_executions_canonical, validate_execution, CancelToken, FlowConfig,
    FlowError,
};
use jnl_schemas::{
    Execution, ExecutionRecord, IntegrityIssue, IssueScope, MissingField, Position, RoleHint,
};

use crate::severity::{kind_for, severity_for, IntegrityCheck};

fn file_issue(
    check: IntegrityCheck,
    scope: IssueScope,
    detail: String,
    as_of: DateTime<Utc>,
) -> IntegrityIssue {
    IntegrityIssue::new(kind_for(check), severity_for(check), scope, detail, as_of)
}

/// Validate one (account, instrument) scope.
///
/// Re-runs the builder over the stored execution records in a sandbox (the
/// local copy is sorted canonically; the store is never touched) and diffs
/// the derived positions against the stored rows. Returns every discrepancy
/// as a typed issue, in a deterministic order.
///
/// `cfg` must be the same flow config the scope was built with; validating
/// a permissive-built scope under strict rules would report policy
/// differences as corruption.
///
/// The only error paths are cancellation and batch-level input failures the
/// sandbox itself cannot absorb.
pub fn validate_scope(
    cfg: &FlowConfig,
    account: &str,
    instrument: &str,
    records: &[ExecutionRecord],
    stored: &[Position],
    multiplier_micros: i64,
    as_of: DateTime<Utc>,
    cancel: &CancelToken,
) -> Result<Vec<IntegrityIssue>, FlowError> {
    let scope = || IssueScope::new(account, instrument);
    let mut issues: Vec<IntegrityIssue> = Vec::new();

    // 1) Record completeness. Voided records are lineage, not facts.
    let mut sandbox: Vec<Execution> = Vec::new();
    for rec in records.iter().filter(|r| !r.voided) {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        match rec.validate() {
            Err(incomplete) => {
                let check = if incomplete.missing == [MissingField::Quantity] {
                    // A lone quantity gap may be recoverable from
                    // conservation; price and side never are.
                    IntegrityCheck::IncompleteInferable
                } else {
                    IntegrityCheck::IncompleteMalformed
                };
                issues.push(file_issue(
                    check,
                    scope().with_executions(vec![rec.id]),
                    incomplete.to_string(),
                    as_of,
                ));
            }
            Ok(ex) => match validate_execution(&ex) {
                Err(err) => {
                    issues.push(file_issue(
                        IntegrityCheck::IncompleteMalformed,
                        scope().with_executions(vec![rec.id]),
                        err.to_string(),
                        as_of,
                    ));
                }
                Ok(()) => sandbox.push(ex),
            },
        }
    }

    // 2) Sandbox replay over the usable executions.
    sort_executions_canonical(&mut sandbox);
    let rebuilt = build_positions(cfg, account, instrument, &sandbox, multiplier_micros, cancel)?;

    // Sign-flips re-detected during replay file as fresh issues.
    for flip in &rebuilt.issues {
        debug_assert_eq!(
            severity_for(IntegrityCheck::MidSequenceMismatch),
            flip.severity
        );
        issues.push(flip.clone());
    }

    // 3) Stored-row invariants.
    let record_by_id: BTreeMap<Uuid, &ExecutionRecord> =
        records.iter().map(|r| (r.id, r)).collect();
    for pos in stored {
        check_stored_position(pos, &record_by_id, &mut issues, as_of);
    }

    // 4) Diff stored vs recomputed position sets.
    diff_position_sets(&rebuilt.position_records(), stored, &mut issues, as_of, scope());

    // Deterministic report order.
    issues.sort_by(|a, b| {
        (a.kind, a.severity, &a.detail).cmp(&(b.kind, b.severity, &b.detail))
    });
    Ok(issues)
}

fn check_stored_position(
    pos: &Position,
    record_by_id: &BTreeMap<Uuid, &ExecutionRecord>,
    issues: &mut Vec<IntegrityIssue>,
    as_of: DateTime<Utc>,
) {
    let scope = || IssueScope::new(pos.account.clone(), pos.instrument.clone());

    // Conservation on closed rows.
    if !pos.conservation_holds() {
        issues.push(file_issue(
            IntegrityCheck::ClosedPositionImbalance,
            scope().with_positions(vec![pos.id]),
            format!(
                "closed position {} entry qty {} != exit qty {}",
                pos.id, pos.total_entry_qty, pos.total_exit_qty
            ),
            as_of,
        ));
    }

    // Constituent count: at least one execution per non-zero side of the
    // quantity arithmetic.
    let implied_min =
        (pos.total_entry_qty > 0) as usize + (pos.total_exit_qty > 0) as usize;
    if pos.execution_ids.len() < implied_min {
        issues.push(file_issue(
            IntegrityCheck::ConstituentShortfall,
            scope().with_positions(vec![pos.id]),
            format!(
                "position {} lists {} constituent executions but its quantities imply at least {}",
                pos.id,
                pos.execution_ids.len(),
                implied_min
            ),
            as_of,
        ));
    }

    check_role_ordering(pos, record_by_id, issues, as_of);
}

/// Timestamp anomalies: an exit-labelled fill ordered before any
/// entry-labelled fill of its position: either strictly earlier, or tied
/// on the timestamp but sorting first on the canonical id tie-break.
fn check_role_ordering(
    pos: &Position,
    record_by_id: &BTreeMap<Uuid, &ExecutionRecord>,
    issues: &mut Vec<IntegrityIssue>,
    as_of: DateTime<Utc>,
) {
    let members: Vec<&ExecutionRecord> = pos
        .execution_ids
        .iter()
        .filter_map(|id| record_by_id.get(id).copied())
        .collect();

    let first_entry = members
        .iter()
        .filter(|r| r.role_hint == RoleHint::Entry)
        .min_by_key(|r| (r.ts_utc, r.id));
    let Some(first_entry) = first_entry else {
        return;
    };

    for exit in members.iter().filter(|r| r.role_hint == RoleHint::Exit) {
        let inverted = exit.ts_utc < first_entry.ts_utc;
        let tied_out_of_order =
            exit.ts_utc == first_entry.ts_utc && exit.id < first_entry.id;
        if inverted || tied_out_of_order {
            let what = if inverted {
                "timestamped before"
            } else {
                "tied with but canonically ordered before"
            };
            issues.push(file_issue(
                IntegrityCheck::TimestampAnomaly,
                IssueScope::new(pos.account.clone(), pos.instrument.clone())
                    .with_positions(vec![pos.id])
                    .with_executions(vec![exit.id, first_entry.id]),
                format!(
                    "exit fill {} {} the first entry fill {} of its position",
                    exit.id, what, first_entry.id
                ),
                as_of,
            ));
        }
    }
}

fn diff_position_sets(
    expected: &[Position],
    stored: &[Position],
    issues: &mut Vec<IntegrityIssue>,
    as_of: DateTime<Utc>,
    scope: IssueScope,
) {
    let expected_by_id: BTreeMap<Uuid, &Position> = expected.iter().map(|p| (p.id, p)).collect();
    let stored_by_id: BTreeMap<Uuid, &Position> = stored.iter().map(|p| (p.id, p)).collect();

    let mut handled: BTreeSet<Uuid> = BTreeSet::new();

    // Unaccounted open quantity is the critical case, filed once, first.
    let stored_has_open = stored.iter().any(|p| p.closed_at.is_none());
    if let Some(open) = expected.iter().find(|p| p.closed_at.is_none()) {
        if !stored_has_open {
            issues.push(file_issue(
                IntegrityCheck::UnresolvedRunningQty,
                scope.clone().with_positions(vec![open.id]),
                format!(
                    "recomputed running quantity {} at end of scope but no stored open position",
                    open.open_qty_signed()
                ),
                as_of,
            ));
            handled.insert(open.id);
        }
    }

    for (id, exp) in &expected_by_id {
        if handled.contains(id) {
            continue;
        }
        match stored_by_id.get(id) {
            None => {
                issues.push(file_issue(
                    IntegrityCheck::PositionSetDivergence,
                    scope.clone().with_positions(vec![*id]),
                    format!("derived position {id} has no stored counterpart"),
                    as_of,
                ));
            }
            Some(st) => {
                let fields = divergent_fields(exp, st);
                if !fields.is_empty() {
                    issues.push(file_issue(
                        IntegrityCheck::PositionSetDivergence,
                        scope.clone().with_positions(vec![*id]),
                        format!("stored position {id} diverges on: {}", fields.join(", ")),
                        as_of,
                    ));
                }
            }
        }
    }

    for id in stored_by_id.keys() {
        if !expected_by_id.contains_key(id) {
            issues.push(file_issue(
                IntegrityCheck::PositionSetDivergence,
                scope.clone().with_positions(vec![*id]),
                format!("stored position {id} is not derivable from the execution stream"),
                as_of,
            ));
        }
    }
}

fn divergent_fields(expected: &Position, stored: &Position) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if expected.side != stored.side {
        fields.push("side");
    }
    if expected.total_entry_qty != stored.total_entry_qty {
        fields.push("total_entry_qty");
    }
    if expected.total_exit_qty != stored.total_exit_qty {
        fields.push("total_exit_qty");
    }
    if expected.avg_entry_price_micros != stored.avg_entry_price_micros {
        fields.push("avg_entry_price");
    }
    if expected.avg_exit_price_micros != stored.avg_exit_price_micros {
        fields.push("avg_exit_price");
    }
    if expected.realized_pnl_micros != stored.realized_pnl_micros {
        fields.push("realized_pnl");
    }
    if expected.closed_at != stored.closed_at {
        fields.push("closed_at");
    }
    if expected.total_commission_micros != stored.total_commission_micros {
        fields.push("total_commission");
    }
    fields
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jnl_schemas::{IssueKind, Severity, Side, MICROS_SCALE};

    const M: i64 = MICROS_SCALE;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(
        id: u128,
        side: Side,
        hint: RoleHint,
        qty: i64,
        price: i64,
        t: i64,
    ) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::from_u128(id),
            account: "acct".into(),
            instrument: "ES".into(),
            side: Some(side),
            role_hint: hint,
            quantity: Some(qty),
            price_micros: Some(price * M),
            ts_utc: ts(t),
            commission_micros: 0,
            source_seq: None,
            supersedes: None,
            voided: false,
        }
    }

    /// Stored rows exactly as the builder would derive them.
    fn derive(cfg: &FlowConfig, records: &[ExecutionRecord]) -> Vec<Position> {
        let mut execs: Vec<Execution> =
            records.iter().map(|r| r.validate().unwrap()).collect();
        sort_executions_canonical(&mut execs);
        build_positions(cfg, "acct", "ES", &execs, M, &CancelToken::new())
            .unwrap()
            .position_records()
    }

    fn validate(
        cfg: &FlowConfig,
        records: &[ExecutionRecord],
        stored: &[Position],
    ) -> Vec<IntegrityIssue> {
        validate_scope(
            cfg,
            "acct",
            "ES",
            records,
            stored,
            M,
            ts(1_000),
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn consistent_scope_yields_no_issues() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 3, 100, 0),
            record(2, Side::Sell, RoleHint::Exit, 3, 110, 10),
        ];
        let stored = derive(&cfg, &records);
        assert!(validate(&cfg, &records, &stored).is_empty());
    }

    #[test]
    fn validator_is_idempotent() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![record(1, Side::Buy, RoleHint::Entry, 3, 100, 0)];
        let stored: Vec<Position> = Vec::new(); // open position missing

        let fingerprint = |issues: &[IntegrityIssue]| -> Vec<(IssueKind, Severity, String)> {
            issues
                .iter()
                .map(|i| (i.kind, i.severity, i.detail.clone()))
                .collect()
        };
        let first = validate(&cfg, &records, &stored);
        let second = validate(&cfg, &records, &stored);
        assert_eq!(fingerprint(&first), fingerprint(&second));
    }

    #[test]
    fn unaccounted_open_quantity_is_critical() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![record(1, Side::Buy, RoleHint::Entry, 5, 100, 0)];
        let issues = validate(&cfg, &records, &[]);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::QuantityMismatch);
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    #[test]
    fn closed_imbalance_detected_as_high() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 3, 100, 0),
            record(2, Side::Sell, RoleHint::Exit, 3, 110, 10),
        ];
        let mut stored = derive(&cfg, &records);
        stored[0].total_exit_qty = 2; // corrupt the stored row

        let issues = validate(&cfg, &records, &stored);
        assert!(issues.iter().any(|i| {
            i.kind == IssueKind::QuantityMismatch
                && i.severity == Severity::High
                && i.detail.contains("entry qty 3 != exit qty 2")
        }));
    }

    #[test]
    fn stored_row_not_derivable_is_divergence() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 3, 100, 0),
            record(2, Side::Sell, RoleHint::Exit, 3, 110, 10),
        ];
        let mut stored = derive(&cfg, &records);
        // A phantom closed position nothing in the stream supports.
        let mut phantom = stored[0].clone();
        phantom.id = Uuid::from_u128(99);
        stored.push(phantom);

        let issues = validate(&cfg, &records, &stored);
        assert!(issues
            .iter()
            .any(|i| i.detail.contains("not derivable from the execution stream")));
    }

    #[test]
    fn field_divergence_lists_fields() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 3, 100, 0),
            record(2, Side::Sell, RoleHint::Exit, 3, 110, 10),
        ];
        let mut stored = derive(&cfg, &records);
        stored[0].avg_entry_price_micros = 99 * M;
        stored[0].realized_pnl_micros = Some(0);

        let issues = validate(&cfg, &records, &stored);
        let diverge = issues
            .iter()
            .find(|i| i.detail.contains("diverges on"))
            .expect("divergence issue");
        assert!(diverge.detail.contains("avg_entry_price"));
        assert!(diverge.detail.contains("realized_pnl"));
    }

    #[test]
    fn missing_quantity_alone_is_low() {
        let cfg = FlowConfig::strict_defaults();
        let mut rec = record(1, Side::Buy, RoleHint::Entry, 1, 100, 0);
        rec.quantity = None;
        let issues = validate(&cfg, &[rec], &[]);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::IncompleteData);
        assert_eq!(issues[0].severity, Severity::Low);
    }

    #[test]
    fn missing_price_is_medium() {
        let cfg = FlowConfig::strict_defaults();
        let mut rec = record(1, Side::Buy, RoleHint::Entry, 1, 100, 0);
        rec.price_micros = None;
        let issues = validate(&cfg, &[rec], &[]);

        assert_eq!(issues[0].severity, Severity::Medium);
    }

    #[test]
    fn malformed_quantity_is_flagged_not_replayed() {
        let cfg = FlowConfig::strict_defaults();
        let mut rec = record(1, Side::Buy, RoleHint::Entry, 1, 100, 0);
        rec.quantity = Some(0);
        let issues = validate(&cfg, &[rec], &[]);

        // The zero-qty record is excluded from replay, so no phantom open
        // position is derived, just the malformed-record issue.
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::IncompleteData);
    }

    #[test]
    fn voided_records_are_ignored() {
        let cfg = FlowConfig::strict_defaults();
        let mut rec = record(1, Side::Buy, RoleHint::Entry, 5, 100, 0);
        rec.voided = true;
        assert!(validate(&cfg, &[rec], &[]).is_empty());
    }

    #[test]
    fn exit_before_entry_is_one_medium_anomaly() {
        let cfg = FlowConfig::strict_defaults();
        // Exit hint at t0, entry hint at t10, same position row.
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 3, 100, 10),
            record(2, Side::Sell, RoleHint::Exit, 3, 110, 0),
        ];
        let stored = derive(&cfg, &records);
        let issues = validate(&cfg, &records, &stored);

        let anomalies: Vec<_> = issues
            .iter()
            .filter(|i| i.kind == IssueKind::TimestampAnomaly)
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::Medium);
    }

    #[test]
    fn identical_timestamps_inconsistent_role_order() {
        let cfg = FlowConfig::strict_defaults();
        // Same timestamp; the exit's id sorts before the entry's, so the
        // canonical order contradicts the roles. Exactly one anomaly.
        let records = vec![
            record(2, Side::Buy, RoleHint::Entry, 3, 100, 5),
            record(1, Side::Sell, RoleHint::Exit, 3, 110, 5),
        ];
        let stored = derive(&cfg, &records);
        let issues = validate(&cfg, &records, &stored);

        let anomalies: Vec<_> = issues
            .iter()
            .filter(|i| i.kind == IssueKind::TimestampAnomaly)
            .collect();
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn replay_sign_flip_filed_as_high_mismatch() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 5, 100, 0),
            record(2, Side::Sell, RoleHint::Exit, 8, 110, 10),
        ];
        let stored = derive(&cfg, &records);
        let issues = validate(&cfg, &records, &stored);

        assert!(issues.iter().any(|i| {
            i.kind == IssueKind::QuantityMismatch
                && i.severity == Severity::High
                && i.detail.contains("crosses zero")
        }));
    }

    #[test]
    fn constituent_shortfall_detected() {
        let cfg = FlowConfig::strict_defaults();
        let records = vec![
            record(1, Side::Buy, RoleHint::Entry, 3, 100, 0),
            record(2, Side::Sell, RoleHint::Exit, 3, 110, 10),
        ];
        let mut stored = derive(&cfg, &records);
        stored[0].execution_ids = vec![stored[0].execution_ids[0]]; // drop one

        let issues = validate(&cfg, &records, &stored);
        assert!(issues.iter().any(|i| {
            i.kind == IssueKind::IncompleteData && i.detail.contains("imply at least 2")
        }));
    }

    #[test]
    fn cancellation_propagates() {
        let cfg = FlowConfig::strict_defaults();
        let token = CancelToken::new();
        token.cancel();
        let records = vec![record(1, Side::Buy, RoleHint::Entry, 1, 100, 0)];
        let err = validate_scope(
            &cfg,
            "acct",
            "ES",
            &records,
            &[],
            M,
            ts(1_000),
            &token,
        )
        .unwrap_err();
        assert_eq!(err, FlowError::Cancelled);
    }
}

use jnl_positions::CancelToken;
use jnl_runtime::PositionService;
use jnl_schemas::{IssueKind, PositionSide, RoleHint, Side, MICROS_SCALE};
use jnl_testkit::{exec, strict_config, ts, MemStores};

const M: i64 = MICROS_SCALE;

#[tokio::test]
async fn scenario_timestamp_repair_uses_source_seq() {
    // The feed's sequence ids say the buy came first, but the stored
    // timestamps have the sell first. The repair redistributes the existing
    // timestamps in sequence order and the scope rebuilds into a clean long.
    let mut exit = exec(1, "acct", "ES", Side::Sell, 3, 110, 0);
    exit.role_hint = RoleHint::Exit;
    exit.source_seq = Some(2);
    let mut entry = exec(2, "acct", "ES", Side::Buy, 3, 100, 10);
    entry.role_hint = RoleHint::Entry;
    entry.source_seq = Some(1);

    let stores = MemStores::new();
    stores.seed_executions([exit, entry]);
    let service = PositionService::new(stores.clone(), strict_config());
    let cancel = CancelToken::new();

    service.rebuild_scope("acct", "ES", &cancel).await.unwrap();
    let issues = service.validate_scope("acct", "ES", &cancel).await.unwrap();
    let anomaly = issues
        .iter()
        .find(|i| i.kind == IssueKind::TimestampAnomaly)
        .expect("anomaly detected")
        .clone();

    let plan = service.propose_repair(&anomaly).await.unwrap();
    assert!(!plan.is_unrepairable());

    let report = service
        .apply_repair(&anomaly, &plan, false, &cancel)
        .await
        .unwrap();
    assert!(report.result.successful, "{}", report.result.details);

    // After the swap: buy @ t0, sell @ t10 → one closed long.
    let positions = stores.positions_for("acct", "ES");
    assert_eq!(positions.len(), 1);
    let p = &positions[0];
    assert_eq!(p.side, PositionSide::Long);
    assert_eq!(p.opened_at, ts(0));
    assert_eq!(p.closed_at, Some(ts(10)));
    assert_eq!(p.realized_pnl_micros, Some(1500 * M)); // 10 × 3 × 50

    // Originals voided, superseded records carry the corrected timestamps.
    let executions = stores.executions();
    assert_eq!(executions.iter().filter(|r| r.voided).count(), 2);
    assert_eq!(
        executions.iter().filter(|r| r.supersedes.is_some()).count(),
        2
    );
}

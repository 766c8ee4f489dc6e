use jnl_positions::CancelToken;
use jnl_runtime::PositionService;
use jnl_schemas::{IssueKind, Severity, Side, MICROS_SCALE};
use jnl_testkit::{exec, strict_config, MemStores};
use uuid::Uuid;

const M: i64 = MICROS_SCALE;

#[tokio::test]
async fn scenario_data_completion_fills_final_quantity() {
    // Long 5, sold 2, and the final sell lost its quantity in the import.
    // Conservation pins it to exactly 3; the repair fills it and the scope
    // closes cleanly. The price is taken from the record, never inferred.
    let mut gap = exec(3, "acct", "ES", Side::Sell, 1, 115, 20);
    gap.quantity = None;

    let stores = MemStores::new();
    stores.seed_executions([
        exec(1, "acct", "ES", Side::Buy, 5, 100, 0),
        exec(2, "acct", "ES", Side::Sell, 2, 110, 10),
        gap,
    ]);
    let service = PositionService::new(stores.clone(), strict_config());
    let cancel = CancelToken::new();

    service.rebuild_scope("acct", "ES", &cancel).await.unwrap();
    let issues = service.validate_scope("acct", "ES", &cancel).await.unwrap();
    let issue = issues
        .iter()
        .find(|i| i.kind == IssueKind::IncompleteData)
        .expect("gap flagged")
        .clone();
    assert_eq!(issue.severity, Severity::Low, "lone quantity gap is inferable");

    let plan = service.propose_repair(&issue).await.unwrap();
    let report = service
        .apply_repair(&issue, &plan, false, &cancel)
        .await
        .unwrap();
    assert!(report.result.successful, "{}", report.result.details);

    let positions = stores.positions_for("acct", "ES");
    assert_eq!(positions.len(), 1);
    let p = &positions[0];
    assert!(p.is_closed());
    assert_eq!(p.total_exit_qty, 5);
    // avg_exit = (2×110 + 3×115) / 5 = 113; pnl = 13 × 5 × 50 = 3250
    assert_eq!(p.avg_exit_price_micros, Some(113 * M));
    assert_eq!(p.realized_pnl_micros, Some(3250 * M));

    // Lineage: the gap record is voided, its successor carries quantity 3.
    let executions = stores.executions();
    let original = executions
        .iter()
        .find(|r| r.id == Uuid::from_u128(3))
        .unwrap();
    assert!(original.voided);
    let successor = executions
        .iter()
        .find(|r| r.supersedes == Some(Uuid::from_u128(3)))
        .unwrap();
    assert_eq!(successor.quantity, Some(3));
    assert_eq!(successor.price_micros, Some(115 * M));
}

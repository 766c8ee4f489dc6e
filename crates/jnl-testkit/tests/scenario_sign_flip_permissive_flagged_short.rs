use jnl_positions::CancelToken;
use jnl_runtime::PositionService;
use jnl_schemas::{IssueKind, PositionSide, Side};
use jnl_testkit::{exec, permissive_config, MemStores};

#[tokio::test]
async fn scenario_sign_flip_permissive_flagged_short() {
    // Same stream as the strict scenario, but under the permissive policy
    // the remainder opens a short (flagged), and the issue is still raised.
    let stores = MemStores::new();
    stores.seed_executions([
        exec(1, "acct", "ES", Side::Buy, 5, 100, 0),
        exec(2, "acct", "ES", Side::Sell, 8, 110, 10),
    ]);
    let service = PositionService::new(stores.clone(), permissive_config());

    let summary = service
        .rebuild_scope("acct", "ES", &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(summary.issues_raised, 1, "permissive still flags");
    assert!(summary.open_tail);

    let positions = stores.positions_for("acct", "ES");
    assert_eq!(positions.len(), 2);

    let closed = &positions[0];
    assert_eq!(closed.side, PositionSide::Long);
    assert!(closed.is_closed());
    assert!(!closed.flagged);

    let open = &positions[1];
    assert_eq!(open.side, PositionSide::Short);
    assert!(!open.is_closed());
    assert!(open.flagged, "auto-opened remainder carries the flag");
    assert_eq!(open.open_qty_signed(), -3);
    assert!(open.avg_exit_price_micros.is_none());
    assert!(open.realized_pnl_micros.is_none());

    assert_eq!(stores.issues().len(), 1);
    assert_eq!(stores.issues()[0].kind, IssueKind::QuantityMismatch);
}

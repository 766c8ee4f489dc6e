use jnl_positions::CancelToken;
use jnl_runtime::PositionService;
use jnl_schemas::Side;
use jnl_testkit::{exec, strict_config, MemStores};

#[tokio::test]
async fn scenario_cancelled_rebuild_keeps_prior_positions() {
    // A rebuild computes into a local result set and commits at the end, so
    // cancelling mid-walk must leave the previously committed rows intact.
    let stores = MemStores::new();
    stores.seed_executions([
        exec(1, "acct", "ES", Side::Buy, 3, 100, 0),
        exec(2, "acct", "ES", Side::Sell, 3, 110, 10),
    ]);
    let service = PositionService::new(stores.clone(), strict_config());

    service
        .rebuild_scope("acct", "ES", &CancelToken::new())
        .await
        .unwrap();
    let committed = stores.positions_for("acct", "ES");
    assert_eq!(committed.len(), 1);

    // New executions arrive, but this rebuild gets cancelled.
    stores.seed_executions([exec(3, "acct", "ES", Side::Buy, 2, 105, 20)]);
    let cancelled = CancelToken::new();
    cancelled.cancel();

    let err = service
        .rebuild_scope("acct", "ES", &cancelled)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));

    // Prior store state untouched: still the originally committed row, no
    // open position from the uncommitted walk.
    assert_eq!(stores.positions_for("acct", "ES"), committed);
}

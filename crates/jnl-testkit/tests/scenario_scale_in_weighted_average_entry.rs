use jnl_positions::CancelToken;
use jnl_runtime::PositionService;
use jnl_schemas::{Side, MICROS_SCALE};
use jnl_testkit::{exec, strict_config, MemStores};

const M: i64 = MICROS_SCALE;

#[tokio::test]
async fn scenario_scale_in_weighted_average_entry() {
    // Buy 2 @ 100, Buy 1 @ 102, Sell 3 @ 110 → avg_entry = 302/3 = 100.666667
    let stores = MemStores::new();
    stores.seed_executions([
        exec(1, "acct", "AAPL", Side::Buy, 2, 100, 0),
        exec(2, "acct", "AAPL", Side::Buy, 1, 102, 10),
        exec(3, "acct", "AAPL", Side::Sell, 3, 110, 20),
    ]);
    let service = PositionService::new(stores.clone(), strict_config());

    service
        .rebuild_scope("acct", "AAPL", &CancelToken::new())
        .await
        .unwrap();

    let positions = stores.positions_for("acct", "AAPL");
    assert_eq!(positions.len(), 1);
    let p = &positions[0];
    assert_eq!(p.avg_entry_price_micros, 100_666_667);
    assert_eq!(p.avg_exit_price_micros, Some(110 * M));
    // Unlisted instrument → multiplier 1.0:
    // (110 - 100.666667) × 3 = 27.999999
    assert_eq!(p.realized_pnl_micros, Some(27_999_999));
}

use jnl_positions::CancelToken;
use jnl_runtime::PositionService;
use jnl_schemas::{IssueKind, RoleHint, Severity, Side};
use jnl_testkit::{exec, strict_config, MemStores};

#[tokio::test]
async fn scenario_timestamp_anomaly_exactly_one_medium() {
    // Two executions share a timestamp, but the exit-labelled fill sorts
    // before the entry-labelled fill on the canonical id tie-break: the
    // validator must raise exactly one TimestampAnomaly at medium severity.
    let mut exit = exec(1, "acct", "ES", Side::Sell, 3, 110, 5);
    exit.role_hint = RoleHint::Exit;
    let mut entry = exec(2, "acct", "ES", Side::Buy, 3, 100, 5);
    entry.role_hint = RoleHint::Entry;

    let stores = MemStores::new();
    stores.seed_executions([exit, entry]);
    let service = PositionService::new(stores.clone(), strict_config());
    let cancel = CancelToken::new();

    service.rebuild_scope("acct", "ES", &cancel).await.unwrap();
    let issues = service.validate_scope("acct", "ES", &cancel).await.unwrap();

    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::TimestampAnomaly);
    assert_eq!(issues[0].severity, Severity::Medium);
    assert_eq!(issues[0].scope.execution_ids.len(), 2);
}

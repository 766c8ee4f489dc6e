use jnl_positions::CancelToken;
use jnl_repair::CorrectionPlan;
use jnl_runtime::PositionService;
use jnl_schemas::{IssueKind, Severity, Side};
use jnl_testkit::{exec, strict_config, MemStores};

#[tokio::test]
async fn scenario_multi_gap_completion_unrepairable() {
    // Two fills are missing their quantity at the same time: conservation
    // admits more than one consistent assignment, so the plan must be
    // Unrepairable: pending manual resolution, never guessed.
    let mut gap_a = exec(2, "acct", "ES", Side::Sell, 1, 110, 10);
    gap_a.quantity = None;
    let mut gap_b = exec(3, "acct", "ES", Side::Sell, 1, 110, 20);
    gap_b.quantity = None;

    let stores = MemStores::new();
    stores.seed_executions([exec(1, "acct", "ES", Side::Buy, 5, 100, 0), gap_a, gap_b]);
    let service = PositionService::new(stores.clone(), strict_config());
    let cancel = CancelToken::new();

    service.rebuild_scope("acct", "ES", &cancel).await.unwrap();
    let issues = service.validate_scope("acct", "ES", &cancel).await.unwrap();

    // Each lone-quantity gap files as inferable-class (low) incomplete data.
    let gaps: Vec<_> = issues
        .iter()
        .filter(|i| i.kind == IssueKind::IncompleteData)
        .collect();
    assert_eq!(gaps.len(), 2);
    assert!(gaps.iter().all(|i| i.severity == Severity::Low));

    let issue = gaps[0].clone();
    let plan = service.propose_repair(&issue).await.unwrap();
    match &plan {
        CorrectionPlan::Unrepairable { reason, .. } => {
            assert!(reason.contains("not be unique"));
        }
        other => panic!("expected Unrepairable, got {other:?}"),
    }

    let before = stores.dump();
    let report = service
        .apply_repair(&issue, &plan, false, &cancel)
        .await
        .unwrap();
    assert!(!report.result.successful);
    assert!(report.result.details.contains("unrepairable"));

    let after = stores.dump();
    assert_eq!(before.executions, after.executions);
    assert_eq!(before.positions, after.positions);

    let archived = stores
        .issues()
        .into_iter()
        .find(|i| i.id == issue.id)
        .unwrap();
    assert_eq!(archived.repair_successful, Some(false));
}

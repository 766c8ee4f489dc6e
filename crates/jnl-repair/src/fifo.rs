//! FIFO reconciliation walk.
//!
//! Re-walks a scope's executions in strict chronological order, deriving
//! each fill's role from the running-quantity sign rule. Produces:
//! - relabel actions where the stored hint disagrees with the derived role
//! - split actions for zero-crossing executions whose remainder is
//!   confirmed closed by later counter-fills
//! - unresolved remainders for orphan volume with no counter-fill

use uuid::Uuid;

use jnl_schemas::{Execution, RoleHint};

use crate::plan::{CorrectionAction, UnresolvedRemainder};

#[derive(Clone, Debug)]
struct PendingFlip {
    execution_id: Uuid,
    close_qty: i64,
    open_qty: i64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FifoFindings {
    pub actions: Vec<CorrectionAction>,
    pub unresolved: Vec<UnresolvedRemainder>,
}

fn relabel_if_needed(ex: &Execution, derived: RoleHint, actions: &mut Vec<CorrectionAction>) {
    if ex.role_hint != derived {
        actions.push(CorrectionAction::RelabelHint {
            execution_id: ex.id,
            from: ex.role_hint,
            to: derived,
        });
    }
}

/// Walk `executions` (already canonically sorted) and reconcile.
///
/// A flip's remainder is only considered confirmed once a later counter-fill
/// closes it: either an exact zero-touch or the covering part of the next
/// flip. A remainder still open at end of scope is orphan volume and stays
/// unresolved; splitting it would fabricate certainty the stream does not
/// contain.
pub(crate) fn reconcile_fifo(executions: &[Execution]) -> FifoFindings {
    let mut findings = FifoFindings::default();
    let mut running: i64 = 0;
    let mut pending: Option<PendingFlip> = None;

    for ex in executions {
        let delta = ex.signed_delta();

        if running == 0 {
            relabel_if_needed(ex, RoleHint::Entry, &mut findings.actions);
            running = delta;
            continue;
        }

        if running.signum() == delta.signum() {
            relabel_if_needed(ex, RoleHint::Entry, &mut findings.actions);
            running += delta;
            continue;
        }

        let open_abs = running.abs();
        if ex.quantity < open_abs {
            relabel_if_needed(ex, RoleHint::Exit, &mut findings.actions);
            running += delta;
            continue;
        }

        if ex.quantity == open_abs {
            relabel_if_needed(ex, RoleHint::Exit, &mut findings.actions);
            running = 0;
            // The chain this closes may have been a flip remainder.
            if let Some(flip) = pending.take() {
                findings.actions.push(CorrectionAction::SplitExecution {
                    execution_id: flip.execution_id,
                    close_qty: flip.close_qty,
                    open_qty: flip.open_qty,
                });
            }
            continue;
        }

        // Zero-crossing. The covering part closes the current chain; if
        // that chain came from an earlier flip, the earlier flip is now
        // confirmed by this counter-fill.
        if let Some(flip) = pending.take() {
            findings.actions.push(CorrectionAction::SplitExecution {
                execution_id: flip.execution_id,
                close_qty: flip.close_qty,
                open_qty: flip.open_qty,
            });
        }
        pending = Some(PendingFlip {
            execution_id: ex.id,
            close_qty: open_abs,
            open_qty: ex.quantity - open_abs,
        });
        running = delta.signum() * (ex.quantity - open_abs);
    }

    if let Some(flip) = pending.take() {
        findings.unresolved.push(UnresolvedRemainder {
            execution_id: flip.execution_id,
            quantity: flip.open_qty,
        });
    }

    findings
}

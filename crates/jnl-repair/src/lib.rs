//! jnl-repair
//!
//! Repair Service: turns an `IntegrityIssue` into a `CorrectionPlan` and
//! applies it with append/supersede semantics.
//!
//! Ground rules, enforced throughout:
//! - corrections never edit an execution in place: a corrected execution is
//!   a new record superseding the original, preserving audit lineage
//! - nothing is fabricated: no invented fills, no inferred prices; orphan
//!   volume surfaces as a still-open issue
//! - the repair core is pure: applying a plan to a record set returns a new
//!   record set plus the rebuilt positions; persistence (and therefore
//!   dry-run) is the caller's concern
//! - a repair whose rebuild would violate the position lifecycle fails
//!   closed: the original records are returned untouched
//!
//! Strategy selection is by issue kind: FIFO reconciliation for quantity
//! mismatches, timestamp correction for ordering anomalies, data completion
//! for incomplete records.

mod completion;
mod engine;
mod fifo;
mod plan;
mod timestamp;

pub use engine::{apply_plan, propose, ApplyOutcome};
pub use plan::{
    CorrectionAction, CorrectionPlan, RepairMethod, RepairResult, UnresolvedRemainder,
};

//! Fixed severity precedence table.
//!
//! Severity is decided once, here, per check (never ad hoc at the call
//! site) so the same condition always files at the same level.

use jnl_schemas::{IssueKind, Severity};

/// Every distinct condition the validator can detect.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IntegrityCheck {
    /// Recomputed running quantity is non-zero at end of scope and no stored
    /// open position accounts for it.
    UnresolvedRunningQty,
    /// A stored position marked closed whose entry and exit quantities do
    /// not balance.
    ClosedPositionImbalance,
    /// A sign-flip (partial quantity mismatch) mid-sequence during replay.
    MidSequenceMismatch,
    /// Stored and recomputed position sets disagree (missing, extra, or
    /// field-divergent rows).
    PositionSetDivergence,
    /// Execution ordering inconsistent with entry/exit roles.
    TimestampAnomaly,
    /// A record missing exactly its quantity; inferable from conservation.
    IncompleteInferable,
    /// A record missing side or price, or carrying malformed values; not
    /// inferable.
    IncompleteMalformed,
    /// A position with fewer constituent executions than its quantity
    /// arithmetic implies.
    ConstituentShortfall,
}

/// The precedence table.
pub fn severity_for(check: IntegrityCheck) -> Severity {
    match check {
        IntegrityCheck::UnresolvedRunningQty => Severity::Critical,
        IntegrityCheck::ClosedPositionImbalance => Severity::High,
        IntegrityCheck::MidSequenceMismatch => Severity::High,
        IntegrityCheck::PositionSetDivergence => Severity::High,
        IntegrityCheck::TimestampAnomaly => Severity::Medium,
        IntegrityCheck::IncompleteInferable => Severity::Low,
        IntegrityCheck::IncompleteMalformed => Severity::Medium,
        IntegrityCheck::ConstituentShortfall => Severity::Medium,
    }
}

/// Which issue kind each check files under.
pub fn kind_for(check: IntegrityCheck) -> IssueKind {
    match check {
        IntegrityCheck::UnresolvedRunningQty
        | IntegrityCheck::ClosedPositionImbalance
        | IntegrityCheck::MidSequenceMismatch
        | IntegrityCheck::PositionSetDivergence => IssueKind::QuantityMismatch,
        IntegrityCheck::TimestampAnomaly => IssueKind::TimestampAnomaly,
        IntegrityCheck::IncompleteInferable
        | IntegrityCheck::IncompleteMalformed
        | IntegrityCheck::ConstituentShortfall => IssueKind::IncompleteData,
    }
}

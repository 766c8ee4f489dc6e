//! Correction plan and result types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jnl_schemas::RoleHint;

/// Repair strategy, fixed per issue kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RepairMethod {
    FifoReconciliation,
    TimestampCorrection,
    DataCompletion,
}

impl RepairMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairMethod::FifoReconciliation => "fifo_reconciliation",
            RepairMethod::TimestampCorrection => "timestamp_correction",
            RepairMethod::DataCompletion => "data_completion",
        }
    }
}

/// One record-level correction. Every action supersedes the target record
/// with one (or two, for splits) new records; the original is voided, never
/// edited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrectionAction {
    /// Replace an untrusted or `Unknown` entry/exit hint with the role the
    /// running-quantity sign rule derives.
    RelabelHint {
        execution_id: Uuid,
        from: RoleHint,
        to: RoleHint,
    },
    /// Split a zero-crossing execution into its covering (exit) part and
    /// its remainder (entry) part, each confirmed by later counter-fills.
    SplitExecution {
        execution_id: Uuid,
        close_qty: i64,
        open_qty: i64,
    },
    /// Move an execution to the timestamp its auxiliary source sequence
    /// implies. Only existing timestamps are reassigned; none are invented.
    ReassignTimestamp {
        execution_id: Uuid,
        new_ts: DateTime<Utc>,
    },
    /// Fill a missing quantity uniquely determined by conservation.
    FillQuantity { execution_id: Uuid, quantity: i64 },
}

impl CorrectionAction {
    pub fn execution_id(&self) -> Uuid {
        match self {
            CorrectionAction::RelabelHint { execution_id, .. }
            | CorrectionAction::SplitExecution { execution_id, .. }
            | CorrectionAction::ReassignTimestamp { execution_id, .. }
            | CorrectionAction::FillQuantity { execution_id, .. } => *execution_id,
        }
    }
}

/// Orphan volume a FIFO re-walk could not match to any counter-fill.
/// Recorded on the plan instead of fabricating a fill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedRemainder {
    pub execution_id: Uuid,
    pub quantity: i64,
}

/// The proposed correction for one issue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrectionPlan {
    /// Concrete corrections. `actions` may be empty; that is the
    /// rebuild-from-stream plan for stored rows that diverged without any
    /// record-level fault.
    Apply {
        issue_id: Uuid,
        method: RepairMethod,
        actions: Vec<CorrectionAction>,
        unresolved: Vec<UnresolvedRemainder>,
    },
    /// No safe correction exists; the issue stays flagged for manual
    /// resolution and is never auto-retried.
    Unrepairable {
        issue_id: Uuid,
        method: RepairMethod,
        reason: String,
    },
}

impl CorrectionPlan {
    pub fn issue_id(&self) -> Uuid {
        match self {
            CorrectionPlan::Apply { issue_id, .. }
            | CorrectionPlan::Unrepairable { issue_id, .. } => *issue_id,
        }
    }

    pub fn method(&self) -> RepairMethod {
        match self {
            CorrectionPlan::Apply { method, .. }
            | CorrectionPlan::Unrepairable { method, .. } => *method,
        }
    }

    pub fn is_unrepairable(&self) -> bool {
        matches!(self, CorrectionPlan::Unrepairable { .. })
    }
}

/// Outcome recorded on the issue after an apply attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairResult {
    pub successful: bool,
    pub method: RepairMethod,
    pub details: String,
}

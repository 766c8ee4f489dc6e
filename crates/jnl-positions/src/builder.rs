//! Quantity-flow walk: executions in canonical order → positions.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jnl_schemas::{
    Execution, IntegrityIssue, IssueKind, IssueScope, Position, PositionSide, Severity,
};

use crate::cancel::CancelToken;
use crate::ordering::check_monotonic;
use crate::pricing::{realized_pnl_micros, weighted_avg_price_micros, FillSlice};

/// Namespace for deriving position ids from their opening execution id.
/// Stable across rebuilds: the same opening execution always yields the same
/// position id, so rebuilt scopes diff cleanly against stored rows.
const POSITION_ID_NS: Uuid = Uuid::from_u128(0x6a6e_6c2d_706f_7369_7469_6f6e_2d69_6431);

fn position_id_for(opening_execution_id: Uuid) -> Uuid {
    Uuid::new_v5(&POSITION_ID_NS, opening_execution_id.as_bytes())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// What to do when a single execution would move the running quantity across
/// zero (a sign-flip).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignFlipPolicy {
    /// Close the current position with the covering quantity, raise a
    /// QuantityMismatch issue for the remainder, and open nothing. The
    /// remainder stays out of position derivation until repaired.
    Strict,
    /// Close, then open a new position from the remainder and flag it. The
    /// issue is still raised.
    Permissive,
}

/// Policy config for the flow walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    pub sign_flip: SignFlipPolicy,
    /// Max backwards timestamp jitter tolerated before the batch is rejected
    /// as out of order (0 = strictly monotonic).
    pub timestamp_tolerance_ms: i64,
}

impl FlowConfig {
    pub fn strict_defaults() -> Self {
        Self {
            sign_flip: SignFlipPolicy::Strict,
            timestamp_tolerance_ms: 0,
        }
    }

    pub fn permissive() -> Self {
        Self {
            sign_flip: SignFlipPolicy::Permissive,
            timestamp_tolerance_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Batch-fatal failures of the flow walk.
///
/// None of these mutate anything: an `Err` means no positions and no issues
/// were produced for the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowError {
    /// `Execution.quantity` must be strictly positive.
    NonPositiveQty { execution_id: Uuid, qty: i64 },
    /// `Execution.price_micros` must be strictly positive.
    NonPositivePrice { execution_id: Uuid, price_micros: i64 },
    /// `Execution.commission_micros` must be non-negative.
    NegativeCommission {
        execution_id: Uuid,
        commission_micros: i64,
    },
    /// The execution belongs to a different (account, instrument) scope.
    /// Never silently reorder or merge across scope boundaries.
    ScopeMismatch {
        execution_id: Uuid,
        account: String,
        instrument: String,
    },
    /// A timestamp regressed beyond the configured tolerance. Recoverable:
    /// re-sort canonically and retry the batch.
    OutOfOrderInput {
        execution_id: Uuid,
        ts_ms: i64,
        high_water_ms: i64,
        tolerance_ms: i64,
    },
    /// The walk was cancelled between executions; no output was produced.
    Cancelled,
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveQty { execution_id, qty } => {
                write!(f, "execution {execution_id}: quantity must be > 0, got {qty}")
            }
            Self::NonPositivePrice {
                execution_id,
                price_micros,
            } => write!(
                f,
                "execution {execution_id}: price_micros must be > 0, got {price_micros}"
            ),
            Self::NegativeCommission {
                execution_id,
                commission_micros,
            } => write!(
                f,
                "execution {execution_id}: commission_micros must be >= 0, got {commission_micros}"
            ),
            Self::ScopeMismatch {
                execution_id,
                account,
                instrument,
            } => write!(
                f,
                "execution {execution_id} belongs to scope ({account}, {instrument}), not this batch"
            ),
            Self::OutOfOrderInput {
                execution_id,
                ts_ms,
                high_water_ms,
                tolerance_ms,
            } => write!(
                f,
                "execution {execution_id} at {ts_ms}ms regresses past high water {high_water_ms}ms \
                 (tolerance {tolerance_ms}ms); re-sort and retry"
            ),
            Self::Cancelled => write!(f, "flow walk cancelled"),
        }
    }
}

impl std::error::Error for FlowError {}

// ---------------------------------------------------------------------------
// Open-position accumulator (tail state)
// ---------------------------------------------------------------------------

/// The position currently being built. Returned as the batch tail when the
/// scope ends with non-zero running quantity, so incremental builds can
/// resume from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenPosition {
    pub id: Uuid,
    pub account: String,
    pub instrument: String,
    pub side: PositionSide,
    pub opened_at: DateTime<Utc>,
    pub entry_fills: Vec<FillSlice>,
    pub exit_fills: Vec<FillSlice>,
    pub commission_micros: i64,
    pub execution_ids: Vec<Uuid>,
    pub flagged: bool,
}

impl OpenPosition {
    fn open(ex: &Execution, side: PositionSide) -> Self {
        Self {
            id: position_id_for(ex.id),
            account: ex.account.clone(),
            instrument: ex.instrument.clone(),
            side,
            opened_at: ex.ts_utc,
            entry_fills: vec![FillSlice::new(ex.id, ex.quantity, ex.price_micros)],
            exit_fills: Vec::new(),
            commission_micros: ex.commission_micros,
            execution_ids: vec![ex.id],
            flagged: false,
        }
    }

    /// Open from the remainder of a sign-flipping execution (permissive
    /// policy). Commission stays with the position the execution closed.
    fn open_remainder(ex: &Execution, side: PositionSide, remainder_qty: i64) -> Self {
        Self {
            id: position_id_for(ex.id),
            account: ex.account.clone(),
            instrument: ex.instrument.clone(),
            side,
            opened_at: ex.ts_utc,
            entry_fills: vec![FillSlice::new(ex.id, remainder_qty, ex.price_micros)],
            exit_fills: Vec::new(),
            commission_micros: 0,
            execution_ids: vec![ex.id],
            flagged: true,
        }
    }

    fn add_entry(&mut self, ex: &Execution) {
        self.entry_fills
            .push(FillSlice::new(ex.id, ex.quantity, ex.price_micros));
        self.commission_micros += ex.commission_micros;
        self.execution_ids.push(ex.id);
    }

    fn add_exit_slice(&mut self, ex: &Execution, cover_qty: i64) {
        self.exit_fills
            .push(FillSlice::new(ex.id, cover_qty, ex.price_micros));
        self.commission_micros += ex.commission_micros;
        self.execution_ids.push(ex.id);
    }

    pub fn entry_qty(&self) -> i64 {
        self.entry_fills.iter().map(|s| s.quantity).sum()
    }

    pub fn exit_qty(&self) -> i64 {
        self.exit_fills.iter().map(|s| s.quantity).sum()
    }

    /// Unsigned quantity still open on this accumulator.
    pub fn open_qty_abs(&self) -> i64 {
        self.entry_qty() - self.exit_qty()
    }

    /// Read-only snapshot as a still-open Position record.
    /// Exit average and realized PnL stay unset until close.
    pub fn snapshot(&self) -> Position {
        Position {
            id: self.id,
            account: self.account.clone(),
            instrument: self.instrument.clone(),
            side: self.side,
            opened_at: self.opened_at,
            closed_at: None,
            total_entry_qty: self.entry_qty(),
            total_exit_qty: self.exit_qty(),
            avg_entry_price_micros: weighted_avg_price_micros(&self.entry_fills),
            avg_exit_price_micros: None,
            realized_pnl_micros: None,
            total_commission_micros: self.commission_micros,
            execution_ids: self.execution_ids.clone(),
            flagged: self.flagged,
        }
    }

    /// Finalize at close: averages, realized PnL, closing time.
    fn close(self, closed_at: DateTime<Utc>, multiplier_micros: i64) -> Position {
        let total_entry_qty = self.entry_qty();
        let total_exit_qty = self.exit_qty();
        debug_assert_eq!(total_entry_qty, total_exit_qty, "close requires conservation");

        let avg_entry = weighted_avg_price_micros(&self.entry_fills);
        let avg_exit = weighted_avg_price_micros(&self.exit_fills);
        let pnl = realized_pnl_micros(
            self.side,
            avg_entry,
            avg_exit,
            total_entry_qty,
            multiplier_micros,
        );

        Position {
            id: self.id,
            account: self.account,
            instrument: self.instrument,
            side: self.side,
            opened_at: self.opened_at,
            closed_at: Some(closed_at),
            total_entry_qty,
            total_exit_qty,
            avg_entry_price_micros: avg_entry,
            avg_exit_price_micros: Some(avg_exit),
            realized_pnl_micros: Some(pnl),
            total_commission_micros: self.commission_micros,
            execution_ids: self.execution_ids,
            flagged: self.flagged,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Everything one flow walk produces. Computed locally; the caller decides
/// when (and whether) to commit it to a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowOutcome {
    /// Closed positions, in closing order.
    pub positions: Vec<Position>,
    /// Still-open accumulator, if the scope ended with non-zero quantity.
    pub tail: Option<OpenPosition>,
    /// Issues raised during the walk (sign-flips), in detection order.
    pub issues: Vec<IntegrityIssue>,
}

impl FlowOutcome {
    /// Closed positions plus the open tail snapshot: the full record set a
    /// store should hold for this scope.
    pub fn position_records(&self) -> Vec<Position> {
        let mut out = self.positions.clone();
        if let Some(tail) = &self.tail {
            out.push(tail.snapshot());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

/// Reject malformed executions before they enter the flow.
pub fn validate_execution(ex: &Execution) -> Result<(), FlowError> {
    if ex.quantity <= 0 {
        return Err(FlowError::NonPositiveQty {
            execution_id: ex.id,
            qty: ex.quantity,
        });
    }
    if ex.price_micros <= 0 {
        return Err(FlowError::NonPositivePrice {
            execution_id: ex.id,
            price_micros: ex.price_micros,
        });
    }
    if ex.commission_micros < 0 {
        return Err(FlowError::NegativeCommission {
            execution_id: ex.id,
            commission_micros: ex.commission_micros,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The walk
// ---------------------------------------------------------------------------

fn sign_flip_issue(
    ex: &Execution,
    closed_position_id: Uuid,
    open_abs: i64,
    remainder: i64,
    policy: SignFlipPolicy,
) -> IntegrityIssue {
    let disposition = match policy {
        SignFlipPolicy::Strict => "remainder withheld from position derivation pending repair",
        SignFlipPolicy::Permissive => "remainder opened as a flagged position",
    };
    IntegrityIssue::new(
        IssueKind::QuantityMismatch,
        Severity::High,
        IssueScope::new(ex.account.clone(), ex.instrument.clone())
            .with_executions(vec![ex.id])
            .with_positions(vec![closed_position_id]),
        format!(
            "execution {} crosses zero: covers the open {}, remainder {}; {}",
            ex.id, open_abs, remainder, disposition
        ),
        ex.ts_utc,
    )
}

/// Walk one (account, instrument) scope's executions in canonical order and
/// derive its positions.
///
/// The input must already be canonically ordered; see
/// [`check_monotonic`](crate::check_monotonic) semantics. All executions
/// must belong to the given scope. Invalid input fails the whole batch; no
/// partial output escapes.
///
/// `multiplier_micros` is the instrument contract multiplier (micros scale,
/// `MICROS_SCALE` = 1.0) used only for realized PnL at close.
pub fn build_positions(
    cfg: &FlowConfig,
    account: &str,
    instrument: &str,
    executions: &[Execution],
    multiplier_micros: i64,
    cancel: &CancelToken,
) -> Result<FlowOutcome, FlowError> {
    // Reject malformed input before anything enters the flow.
    for ex in executions {
        if ex.account != account || ex.instrument != instrument {
            return Err(FlowError::ScopeMismatch {
                execution_id: ex.id,
                account: ex.account.clone(),
                instrument: ex.instrument.clone(),
            });
        }
        validate_execution(ex)?;
    }
    check_monotonic(executions, cfg.timestamp_tolerance_ms)?;

    let mut outcome = FlowOutcome {
        positions: Vec::new(),
        tail: None,
        issues: Vec::new(),
    };
    let mut open: Option<OpenPosition> = None;
    // Signed net contract count for the scope. Strictly local state: one
    // accumulator per walk, never shared.
    let mut running_qty: i64 = 0;

    for ex in executions {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let delta = ex.signed_delta();

        if running_qty == 0 {
            let side = if delta > 0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            open = Some(OpenPosition::open(ex, side));
            running_qty = delta;
            continue;
        }

        let pos = open
            .as_mut()
            .expect("non-zero running quantity implies an open accumulator");

        if running_qty.signum() == delta.signum() {
            // Scale-in.
            pos.add_entry(ex);
            running_qty += delta;
            continue;
        }

        // Opposite sign: reduces the position, up to the open quantity.
        let open_abs = running_qty.abs();
        let cover = open_abs.min(ex.quantity);
        pos.add_exit_slice(ex, cover);

        if ex.quantity < open_abs {
            // Partial close; position stays open.
            running_qty += delta;
            continue;
        }

        let closing = open.take().expect("accumulator present while reducing");
        let closed_id = closing.id;
        outcome
            .positions
            .push(closing.close(ex.ts_utc, multiplier_micros));
        running_qty = 0;

        if ex.quantity == open_abs {
            continue;
        }

        // Sign-flip: the remainder would cross zero in one step.
        let remainder = ex.quantity - open_abs;
        outcome.issues.push(sign_flip_issue(
            ex,
            closed_id,
            open_abs,
            remainder,
            cfg.sign_flip,
        ));
        if cfg.sign_flip == SignFlipPolicy::Permissive {
            let side = if delta > 0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            open = Some(OpenPosition::open_remainder(ex, side, remainder));
            running_qty = if delta > 0 { remainder } else { -remainder };
        }
    }

    outcome.tail = open;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

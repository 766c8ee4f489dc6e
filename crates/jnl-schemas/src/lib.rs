//! jnl-schemas
//!
//! Shared data model for the position engine:
//! - `Execution` / `ExecutionRecord`: the immutable trade-fill facts
//! - `Position`: the derived aggregate the builder emits
//! - `IntegrityIssue`: typed discrepancy records
//!
//! All money amounts (prices, commissions, PnL) are micros fixed-point
//! (`i64`, 1e-6 scale). Quantities are plain positive `i64` contract counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Price/cash scale: micros (1e-6).
pub const MICROS_SCALE: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// Closed tagged variants
// ---------------------------------------------------------------------------

/// BUY or SELL for executions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Entry/exit label supplied by the upstream feed.
///
/// Advisory only. The builder classifies fills from the running-quantity
/// sign rule; this hint is consulted solely by the repair service when
/// reconciling, and `Unknown` is always re-derived rather than trusted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleHint {
    Entry,
    Exit,
    Unknown,
}

/// The builder's derived classification of a fill within its position.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillRole {
    Entry,
    Exit,
}

/// Direction of a position, fixed at open by the sign of the opening fill.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// A validated, complete execution fact.
///
/// Executions are never mutated. A correction is a new record whose
/// `supersedes` references the original; the original is voided, not edited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub account: String,
    pub instrument: String,
    pub side: Side,
    pub role_hint: RoleHint,
    /// Contract count, always strictly positive.
    pub quantity: i64,
    pub price_micros: i64,
    pub ts_utc: DateTime<Utc>,
    pub commission_micros: i64,
    /// Upstream feed sequence id, when the feed provides one. Used only by
    /// timestamp repair to recover the true fill order.
    pub source_seq: Option<u64>,
    /// Lineage: set when this record corrects an earlier one.
    pub supersedes: Option<Uuid>,
}

impl Execution {
    /// Signed quantity delta: `+quantity` for Buy, `-quantity` for Sell.
    pub fn signed_delta(&self) -> i64 {
        match self.side {
            Side::Buy => self.quantity,
            Side::Sell => -self.quantity,
        }
    }
}

/// The stored shape of an execution, which may be incomplete.
///
/// Upstream imports occasionally deliver rows missing a side, quantity, or
/// price. Those rows are stored and flagged (`IncompleteData`) rather than
/// dropped, so the store keeps every fact it was given.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub account: String,
    pub instrument: String,
    pub side: Option<Side>,
    pub role_hint: RoleHint,
    pub quantity: Option<i64>,
    pub price_micros: Option<i64>,
    pub ts_utc: DateTime<Utc>,
    pub commission_micros: i64,
    pub source_seq: Option<u64>,
    pub supersedes: Option<Uuid>,
    /// Set when a later record supersedes this one; voided records are
    /// excluded from position derivation but kept for lineage.
    pub voided: bool,
}

/// Fields an [`ExecutionRecord`] can be missing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MissingField {
    Side,
    Quantity,
    Price,
}

impl MissingField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingField::Side => "side",
            MissingField::Quantity => "quantity",
            MissingField::Price => "price",
        }
    }
}

/// Error returned when an [`ExecutionRecord`] cannot be promoted to a
/// complete [`Execution`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncompleteRecord {
    pub execution_id: Uuid,
    /// Sorted, non-empty.
    pub missing: Vec<MissingField>,
}

impl std::fmt::Display for IncompleteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<&str> = self.missing.iter().map(|m| m.as_str()).collect();
        write!(
            f,
            "execution {} is missing: {}",
            self.execution_id,
            fields.join(", ")
        )
    }
}

impl std::error::Error for IncompleteRecord {}

impl ExecutionRecord {
    /// Wrap a complete execution back into its stored shape.
    pub fn from_execution(ex: &Execution) -> Self {
        Self {
            id: ex.id,
            account: ex.account.clone(),
            instrument: ex.instrument.clone(),
            side: Some(ex.side),
            role_hint: ex.role_hint,
            quantity: Some(ex.quantity),
            price_micros: Some(ex.price_micros),
            ts_utc: ex.ts_utc,
            commission_micros: ex.commission_micros,
            source_seq: ex.source_seq,
            supersedes: ex.supersedes,
            voided: false,
        }
    }

    /// Which fields are absent on this record (sorted).
    pub fn missing_fields(&self) -> Vec<MissingField> {
        let mut missing = Vec::new();
        if self.side.is_none() {
            missing.push(MissingField::Side);
        }
        if self.quantity.is_none() {
            missing.push(MissingField::Quantity);
        }
        if self.price_micros.is_none() {
            missing.push(MissingField::Price);
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Promote to a complete [`Execution`], or report what is missing.
    ///
    /// Completeness only; range checks (qty > 0, price > 0) belong to the
    /// builder's input validation.
    pub fn validate(&self) -> Result<Execution, IncompleteRecord> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(IncompleteRecord {
                execution_id: self.id,
                missing,
            });
        }
        Ok(Execution {
            id: self.id,
            account: self.account.clone(),
            instrument: self.instrument.clone(),
            side: self.side.expect("checked above"),
            role_hint: self.role_hint,
            quantity: self.quantity.expect("checked above"),
            price_micros: self.price_micros.expect("checked above"),
            ts_utc: self.ts_utc,
            commission_micros: self.commission_micros,
            source_seq: self.source_seq,
            supersedes: self.supersedes,
        })
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A derived aggregate over a maximal run of executions during which the
/// signed running quantity stays non-zero.
///
/// Invariants:
/// - `side` is fixed for the life of the position.
/// - `closed_at.is_some()` implies `total_entry_qty == total_exit_qty`,
///   `avg_exit_price_micros.is_some()`, and `realized_pnl_micros.is_some()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub account: String,
    pub instrument: String,
    pub side: PositionSide,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub total_entry_qty: i64,
    pub total_exit_qty: i64,
    pub avg_entry_price_micros: i64,
    pub avg_exit_price_micros: Option<i64>,
    pub realized_pnl_micros: Option<i64>,
    pub total_commission_micros: i64,
    /// Constituent execution ids in application order.
    pub execution_ids: Vec<Uuid>,
    /// Set on positions auto-opened from a sign-flip remainder under the
    /// permissive policy; cleared only by a successful repair + rebuild.
    pub flagged: bool,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Conservation: entry and exit quantities balance once closed.
    pub fn conservation_holds(&self) -> bool {
        !self.is_closed() || self.total_entry_qty == self.total_exit_qty
    }

    /// Signed open quantity remaining on this position.
    pub fn open_qty_signed(&self) -> i64 {
        let open = self.total_entry_qty - self.total_exit_qty;
        match self.side {
            PositionSide::Long => open,
            PositionSide::Short => -open,
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity issues
// ---------------------------------------------------------------------------

/// Discrepancy classes the validator can report.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssueKind {
    QuantityMismatch,
    TimestampAnomaly,
    IncompleteData,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::QuantityMismatch => "quantity_mismatch",
            IssueKind::TimestampAnomaly => "timestamp_anomaly",
            IssueKind::IncompleteData => "incomplete_data",
        }
    }
}

/// Severity ladder, ordered so `Low < Medium < High < Critical`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// What an issue refers to. Position/execution id lists are kept sorted so
/// identical findings serialize identically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueScope {
    pub account: String,
    pub instrument: String,
    pub position_ids: Vec<Uuid>,
    pub execution_ids: Vec<Uuid>,
}

impl IssueScope {
    pub fn new(account: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            instrument: instrument.into(),
            position_ids: Vec::new(),
            execution_ids: Vec::new(),
        }
    }

    pub fn with_executions(mut self, mut ids: Vec<Uuid>) -> Self {
        ids.sort();
        self.execution_ids = ids;
        self
    }

    pub fn with_positions(mut self, mut ids: Vec<Uuid>) -> Self {
        ids.sort();
        self.position_ids = ids;
        self
    }
}

/// A recorded discrepancy.
///
/// Issues are immutable once archived: the repair outcome fields are written
/// exactly once, and re-detection of the same condition creates a *new*
/// issue rather than reviving an old one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub id: Uuid,
    pub kind: IssueKind,
    pub severity: Severity,
    pub scope: IssueScope,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
    pub repair_attempted: bool,
    pub repair_method: Option<String>,
    pub repair_successful: Option<bool>,
    pub repair_details: Option<String>,
}

impl IntegrityIssue {
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        scope: IssueScope,
        detail: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            scope,
            detail: detail.into(),
            detected_at,
            repair_attempted: false,
            repair_method: None,
            repair_successful: None,
            repair_details: None,
        }
    }

    /// Record a repair outcome. Consumes and returns the issue so callers
    /// archive the finished record instead of mutating a shared one.
    pub fn with_repair_outcome(
        mut self,
        method: impl Into<String>,
        successful: bool,
        details: impl Into<String>,
    ) -> Self {
        self.repair_attempted = true;
        self.repair_method = Some(method.into());
        self.repair_successful = Some(successful);
        self.repair_details = Some(details.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

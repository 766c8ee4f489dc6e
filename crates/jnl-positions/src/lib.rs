//! jnl-positions
//!
//! Quantity-Flow Position Builder:
//! - executions in, positions out; the builder is the only writer of
//!   Position records
//! - flat → open → flat lifecycle enforced by the running-quantity state
//!   machine; the running quantity must touch zero before the side can change
//! - sign-flips are never silently treated as close-then-reopen; policy
//!   decides between raising an issue (strict) and opening a flagged
//!   position (permissive)
//! - quantity-weighted average pricing and realized PnL at close
//!
//! Deterministic, pure logic. No IO. No clock reads.

mod builder;
mod cancel;
mod ordering;
mod pricing;

pub use builder::{
    build_positions, validate_execution, FlowConfig, FlowError, FlowOutcome, OpenPosition,
    SignFlipPolicy,
};
pub use cancel::CancelToken;
pub use ordering::{check_monotonic, sort_executions_canonical};
pub use pricing::{realized_pnl_micros, weighted_avg_price_micros, FillSlice};

pub use jnl_schemas::MICROS_SCALE;

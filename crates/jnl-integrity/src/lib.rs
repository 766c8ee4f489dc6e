//! jnl-integrity
//!
//! Integrity Validator: re-derives expected positions from stored execution
//! records in a read-only sandbox and diffs the result against stored
//! Position rows. Every discrepancy becomes a typed `IntegrityIssue` with a
//! severity from a fixed precedence table.
//!
//! The validator never mutates anything; it reads, replays, and reports. Safe
//! to run concurrently with reads and idempotent by construction.

mod engine;
mod severity;

pub use engine::validate_scope;
pub use severity::{kind_for, severity_for, IntegrityCheck};

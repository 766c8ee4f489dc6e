//! jnl-runtime
//!
//! Async wiring around the pure engines: store traits, per-scope mutual
//! exclusion, rebuild/validate/repair orchestration, audit and tracing.
//!
//! Concurrency contract:
//! - all accumulator state is local to one scope walk; nothing mutable is
//!   shared across scopes
//! - one in-flight rebuild/validate/repair per (account, instrument) at a
//!   time, enforced by [`ScopeLocks`]; independent scopes fan out in
//!   parallel
//! - the stores are the only suspension points; every rebuild computes into
//!   a local result set and commits atomically at the end

#![allow(async_fn_in_trait)]

mod locks;
mod pg;
mod service;
mod stores;

pub use locks::ScopeLocks;
pub use pg::PgStores;
pub use service::{PositionService, RebuildSummary, RepairReport, ScopeOutcome};
pub use stores::{ExecutionStore, IssueStore, PositionStore};

//! jnl-audit
//!
//! Append-only repair/rebuild audit log. Writes JSON Lines (one event per
//! line) with an optional hash chain: each event carries the hash of the
//! previous event plus its own, so any in-place edit of history is
//! detectable. Repairs are never applied silently: every propose, apply,
//! and rebuild commit lands here.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Event types the engine emits. Free-form strings are accepted by
/// [`AuditLog::append`]; these constants cover the engine's own vocabulary.
pub mod event_type {
    pub const ISSUE_RAISED: &str = "issue_raised";
    pub const REPAIR_PROPOSED: &str = "repair_proposed";
    pub const REPAIR_APPLIED: &str = "repair_applied";
    pub const REPAIR_FAILED: &str = "repair_failed";
    pub const REBUILD_COMMITTED: &str = "rebuild_committed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only audit writer.
pub struct AuditLog {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    /// Monotonic sequence counter for deterministic event-id derivation.
    seq: u64,
}

impl AuditLog {
    /// Create the audit log writer and ensure parent dirs exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
            seq: 0,
        })
    }

    /// Restore chain state when resuming an existing log: the last line's
    /// `hash_self` and the number of events already written.
    pub fn resume(&mut self, last_hash: Option<String>, events_written: u64) {
        self.last_hash = last_hash;
        self.seq = events_written;
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Append one event.
    pub fn append(&mut self, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let event_id = derive_event_id(self.last_hash.as_deref(), &payload, self.seq)?;
        self.seq += 1;

        let mut ev = AuditEvent {
            event_id,
            ts_utc: Utc::now(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            let self_hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&ev)?;
        append_line(&self.path, &line)?;
        Ok(ev)
    }

    // -- Typed appenders for the engine's own events --------------------

    pub fn issue_raised(
        &mut self,
        issue_id: Uuid,
        kind: &str,
        severity: &str,
        detail: &str,
    ) -> Result<AuditEvent> {
        self.append(
            event_type::ISSUE_RAISED,
            json!({
                "issue_id": issue_id,
                "kind": kind,
                "severity": severity,
                "detail": detail,
            }),
        )
    }

    pub fn repair_proposed(
        &mut self,
        issue_id: Uuid,
        method: &str,
        repairable: bool,
    ) -> Result<AuditEvent> {
        self.append(
            event_type::REPAIR_PROPOSED,
            json!({
                "issue_id": issue_id,
                "method": method,
                "repairable": repairable,
            }),
        )
    }

    pub fn repair_applied(
        &mut self,
        issue_id: Uuid,
        method: &str,
        successful: bool,
        details: &str,
    ) -> Result<AuditEvent> {
        let ty = if successful {
            event_type::REPAIR_APPLIED
        } else {
            event_type::REPAIR_FAILED
        };
        self.append(
            ty,
            json!({
                "issue_id": issue_id,
                "method": method,
                "successful": successful,
                "details": details,
            }),
        )
    }

    pub fn rebuild_committed(
        &mut self,
        account: &str,
        instrument: &str,
        positions: usize,
        issues: usize,
    ) -> Result<AuditEvent> {
        self.append(
            event_type::REBUILD_COMMITTED,
            json!({
                "account": account,
                "instrument": instrument,
                "positions": positions,
                "issues": issues,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Chain verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub events: usize,
    pub intact: bool,
    /// 1-based line number of the first broken link, if any.
    pub first_bad_line: Option<usize>,
}

/// Re-read a hash-chained log and verify every link.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<ChainReport> {
    let text = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;

    let mut prev_hash: Option<String> = None;
    let mut events = 0usize;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        events += 1;
        let ev: AuditEvent =
            serde_json::from_str(line).with_context(|| format!("parse line {}", idx + 1))?;

        let broken = ev.hash_prev != prev_hash
            || match &ev.hash_self {
                None => true,
                Some(recorded) => {
                    let mut unhashed = ev.clone();
                    unhashed.hash_self = None;
                    *recorded != compute_event_hash(&unhashed)?
                }
            };
        if broken {
            return Ok(ChainReport {
                events,
                intact: false,
                first_bad_line: Some(idx + 1),
            });
        }
        prev_hash = ev.hash_self.clone();
    }
    Ok(ChainReport {
        events,
        intact: true,
        first_bad_line: None,
    })
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {path:?}"))?;
    f.write_all(line.as_bytes()).context("write audit line")?;
    f.write_all(b"\n").context("write newline")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event")?;
    let canon = sort_keys(&raw);
    serde_json::to_string(&canon).context("render audit event")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, val) in entries {
                out.insert(k.clone(), sort_keys(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Hash of an event with `hash_self` cleared.
fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut unhashed = ev.clone();
    unhashed.hash_self = None;
    let line = canonical_json_line(&unhashed)?;
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Event id derived deterministically from chain state + payload + seq.
/// No RNG: replaying the same chain reproduces the same ids.
fn derive_event_id(last_hash: Option<&str>, payload: &Value, seq: u64) -> Result<Uuid> {
    let payload_text = canonical_json_line(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(last_hash.unwrap_or("genesis").as_bytes());
    hasher.update(payload_text.as_bytes());
    hasher.update(seq.to_be_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ok(Uuid::from_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

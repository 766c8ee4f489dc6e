//! Canonical execution ordering.
//!
//! The flow walk requires its input in canonical order: ascending
//! `(ts_utc, id)`. The builder never reorders on its own: it rejects with
//! [`FlowError::OutOfOrderInput`] and leaves re-sorting to the caller, so a
//! mis-sorted batch is always an explicit, visible event rather than a
//! silent fix-up.

use jnl_schemas::Execution;

use crate::builder::FlowError;

/// Sort executions into canonical order **in place**.
///
/// Sort key (ascending): `(ts_utc, id)`. The execution id tie-break makes
/// the order total, so identical input sets always walk identically.
pub fn sort_executions_canonical(executions: &mut [Execution]) {
    executions.sort_by(|a, b| a.ts_utc.cmp(&b.ts_utc).then_with(|| a.id.cmp(&b.id)));
}

/// Verify the batch is monotonic in time within `tolerance_ms`.
///
/// A timestamp may regress by at most `tolerance_ms` milliseconds relative
/// to the latest timestamp seen (feed clocks jitter; genuine disorder does
/// not). Anything worse fails the whole batch with
/// [`FlowError::OutOfOrderInput`], recoverable by the caller via
/// [`sort_executions_canonical`] and retry.
pub fn check_monotonic(executions: &[Execution], tolerance_ms: i64) -> Result<(), FlowError> {
    debug_assert!(tolerance_ms >= 0);
    let mut high_water: Option<i64> = None;
    for ex in executions {
        let ts_ms = ex.ts_utc.timestamp_millis();
        if let Some(hw) = high_water {
            if ts_ms < hw - tolerance_ms {
                return Err(FlowError::OutOfOrderInput {
                    execution_id: ex.id,
                    ts_ms,
                    high_water_ms: hw,
                    tolerance_ms,
                });
            }
        }
        high_water = Some(high_water.map_or(ts_ms, |hw| hw.max(ts_ms)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jnl_schemas::{RoleHint, Side};
    use uuid::Uuid;

    fn exec_at(ms: i64) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            account: "acct".into(),
            instrument: "ES".into(),
            side: Side::Buy,
            role_hint: RoleHint::Unknown,
            quantity: 1,
            price_micros: 1_000_000,
            ts_utc: Utc.timestamp_millis_opt(ms).unwrap(),
            commission_micros: 0,
            source_seq: None,
            supersedes: None,
        }
    }

    #[test]
    fn sorted_input_passes() {
        let execs = vec![exec_at(0), exec_at(10), exec_at(10), exec_at(20)];
        assert!(check_monotonic(&execs, 0).is_ok());
    }

    #[test]
    fn regression_beyond_tolerance_rejected() {
        let execs = vec![exec_at(100), exec_at(40)];
        let err = check_monotonic(&execs, 50).unwrap_err();
        match err {
            FlowError::OutOfOrderInput {
                ts_ms,
                high_water_ms,
                ..
            } => {
                assert_eq!(ts_ms, 40);
                assert_eq!(high_water_ms, 100);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn regression_within_tolerance_allowed() {
        let execs = vec![exec_at(100), exec_at(60)];
        assert!(check_monotonic(&execs, 50).is_ok());
    }

    #[test]
    fn sort_breaks_timestamp_ties_by_id() {
        let mut a = exec_at(10);
        let mut b = exec_at(10);
        // Force a known id order.
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);
        let mut execs = vec![a.clone(), b.clone()];
        sort_executions_canonical(&mut execs);
        assert_eq!(execs[0].id, b.id);
        assert_eq!(execs[1].id, a.id);
    }

    #[test]
    fn sort_then_check_roundtrip() {
        let mut execs = vec![exec_at(30), exec_at(10), exec_at(20)];
        assert!(check_monotonic(&execs, 0).is_err());
        sort_executions_canonical(&mut execs);
        assert!(check_monotonic(&execs, 0).is_ok());
    }
}

//! Quantity-weighted pricing and realized PnL.
//!
//! All arithmetic widens to `i128` before multiplying so `qty × price ×
//! multiplier` cannot overflow, then clamps back to `i64` micros.

use jnl_schemas::{PositionSide, MICROS_SCALE};
use uuid::Uuid;

/// The portion of an execution attributed to one side of one position.
///
/// A sign-flipping execution is split into slices: the covering quantity
/// becomes an exit slice of the closing position, the remainder (policy
/// permitting) an entry slice of the next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FillSlice {
    pub execution_id: Uuid,
    pub quantity: i64,
    pub price_micros: i64,
}

impl FillSlice {
    pub fn new(execution_id: Uuid, quantity: i64, price_micros: i64) -> Self {
        debug_assert!(quantity > 0, "FillSlice.quantity must be > 0");
        Self {
            execution_id,
            quantity,
            price_micros,
        }
    }
}

fn i128_to_i64_clamp(x: i128) -> i64 {
    if x > i64::MAX as i128 {
        i64::MAX
    } else if x < i64::MIN as i128 {
        i64::MIN
    } else {
        x as i64
    }
}

/// Integer division rounding half away from zero.
fn div_round_half_away(num: i128, den: i128) -> i128 {
    debug_assert!(den > 0);
    if num >= 0 {
        (num + den / 2) / den
    } else {
        (num - den / 2) / den
    }
}

/// Quantity-weighted mean price over fill slices:
/// `Σ(price × qty) / Σ(qty)`, rounded half away from zero to micros.
///
/// Returns 0 for an empty slice list (no fills, no price).
pub fn weighted_avg_price_micros(fills: &[FillSlice]) -> i64 {
    let total_qty: i128 = fills.iter().map(|f| f.quantity as i128).sum();
    if total_qty == 0 {
        return 0;
    }
    let notional: i128 = fills
        .iter()
        .map(|f| (f.quantity as i128) * (f.price_micros as i128))
        .sum();
    i128_to_i64_clamp(div_round_half_away(notional, total_qty))
}

/// Realized PnL at position close:
/// `(avg_exit − avg_entry) × qty × multiplier` for Long, negated for Short.
///
/// `multiplier_micros` is the instrument contract multiplier at micros scale
/// (multiplier 50 → `50_000_000`). Commission is never netted in here; the
/// position carries it separately.
pub fn realized_pnl_micros(
    side: PositionSide,
    avg_entry_price_micros: i64,
    avg_exit_price_micros: i64,
    quantity: i64,
    multiplier_micros: i64,
) -> i64 {
    let diff = match side {
        PositionSide::Long => avg_exit_price_micros as i128 - avg_entry_price_micros as i128,
        PositionSide::Short => avg_entry_price_micros as i128 - avg_exit_price_micros as i128,
    };
    let gross = diff * (quantity as i128) * (multiplier_micros as i128);
    i128_to_i64_clamp(div_round_half_away(gross, MICROS_SCALE as i128))
}

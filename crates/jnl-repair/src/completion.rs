//! Data completion.
//!
//! A missing quantity is filled only when conservation determines it
//! uniquely: exactly one incomplete record in the scope, missing nothing but
//! its quantity, positioned as the final fill of an otherwise-closed
//! sequence. Price and side are never inferred; multiple simultaneous gaps
//! are ambiguous and stay unrepairable.

use jnl_positions::validate_execution;
use jnl_schemas::{ExecutionRecord, MissingField, Side};

use crate::plan::CorrectionAction;

pub(crate) fn plan_completion(
    records: &[ExecutionRecord],
) -> Result<Vec<CorrectionAction>, String> {
    let active: Vec<&ExecutionRecord> = records.iter().filter(|r| !r.voided).collect();
    let gaps: Vec<&ExecutionRecord> = active
        .iter()
        .copied()
        .filter(|r| !r.is_complete())
        .collect();

    let gap = match gaps.as_slice() {
        [] => return Err("no incomplete records in scope".to_string()),
        [one] => *one,
        many => {
            return Err(format!(
                "{} records are incomplete simultaneously; inferred values would not be unique",
                many.len()
            ))
        }
    };

    let missing = gap.missing_fields();
    if missing != [MissingField::Quantity] {
        let fields: Vec<&str> = missing.iter().map(|m| m.as_str()).collect();
        return Err(format!(
            "execution {} is missing {}; only a lone quantity gap is inferable, and price and side are never inferred",
            gap.id,
            fields.join(", ")
        ));
    }
    let gap_side = gap.side.expect("side present when only quantity is missing");

    // Net signed quantity over the usable complete records.
    let mut net: i64 = 0;
    for rec in active.iter().filter(|r| r.id != gap.id) {
        let ex = match rec.validate() {
            Ok(ex) => ex,
            Err(_) => unreachable!("gap is the only incomplete record"),
        };
        if validate_execution(&ex).is_err() {
            return Err(format!(
                "execution {} is malformed; conservation baseline unusable",
                rec.id
            ));
        }
        net += ex.signed_delta();
        // Conservation can only pin the *final* fill's quantity; a gap with
        // later fills admits more than one consistent value.
        if (ex.ts_utc, ex.id) > (gap.ts_utc, gap.id) {
            return Err(format!(
                "execution {} is not the final fill of its scope; remaining quantity not uniquely determined",
                gap.id
            ));
        }
    }

    let quantity = match gap_side {
        Side::Buy if net < 0 => -net,
        Side::Sell if net > 0 => net,
        _ => {
            return Err(format!(
                "conservation does not determine a positive quantity for execution {} (net open {})",
                gap.id, net
            ))
        }
    };

    Ok(vec![CorrectionAction::FillQuantity {
        execution_id: gap.id,
        quantity,
    }])
}

//! Money arithmetic helpers.
//!
//! Amounts are carried as `i64` integer cents throughout meterbill; usage
//! quantities are `rust_decimal::Decimal`. Nothing in this module (or anywhere
//! else that feeds invoice totals) goes through binary floating point.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::BillingError;

/// Basis points in a whole (10000 bps = 100%).
pub const BPS_SCALE: i64 = 10_000;

/// Compute a tax amount from a subtotal and a rate in basis points,
/// rounding half-up.
///
/// Half-up rounds a `.5` remainder toward positive infinity, so a negative
/// subtotal (an invoice dominated by credit lines) rounds toward zero at the
/// midpoint: `-12.5` becomes `-12`.
///
/// # Errors
///
/// Returns `BillingError::InvalidTaxRate` if `rate_bps` exceeds 10000.
pub fn tax_from_bps(subtotal_cents: i64, rate_bps: u32) -> Result<i64, BillingError> {
    if i64::from(rate_bps) > BPS_SCALE {
        return Err(BillingError::InvalidTaxRate { bps: rate_bps });
    }

    let numerator = i128::from(subtotal_cents) * i128::from(rate_bps);
    let scale = i128::from(BPS_SCALE);
    let quotient = numerator.div_euclid(scale);
    let remainder = numerator.rem_euclid(scale);

    let rounded = if remainder * 2 >= scale {
        quotient + 1
    } else {
        quotient
    };

    i64::try_from(rounded).map_err(|_| BillingError::AmountOverflow {
        context: "tax computation".into(),
    })
}

/// Price a usage quantity at a per-unit rate in cents, rounding the result to
/// whole cents (midpoint away from zero).
///
/// The multiplication stays in `Decimal` so fractional quantities accumulated
/// from many small events do not pick up float drift before rounding.
///
/// # Errors
///
/// Returns `BillingError::AmountOverflow` if the product does not fit in
/// `i64` cents.
pub fn price_quantity(quantity: Decimal, unit_amount_cents: i64) -> Result<i64, BillingError> {
    let amount = quantity
        .checked_mul(Decimal::from(unit_amount_cents))
        .ok_or_else(|| BillingError::AmountOverflow {
            context: "usage pricing".into(),
        })?;

    amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| BillingError::AmountOverflow {
            context: "usage pricing".into(),
        })
}

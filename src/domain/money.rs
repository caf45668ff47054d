//! Decimal money handling (spec §3: up to 18 integer + 8 fractional digits).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// One smallest USDT unit at 18 fractional on-chain decimals, expressed at the
/// gateway's 8-fractional-digit precision. The tolerance named in spec §4.3
/// ("within a tolerance of 1 smallest token unit") is evaluated at this scale,
/// not at the raw 18-decimal on-chain scale, since the gateway only ever
/// compares already-scaled decimal amounts.
pub const ONE_SMALLEST_UNIT: Decimal = dec!(0.00000001);

/// Classification of a detected amount against the address's expected amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountClass {
    Exact,
    Under,
    Over,
}

/// Classify `detected` against `expected` within ±1 smallest unit, per spec §4.3
/// and the boundary behaviors in §8 (exactly `expected - 1` is UNDERPAID, exactly
/// `expected + 1` is CONFIRMED+overpay).
///
/// The tolerance is a strict `<`, not `<=`: a difference of *exactly* one
/// smallest unit is itself a distinguishable under/over payment per the
/// boundary behaviors in §8, while sub-unit rounding noise (diff == 0) is
/// exact. The tolerance exists to absorb decimal-scaling rounding, not to
/// widen the exact-match band to a full unit.
pub fn classify_amount(detected: Decimal, expected: Decimal) -> AmountClass {
    let diff = detected - expected;
    if diff.abs() < ONE_SMALLEST_UNIT {
        AmountClass::Exact
    } else if diff.is_sign_negative() {
        AmountClass::Under
    } else {
        AmountClass::Over
    }
}

/// Scale raw on-chain integer units (18 decimals for USDT BEP-20) down to the
/// gateway's decimal representation.
pub fn from_raw_units(raw: u128, token_decimals: u32) -> Decimal {
    let raw = Decimal::from(raw);
    raw / Decimal::from(10u128.pow(token_decimals))
}

/// Inverse of [`from_raw_units`] — scales a gateway decimal amount up to raw
/// on-chain integer units for a transfer submission.
pub fn to_raw_units(amount: Decimal, token_decimals: u32) -> u128 {
    let scaled = amount * Decimal::from(10u128.pow(token_decimals));
    scaled.trunc().to_string().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn exact_amount_within_tolerance() {
        assert_eq!(classify_amount(dec!(100.00), dec!(100.00)), AmountClass::Exact);
    }

    #[test]
    fn underpaid_by_exactly_one_smallest_unit_is_underpaid() {
        assert_eq!(
            classify_amount(dec!(99.99999999), dec!(100.00)),
            AmountClass::Under
        );
    }

    #[test]
    fn overpaid_by_exactly_one_smallest_unit_is_overpaid() {
        assert_eq!(
            classify_amount(dec!(100.00000001), dec!(100.00)),
            AmountClass::Over
        );
    }

    #[test]
    fn overpaid_beyond_tolerance() {
        assert_eq!(classify_amount(dec!(110.00), dec!(100.00)), AmountClass::Over);
    }

    #[test]
    fn underpaid_beyond_tolerance() {
        assert_eq!(classify_amount(dec!(90.00), dec!(100.00)), AmountClass::Under);
    }

    #[test]
    fn raw_units_scale_down_correctly() {
        assert_eq!(from_raw_units(100_000000000000000000, 18), dec!(100));
    }

    #[test]
    fn raw_units_scale_up_correctly() {
        assert_eq!(to_raw_units(dec!(100), 18), 100_000000000000000000u128);
    }
}

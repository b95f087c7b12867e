//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Truncate toward zero at `decimals` places.
///
/// Stakes are never rounded up: the truncated value can only be less than
/// or equal to the intended risk budget.
pub fn truncate_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Percentage change from `from` to `to`, in percent units (1.5 = 1.5%).
pub fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    safe_div(to - from, from) * dec!(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_never_rounds_up() {
        assert_eq!(truncate_to_precision(dec!(12.349), 2), dec!(12.34));
        assert_eq!(truncate_to_precision(dec!(12.999), 0), dec!(12));
        assert_eq!(truncate_to_precision(dec!(-1.255), 2), dec!(-1.25));
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(dec!(100), dec!(101)), dec!(1));
        assert_eq!(percent_change(dec!(200), dec!(199)), dec!(-0.5));
        assert_eq!(percent_change(Decimal::ZERO, dec!(5)), Decimal::ZERO);
    }
}

//! Peak-to-trough drawdown tracking for one strategy balance.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::decimal::safe_div;

/// Tracks peak balance, current drawdown and the worst drawdown seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownTracker {
    /// Highest balance observed
    pub peak_balance: Decimal,
    /// Current drawdown from peak (0.0-1.0)
    pub current_drawdown: Decimal,
    /// Worst drawdown observed (0.0-1.0); never decreases
    pub max_drawdown: Decimal,
}

impl DrawdownTracker {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            peak_balance: initial_balance.max(Decimal::ZERO),
            current_drawdown: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
        }
    }

    /// Update with a new balance and return the current drawdown.
    pub fn update(&mut self, balance: Decimal) -> Decimal {
        if balance >= self.peak_balance {
            self.peak_balance = balance;
            self.current_drawdown = Decimal::ZERO;
            return self.current_drawdown;
        }

        self.current_drawdown = safe_div(self.peak_balance - balance, self.peak_balance);

        if self.current_drawdown > self.max_drawdown {
            self.max_drawdown = self.current_drawdown;
            warn!(
                mdd = %self.max_drawdown,
                peak = %self.peak_balance,
                current = %balance,
                "New maximum drawdown recorded"
            );
        }

        self.current_drawdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_drawdown_tracking() {
        let mut tracker = DrawdownTracker::new(dec!(1000));

        assert_eq!(tracker.update(dec!(1100)), Decimal::ZERO);
        assert_eq!(tracker.peak_balance, dec!(1100));

        // (1100 - 900) / 1100 ≈ 18.18%
        let dd = tracker.update(dec!(900));
        assert!(dd > dec!(0.1818) && dd < dec!(0.1819));
        assert_eq!(tracker.max_drawdown, dd);
    }

    #[test]
    fn test_max_drawdown_never_decreases() {
        let mut tracker = DrawdownTracker::new(dec!(1000));
        tracker.update(dec!(1100));
        tracker.update(dec!(900));
        let worst = tracker.max_drawdown;

        tracker.update(dec!(950));
        assert_eq!(tracker.max_drawdown, worst);
        assert!(tracker.current_drawdown < worst);

        tracker.update(dec!(2000));
        assert_eq!(tracker.max_drawdown, worst);
        assert_eq!(tracker.current_drawdown, Decimal::ZERO);
    }

    #[test]
    fn test_zero_peak_has_no_drawdown() {
        let mut tracker = DrawdownTracker::new(Decimal::ZERO);
        assert_eq!(tracker.update(Decimal::ZERO), Decimal::ZERO);
    }
}

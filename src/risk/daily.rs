//! Per-day trading statistics backing the daily loss circuit breaker.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::utils::decimal::safe_div;

/// Counters for one trading day. Replaced wholesale on date rollover,
/// which is the only way `limit_reached` is cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTradingStats {
    /// Day key (UTC)
    pub date: NaiveDate,
    /// Balance observed when the day started
    pub start_balance: Decimal,
    /// Net realized P&L today
    pub realized_pnl: Decimal,
    /// Realized loss today, never negative
    pub current_loss: Decimal,
    pub trades_executed: u32,
    /// Entries refused by the circuit breaker
    pub trades_paused: u32,
    /// One-way latch for the rest of the day
    pub limit_reached: bool,
}

impl DailyTradingStats {
    pub fn new(date: NaiveDate, start_balance: Decimal) -> Self {
        Self {
            date,
            start_balance,
            realized_pnl: Decimal::ZERO,
            current_loss: Decimal::ZERO,
            trades_executed: 0,
            trades_paused: 0,
            limit_reached: false,
        }
    }

    /// Loss as a fraction of the start balance.
    pub fn loss_pct(&self) -> Decimal {
        safe_div(self.current_loss, self.start_balance)
    }

    pub(super) fn apply_pnl(&mut self, pnl: Decimal) {
        self.realized_pnl += pnl;
        self.current_loss = (-self.realized_pnl).max(Decimal::ZERO);
    }
}

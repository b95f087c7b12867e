//! Capital bookkeeping for a single strategy.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::drawdown::DrawdownTracker;
use crate::trading::TradeRecord;
use crate::utils::decimal::safe_div;

/// Ledger state of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAccount {
    pub name: String,
    /// Realized capital; never negative
    pub balance: Decimal,
    /// Total capital allocated to the strategy
    pub initial_balance: Decimal,
    /// Capital held for in-flight and open positions
    pub reserved: Decimal,
    pub open_positions: u32,
    pub history: Vec<TradeRecord>,
    /// Realized P&L for `daily_pnl_date`
    pub daily_pnl: Decimal,
    pub daily_pnl_date: NaiveDate,
    #[serde(flatten)]
    pub drawdown: DrawdownTracker,
    pub created_at: DateTime<Utc>,
}

impl StrategyAccount {
    pub fn new(name: impl Into<String>, initial_balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            balance: initial_balance,
            initial_balance,
            reserved: Decimal::ZERO,
            open_positions: 0,
            history: Vec::new(),
            daily_pnl: Decimal::ZERO,
            daily_pnl_date: now.date_naive(),
            drawdown: DrawdownTracker::new(initial_balance),
            created_at: now,
        }
    }

    /// Capital not yet committed to a position.
    pub fn available(&self) -> Decimal {
        (self.balance - self.reserved).max(Decimal::ZERO)
    }

    pub fn peak_balance(&self) -> Decimal {
        self.drawdown.peak_balance
    }

    pub fn max_drawdown(&self) -> Decimal {
        self.drawdown.max_drawdown
    }

    pub(super) fn deposit(&mut self, amount: Decimal) {
        self.balance += amount;
        self.initial_balance += amount;
        self.drawdown.update(self.balance);
    }

    pub(super) fn try_reserve(&mut self, amount: Decimal) -> bool {
        if amount > self.balance - self.reserved {
            return false;
        }
        self.reserved += amount;
        self.open_positions += 1;
        true
    }

    pub(super) fn release(&mut self, amount: Decimal) {
        self.reserved = (self.reserved - amount).max(Decimal::ZERO);
        self.open_positions = self.open_positions.saturating_sub(1);
    }

    /// Apply a realized trade. The balance is floored at zero.
    pub(super) fn apply_trade(&mut self, record: TradeRecord) {
        let day = record.closed_at.date_naive();
        if day != self.daily_pnl_date {
            self.daily_pnl_date = day;
            self.daily_pnl = Decimal::ZERO;
        }

        self.balance = (self.balance + record.pnl).max(Decimal::ZERO);
        self.daily_pnl += record.pnl;
        self.drawdown.update(self.balance);
        self.history.push(record);
    }

    pub fn stats(&self) -> AccountStats {
        let trades = self.history.len();
        let wins = self.history.iter().filter(|t| t.is_win()).count();
        let total_pnl: Decimal = self.history.iter().map(|t| t.pnl).sum();

        AccountStats {
            name: self.name.clone(),
            balance: self.balance,
            available: self.available(),
            reserved: self.reserved,
            initial_balance: self.initial_balance,
            total_pnl,
            return_pct: safe_div(self.balance - self.initial_balance, self.initial_balance)
                * dec!(100),
            trades,
            wins,
            losses: trades - wins,
            win_rate: safe_div(Decimal::from(wins), Decimal::from(trades)),
            daily_pnl: self.daily_pnl,
            peak_balance: self.peak_balance(),
            current_drawdown: self.drawdown.current_drawdown,
            max_drawdown: self.max_drawdown(),
            open_positions: self.open_positions,
        }
    }
}

/// Read-only summary of a strategy account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStats {
    pub name: String,
    pub balance: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub initial_balance: Decimal,
    pub total_pnl: Decimal,
    /// Return on allocated capital, percent units
    pub return_pct: Decimal,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// 0.0-1.0
    pub win_rate: Decimal,
    pub daily_pnl: Decimal,
    pub peak_balance: Decimal,
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub open_positions: u32,
}

/// The only ledger view risk policy may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskContext {
    pub available_balance: Decimal,
    pub open_positions: u32,
    pub daily_pnl: Decimal,
}

//! Core trading domain types shared by the ledger, risk, exit and manager
//! layers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::decimal::percent_change;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    /// Multiplier-style contract that can be closed at any time.
    Leveraged,
    /// Fixed-expiry contract settled by the broker.
    Binary,
}

impl fmt::Display for TradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeMode::Leveraged => write!(f, "leveraged"),
            TradeMode::Binary => write!(f, "binary"),
        }
    }
}

/// Position lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Breakeven protection state of a position.
///
/// Moves from `Normal` to `Protected` at most once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProtectState {
    #[default]
    Normal,
    Protected { activated_at: DateTime<Utc> },
}

impl ProtectState {
    pub fn is_protected(&self) -> bool {
        matches!(self, ProtectState::Protected { .. })
    }

    /// Merge a newly evaluated state into the current one. Set-only: a
    /// protected state is kept with its original activation time.
    pub fn merge(self, next: ProtectState) -> ProtectState {
        match (self, next) {
            (ProtectState::Protected { .. }, _) => self,
            (ProtectState::Normal, next) => next,
        }
    }
}

/// Per-position exit parameters and flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMetadata {
    /// Take-profit distance in percent units
    pub tp_pct: Decimal,
    /// Stop-loss distance in percent units
    pub sl_pct: Decimal,
    pub protect: ProtectState,
    /// Rebuilt from the broker's open-position list at startup
    pub recovered: bool,
    /// Entry price unknown until the first tick is observed
    pub entry_pending: bool,
    /// Broker contract type, when known
    pub contract_type: Option<String>,
    /// The stake is held as a reservation on the strategy's ledger
    #[serde(default)]
    pub reserved: bool,
}

impl TradeMetadata {
    pub fn new(tp_pct: Decimal, sl_pct: Decimal) -> Self {
        Self {
            tp_pct,
            sl_pct,
            protect: ProtectState::Normal,
            recovered: false,
            entry_pending: false,
            contract_type: None,
            reserved: false,
        }
    }
}

/// A live or closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Broker-assigned id, unique across the process
    pub contract_id: String,
    /// Strategy account that funds the position
    pub strategy: String,
    pub asset: String,
    pub direction: Direction,
    pub mode: TradeMode,
    pub entry_price: Decimal,
    pub stake: Decimal,
    /// Open time; always a valid, positive instant
    pub timestamp: DateTime<Utc>,
    /// Settlement time for binary contracts
    pub expires_at: Option<DateTime<Utc>>,
    pub status: TradeStatus,
    pub metadata: TradeMetadata,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract_id: impl Into<String>,
        strategy: impl Into<String>,
        asset: impl Into<String>,
        direction: Direction,
        mode: TradeMode,
        entry_price: Decimal,
        stake: Decimal,
        timestamp: DateTime<Utc>,
        metadata: TradeMetadata,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            strategy: strategy.into(),
            asset: asset.into(),
            direction,
            mode,
            entry_price,
            stake,
            timestamp,
            expires_at: None,
            status: TradeStatus::Open,
            metadata,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Unrealized move in percent units, signed by direction.
    pub fn profit_pct(&self, price: Decimal) -> Decimal {
        let change = percent_change(self.entry_price, price);
        match self.direction {
            Direction::Long => change,
            Direction::Short => -change,
        }
    }

    pub fn time_in_trade(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).max(Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now >= expiry)
    }
}

/// A realized trade, as recorded in the ledger history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub contract_id: String,
    pub strategy: String,
    pub asset: String,
    pub direction: Direction,
    pub mode: TradeMode,
    pub stake: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub reason: String,
}

impl TradeRecord {
    /// Build the record for a position closing with the given result.
    pub fn from_trade(
        trade: &Trade,
        pnl: Decimal,
        exit_price: Option<Decimal>,
        closed_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            contract_id: trade.contract_id.clone(),
            strategy: trade.strategy.clone(),
            asset: trade.asset.clone(),
            direction: trade.direction,
            mode: trade.mode,
            stake: trade.stake,
            entry_price: trade.entry_price,
            exit_price,
            pnl,
            opened_at: trade.timestamp,
            closed_at,
            reason: reason.into(),
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

/// Directional trigger produced by a strategy. Opaque to the engine apart
/// from the fields below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy: String,
    pub asset: String,
    pub direction: Direction,
    /// Strategy confidence in [0, 1]
    pub confidence: Decimal,
    pub mode: TradeMode,
    /// Reference price at signal time
    pub price: Decimal,
    pub tp_pct: Option<Decimal>,
    pub sl_pct: Option<Decimal>,
}

/// Price update for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub asset: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Momentum indicator (RSI) when the feed provides one
    pub rsi: Option<Decimal>,
}

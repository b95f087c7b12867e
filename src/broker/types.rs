//! Broker-facing data types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::{Direction, TradeMode};

/// Purchase time exactly as reported by the broker.
///
/// Brokers disagree on representation: epoch seconds, epoch milliseconds,
/// numeric strings and date strings all occur, as do garbage values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Number(f64),
    Text(String),
}

/// One entry of the broker's authoritative open-position list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub contract_id: String,
    pub symbol: String,
    /// Broker contract type, e.g. `MULTUP`, `CALL`, `PUT`
    pub contract_type: String,
    /// Stake paid for the contract
    pub buy_price: Decimal,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub profit_percentage: Decimal,
    #[serde(default)]
    pub purchase_time: Option<RawTimestamp>,
    /// Underlying spot at purchase, when reported
    #[serde(default)]
    pub entry_spot: Option<Decimal>,
}

/// Order sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub asset: String,
    pub direction: Direction,
    pub mode: TradeMode,
    pub stake: Decimal,
    /// Leveraged contracts only
    pub multiplier: Option<u32>,
    /// Binary contracts only
    pub duration_secs: Option<u64>,
}

impl TradeRequest {
    /// Broker contract type for this request.
    pub fn contract_type(&self) -> &'static str {
        contract_type_for(self.direction, self.mode)
    }
}

pub fn contract_type_for(direction: Direction, mode: TradeMode) -> &'static str {
    match (mode, direction) {
        (TradeMode::Leveraged, Direction::Long) => "MULTUP",
        (TradeMode::Leveraged, Direction::Short) => "MULTDOWN",
        (TradeMode::Binary, Direction::Long) => "CALL",
        (TradeMode::Binary, Direction::Short) => "PUT",
    }
}

/// Broker confirmation of an executed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub contract_id: String,
    pub entry_price: Decimal,
    pub purchase_time: DateTime<Utc>,
    /// Settlement time for binary contracts
    pub expires_at: Option<DateTime<Utc>>,
}

/// Broker confirmation of a closed or settled contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseReport {
    pub contract_id: String,
    /// Underlying price at close
    pub sell_price: Decimal,
    /// Realized P&L in account currency
    pub profit: Decimal,
}

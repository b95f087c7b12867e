//! Rebuilding positions from the broker's open-position list.
//!
//! Every record is interpreted independently; a malformed record is
//! skipped or patched, never allowed to abort the batch.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::broker::{BrokerPosition, RawTimestamp};
use crate::trading::{Direction, Trade, TradeMetadata, TradeMode};

/// Epoch values below this are seconds, above are milliseconds.
const MILLIS_THRESHOLD: f64 = 1e12;

const SHORT_TOKENS: [&str; 4] = ["DOWN", "PUT", "FALL", "LOWER"];
const LONG_TOKENS: [&str; 4] = ["UP", "CALL", "RISE", "HIGHER"];
const BINARY_TOKENS: [&str; 4] = ["RISE", "FALL", "HIGHER", "LOWER"];

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationReport {
    /// Positions newly added to the tracked set
    pub recovered: usize,
    /// Positions that were already tracked
    pub already_tracked: usize,
    /// Records that could not be interpreted
    pub skipped: usize,
    /// Recovered positions whose purchase time was replaced by the current time
    pub timestamp_fallbacks: usize,
    pub timestamp: DateTime<Utc>,
}

/// Direction of a broker contract type.
///
/// Downward tokens are checked first: `PUT` contains `UP`.
pub fn infer_direction(contract_type: &str) -> Option<Direction> {
    let upper = contract_type.to_ascii_uppercase();
    if SHORT_TOKENS.iter().any(|t| upper.contains(t)) {
        Some(Direction::Short)
    } else if LONG_TOKENS.iter().any(|t| upper.contains(t)) {
        Some(Direction::Long)
    } else {
        None
    }
}

/// Contract mode of a broker contract type. Anything that is not clearly a
/// fixed-expiry contract is treated as leveraged.
pub fn infer_mode(contract_type: &str) -> TradeMode {
    let upper = contract_type.to_ascii_uppercase();
    let binary = upper.starts_with("CALL")
        || upper.starts_with("PUT")
        || BINARY_TOKENS.iter().any(|t| upper.contains(t));
    if binary {
        TradeMode::Binary
    } else {
        TradeMode::Leveraged
    }
}

/// Interpret a broker purchase time.
///
/// Accepts finite, strictly positive epoch seconds or milliseconds (as a
/// number or numeric string) and RFC 3339 strings. Returns `None` for
/// anything else.
pub fn parse_purchase_time(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    match raw {
        RawTimestamp::Number(value) => from_epoch(*value),
        RawTimestamp::Text(text) => {
            let text = text.trim();
            match text.parse::<f64>() {
                Ok(value) => from_epoch(value),
                Err(_) => DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
                    .filter(|dt| dt.timestamp_millis() > 0),
            }
        }
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value < MILLIS_THRESHOLD {
        value * 1000.0
    } else {
        value
    };
    if millis > i64::MAX as f64 {
        return None;
    }
    let millis = millis as i64;
    if millis <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

/// A broker record translated into a tracked position.
#[derive(Debug, Clone)]
pub struct RecoveredTrade {
    pub trade: Trade,
    pub timestamp_fallback: bool,
}

/// Parameters applied to every recovered position.
#[derive(Debug, Clone)]
pub struct RecoveryDefaults {
    pub strategy: String,
    pub tp_pct: Decimal,
    pub sl_pct: Decimal,
    pub binary_duration: Duration,
}

/// Translate one broker record. Returns `None` when the record cannot be
/// tracked at all.
pub fn recover_position(
    position: &BrokerPosition,
    defaults: &RecoveryDefaults,
    now: DateTime<Utc>,
) -> Option<RecoveredTrade> {
    let Some(direction) = infer_direction(&position.contract_type) else {
        warn!(
            contract_id = %position.contract_id,
            contract_type = %position.contract_type,
            "Unknown contract type - skipping position"
        );
        return None;
    };
    if position.contract_id.trim().is_empty() || position.symbol.trim().is_empty() {
        warn!(?position, "Broker position without id or symbol - skipping");
        return None;
    }

    let mode = infer_mode(&position.contract_type);
    let parsed = position.purchase_time.as_ref().and_then(parse_purchase_time);
    let timestamp_fallback = parsed.is_none();
    let timestamp = parsed.unwrap_or(now);

    let entry = position.entry_spot.filter(|spot| *spot > Decimal::ZERO);

    let mut metadata = TradeMetadata::new(defaults.tp_pct, defaults.sl_pct);
    metadata.recovered = true;
    metadata.entry_pending = entry.is_none();
    metadata.contract_type = Some(position.contract_type.clone());

    let mut trade = Trade::new(
        position.contract_id.clone(),
        defaults.strategy.clone(),
        position.symbol.clone(),
        direction,
        mode,
        entry.unwrap_or(Decimal::ZERO),
        position.buy_price,
        timestamp,
        metadata,
    );
    if mode == TradeMode::Binary {
        trade = trade.with_expiry(timestamp + defaults.binary_duration);
    }

    debug!(
        contract_id = %trade.contract_id,
        asset = %trade.asset,
        %direction,
        %mode,
        timestamp_fallback,
        "Recovered broker position"
    );

    Some(RecoveredTrade {
        trade,
        timestamp_fallback,
    })
}

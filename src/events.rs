//! Engine notifications.
//!
//! Components publish [`EngineEvent`]s on a shared broadcast channel.
//! Observers subscribe independently; publishing never blocks and never
//! fails when nobody is listening.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::exit::ExitReason;
use crate::trading::{Trade, TradeRecord};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A realized trade was written to a strategy ledger.
    TradeRecorded { strategy: String, record: TradeRecord },
    /// A strategy balance changed.
    BalanceUpdated {
        strategy: String,
        balance: Decimal,
        pnl: Decimal,
    },
    /// A position entered the tracked set.
    TradeRegistered { trade: Trade },
    /// A position left the tracked set.
    TradeClosed {
        record: TradeRecord,
        exit_reason: Option<ExitReason>,
    },
    /// The daily loss circuit breaker latched.
    DailyLimitReached { loss: Decimal, start_balance: Decimal },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TradeRecorded { .. } => "trade:recorded",
            EngineEvent::BalanceUpdated { .. } => "balance:updated",
            EngineEvent::TradeRegistered { .. } => "trade:registered",
            EngineEvent::TradeClosed { .. } => "trade:closed",
            EngineEvent::DailyLimitReached { .. } => "risk:daily_limit",
        }
    }
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let name = event.name();
        // Err only means there are no subscribers right now.
        if self.tx.send(event).is_err() {
            trace!(event = name, "No subscribers for event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(EngineEvent::BalanceUpdated {
            strategy: "alpha".to_string(),
            balance: dec!(1100),
            pnl: dec!(100),
        });

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name(), "balance:updated");
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::DailyLimitReached {
            loss: dec!(50),
            start_balance: dec!(1000),
        });
    }
}

//! Trading domain model: positions, realized trades, signals and ticks.

mod types;

pub use types::{
    Direction, MarketTick, ProtectState, Signal, Trade, TradeMetadata, TradeMode, TradeRecord,
    TradeStatus,
};

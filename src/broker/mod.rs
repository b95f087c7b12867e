//! Broker integration surface.
//!
//! The engine only talks to a broker through the [`Broker`] trait. Transport
//! (REST, WebSocket) lives behind implementations; [`PaperBroker`] simulates
//! fills in memory for replays and tests.

mod paper;
mod types;

use async_trait::async_trait;

pub use paper::PaperBroker;
pub use types::{
    contract_type_for, BrokerPosition, CloseReport, ExecutionReport, RawTimestamp, TradeRequest,
};

/// Execution gateway consumed by the trade manager.
///
/// Implementations report failures through `anyhow`; callers bound every
/// call with their own timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// The broker's authoritative list of open contracts.
    async fn get_open_positions(&self) -> anyhow::Result<Vec<BrokerPosition>>;

    async fn execute_trade(&self, request: &TradeRequest) -> anyhow::Result<ExecutionReport>;

    /// Close a contract early, or collect the settlement of an expired one.
    async fn close_trade(&self, contract_id: &str) -> anyhow::Result<CloseReport>;
}

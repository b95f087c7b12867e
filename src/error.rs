//! Engine error type.
//!
//! Only caller defects and I/O failures are errors. Expected market
//! outcomes (risk caps, insufficient capital, daily limit) are returned as
//! typed values by the components that produce them.

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A ledger amount that must be strictly positive was not.
    #[error("invalid amount {amount} for strategy '{strategy}': must be > 0")]
    InvalidAmount { strategy: String, amount: Decimal },

    /// Operation against a strategy that was never allocated.
    #[error("strategy '{0}' not found")]
    StrategyNotFound(String),

    /// Operation against a contract the manager is not tracking.
    #[error("contract '{0}' is not tracked")]
    UnknownContract(String),

    #[error("snapshot version {found} is newer than supported version {supported}")]
    UnsupportedSnapshotVersion { found: u32, supported: u32 },

    #[error("snapshot serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("broker {operation} timed out after {timeout:?}")]
    BrokerTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("broker error: {0:#}")]
    Broker(anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

//! Strategy capital ledger.
//!
//! Provides per-strategy bookkeeping:
//! - Balance and allocated capital
//! - Stake reservations for in-flight and open positions
//! - Realized trade history and daily P&L
//! - Peak balance and maximum drawdown
//! - Versioned snapshots for restarts

mod account;
mod accountant;
mod drawdown;
mod snapshot;

pub use account::{AccountStats, RiskContext, StrategyAccount};
pub use accountant::StrategyAccountant;
pub use drawdown::DrawdownTracker;
pub use snapshot::{LedgerSnapshot, SNAPSHOT_VERSION};

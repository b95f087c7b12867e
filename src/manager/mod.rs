//! Trade lifecycle orchestration.
//!
//! Provides:
//! - Startup reconciliation against the broker's open positions
//! - Admission, sizing, execution and registration of new positions
//! - Per-tick exit evaluation and closure bookkeeping
//! - Per-asset advisory locks and losing-streak cooldowns

mod assets;
mod reconcile;
mod trade_manager;

pub use assets::{AssetLockGuard, AssetState, AssetTable, LockToken};
pub use reconcile::{
    infer_direction, infer_mode, parse_purchase_time, recover_position, ReconciliationReport,
    RecoveredTrade, RecoveryDefaults,
};
pub use trade_manager::{ManagerStats, OpenOutcome, TradeManager};

//! Risk management for trade admission.
//!
//! Provides:
//! - Ordered admission pipeline (daily loss breaker, global cap, per-symbol cap)
//! - Daily statistics with date rollover
//! - Stake sizing per contract mode

mod admission;
mod daily;
mod manager;

pub use admission::{AdmissionDecision, DenialReason};
pub use daily::DailyTradingStats;
pub use manager::RiskManager;

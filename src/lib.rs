//! # Trade Sentinel
//!
//! Trade lifecycle and risk-management engine: decides whether a signal may
//! become a live position, sizes it, tracks it to closure, and reconciles
//! internal state against the broker after restarts.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `ledger`: Per-strategy capital ledger with reservations and snapshots
//! - `risk`: Admission control, stake sizing, daily loss circuit breaker
//! - `exit`: Prioritized exit rules evaluated on every tick
//! - `manager`: Position authority, reconciliation, per-asset locks
//! - `broker`: Broker trait and the in-memory paper broker
//! - `events`: Broadcast notifications for observers
//! - `persistence`: SQLite storage for ledger snapshots and closed trades
//! - `replay`: Paper sessions over recorded ticks
//! - `utils`: Shared utilities and decimal arithmetic

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod exit;
pub mod ledger;
pub mod manager;
pub mod persistence;
pub mod replay;
pub mod risk;
pub mod trading;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, EngineResult};

//! Paper replays of recorded ticks.
//!
//! This module provides:
//! - CSV tick loading with optional RSI and signal columns
//! - A session that drives the trade manager against the paper broker
//!
//! # Example
//!
//! ```rust,ignore
//! use trade_sentinel::replay::{ReplaySession, TickLoader};
//!
//! let loader = TickLoader::new("data/ticks.csv")?;
//! let session = ReplaySession::new(manager, broker, settings);
//! let summary = session.run(loader.ticks(), Some(&persistence)).await?;
//! println!("Closed: {}", summary.closed);
//! ```

mod data;
mod session;

pub use data::{ReplayTick, TickLoader};
pub use session::{ReplaySession, ReplaySettings, ReplaySummary};

//! Exit policy for open positions.
//!
//! [`SmartExitManager::evaluate_exit`] is a pure function of the position,
//! the current price and an optional momentum reading. Rules run in strict
//! priority order and the first match wins.

mod smart;

pub use smart::{ExitDecision, ExitReason, SmartExitManager};

//! Admission outcomes.
//!
//! Denials are normal, expected results that callers branch on; they are
//! never reported as errors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// Positions have not been reconciled with the broker yet.
    NotReconciled,
    /// Daily loss circuit breaker is latched.
    DailyLossLimit { loss_pct: Decimal, limit_pct: Decimal },
    MaxOpenTrades { open: usize, max: usize },
    MaxTradesPerSymbol { asset: String, open: usize, max: usize },
    /// Another signal for the asset is already being executed.
    TradeInProgress { asset: String },
    /// The asset is pausing after a losing streak.
    AssetCooldown { asset: String, until: DateTime<Utc> },
    LowConfidence { confidence: Decimal, min: Decimal },
    InsufficientCapital { stake: Decimal, available: Decimal },
    /// The sized stake fell below the broker minimum.
    StakeBelowMinimum { stake: Decimal, min: Decimal },
    UnknownStrategy { strategy: String },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::NotReconciled => {
                write!(f, "positions not reconciled with broker; call start() first")
            }
            DenialReason::DailyLossLimit { loss_pct, limit_pct } => write!(
                f,
                "daily loss limit reached ({:.2}% >= {:.2}%)",
                loss_pct * Decimal::ONE_HUNDRED,
                limit_pct * Decimal::ONE_HUNDRED
            ),
            DenialReason::MaxOpenTrades { open, max } => {
                write!(f, "max open trades reached ({open}/{max})")
            }
            DenialReason::MaxTradesPerSymbol { asset, open, max } => {
                write!(f, "max trades for {asset} reached ({open}/{max})")
            }
            DenialReason::TradeInProgress { asset } => {
                write!(f, "trade already in progress for {asset}")
            }
            DenialReason::AssetCooldown { asset, until } => {
                write!(f, "{asset} cooling down until {until}")
            }
            DenialReason::LowConfidence { confidence, min } => {
                write!(f, "signal confidence {confidence} below {min}")
            }
            DenialReason::InsufficientCapital { stake, available } => {
                write!(f, "stake {stake} exceeds available capital {available}")
            }
            DenialReason::StakeBelowMinimum { stake, min } => {
                write!(f, "stake {stake} below minimum {min}")
            }
            DenialReason::UnknownStrategy { strategy } => {
                write!(f, "strategy '{strategy}' has no capital allocated")
            }
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Allowed,
    Denied(DenialReason),
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed)
    }

    pub fn reason(&self) -> Option<&DenialReason> {
        match self {
            AdmissionDecision::Allowed => None,
            AdmissionDecision::Denied(reason) => Some(reason),
        }
    }
}

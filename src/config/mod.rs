//! Configuration management for the trade sentinel.
//!
//! Loads settings from an optional `sentinel` config file and `SENTINEL__*`
//! environment variables.

use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Orchestration and broker settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Admission control and stake sizing
    #[serde(default)]
    pub risk: RiskConfig,
    /// Exit rule thresholds
    #[serde(default)]
    pub exit: ExitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Strategy account used for signals and recovered positions
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Capital allocated to the strategy when no snapshot exists
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Upper bound on any single broker round trip
    #[serde(default = "default_broker_timeout")]
    pub broker_timeout_secs: u64,
    /// Age after which an unreleased asset lock may be taken over
    #[serde(default = "default_trade_lock_ttl")]
    pub trade_lock_ttl_secs: u64,
    /// Signals below this confidence are ignored (0.0-1.0)
    #[serde(default = "default_min_signal_confidence")]
    pub min_signal_confidence: Decimal,
    /// Pause after a losing streak on one asset
    #[serde(default = "default_loss_cooldown")]
    pub loss_cooldown_secs: u64,
    /// Losing streak length that starts the cooldown (0 = disabled)
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Expiry of binary contracts
    #[serde(default = "default_binary_duration")]
    pub binary_duration_secs: u64,
    /// Multiplier requested for leveraged contracts
    #[serde(default = "default_leveraged_multiplier")]
    pub leveraged_multiplier: u32,
    /// SQLite database for ledger snapshots and the trade journal
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

/// Admission control and stake sizing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum open positions across all assets
    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: usize,
    /// Maximum open positions on one asset
    #[serde(default = "default_max_trades_per_symbol")]
    pub max_trades_per_symbol: usize,
    /// Fraction of balance risked per leveraged trade (0.0-1.0)
    #[serde(default = "default_risk_pct_leveraged")]
    pub risk_pct_leveraged: Decimal,
    /// Fraction of balance risked per binary trade (0.0-1.0)
    #[serde(default = "default_risk_pct_binary")]
    pub risk_pct_binary: Decimal,
    /// Multiplier applied to binary stakes on top of the risk fraction
    #[serde(default = "default_binary_safety_haircut")]
    pub binary_safety_haircut: Decimal,
    /// Smallest stake the broker accepts
    #[serde(default = "default_min_stake")]
    pub min_stake: Decimal,
    /// Absolute stake ceiling
    #[serde(default = "default_max_stake")]
    pub max_stake: Decimal,
    /// Stake ceiling as a fraction of balance (0.0-1.0)
    #[serde(default = "default_max_stake_pct")]
    pub max_stake_pct: Decimal,
    /// Realized daily loss, as a fraction of the day's start balance, that
    /// halts new entries for the rest of the day
    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: Decimal,
    #[serde(default = "default_daily_loss_limit_enabled")]
    pub daily_loss_limit_enabled: bool,
    /// Decimal places of the account currency
    #[serde(default = "default_stake_precision")]
    pub stake_precision: u32,
}

/// Exit rule thresholds. Percentages are in percent units (0.1 = 0.1%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    #[serde(default = "default_stagnation_duration")]
    pub stagnation_duration_secs: u64,
    #[serde(default = "default_stagnation_min_profit")]
    pub stagnation_min_profit_pct: Decimal,
    /// Soft limit: exit once reached if not losing
    #[serde(default = "default_max_trade_duration")]
    pub max_trade_duration_secs: u64,
    /// Hard limit: exit unconditionally
    #[serde(default = "default_extreme_max_duration")]
    pub extreme_max_duration_secs: u64,
    /// Minimum age before a reversal exit is considered
    #[serde(default = "default_min_trade_duration")]
    pub min_trade_duration_secs: u64,
    /// Fraction of take-profit that qualifies for a reversal exit
    #[serde(default = "default_early_exit_fraction")]
    pub early_exit_fraction: Decimal,
    /// Floor on profit for a reversal exit
    #[serde(default = "default_min_profit")]
    pub min_profit_pct: Decimal,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: Decimal,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: Decimal,
    /// Take-profit used when a signal carries none
    #[serde(default = "default_tp_pct")]
    pub default_tp_pct: Decimal,
    /// Stop-loss used when a signal carries none
    #[serde(default = "default_sl_pct")]
    pub default_sl_pct: Decimal,
}

impl ExitConfig {
    pub fn stagnation_duration(&self) -> Duration {
        secs(self.stagnation_duration_secs)
    }

    pub fn max_trade_duration(&self) -> Duration {
        secs(self.max_trade_duration_secs)
    }

    pub fn extreme_max_duration(&self) -> Duration {
        secs(self.extreme_max_duration_secs)
    }

    pub fn min_trade_duration(&self) -> Duration {
        secs(self.min_trade_duration_secs)
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

// Default value functions
fn default_strategy() -> String {
    "default".to_string()
}

fn default_initial_capital() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_broker_timeout() -> u64 {
    15
}

fn default_trade_lock_ttl() -> u64 {
    120 // Comfortably above the broker timeout
}

fn default_min_signal_confidence() -> Decimal {
    Decimal::ZERO
}

fn default_loss_cooldown() -> u64 {
    900 // 15 minutes
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_binary_duration() -> u64 {
    300
}

fn default_leveraged_multiplier() -> u32 {
    100
}

fn default_database_path() -> String {
    "data/sentinel.db".to_string()
}

fn default_max_open_trades() -> usize {
    3
}

fn default_max_trades_per_symbol() -> usize {
    1
}

fn default_risk_pct_leveraged() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_risk_pct_binary() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_binary_safety_haircut() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_min_stake() -> Decimal {
    Decimal::ONE
}

fn default_max_stake() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_stake_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_daily_loss_limit_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_daily_loss_limit_enabled() -> bool {
    true
}

fn default_stake_precision() -> u32 {
    2
}

fn default_stagnation_duration() -> u64 {
    900 // 15 minutes
}

fn default_stagnation_min_profit() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

fn default_max_trade_duration() -> u64 {
    1800 // 30 minutes
}

fn default_extreme_max_duration() -> u64 {
    3600 // 1 hour
}

fn default_min_trade_duration() -> u64 {
    120
}

fn default_early_exit_fraction() -> Decimal {
    Decimal::new(7, 1) // 0.7
}

fn default_min_profit() -> Decimal {
    Decimal::new(5, 2) // 0.05%
}

fn default_rsi_overbought() -> Decimal {
    Decimal::new(70, 0)
}

fn default_rsi_oversold() -> Decimal {
    Decimal::new(30, 0)
}

fn default_tp_pct() -> Decimal {
    Decimal::ONE // 1%
}

fn default_sl_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("sentinel").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SENTINEL"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        anyhow::ensure!(
            !self.engine.strategy.trim().is_empty(),
            "engine.strategy must not be empty"
        );
        anyhow::ensure!(
            self.engine.initial_capital > Decimal::ZERO,
            "engine.initial_capital must be positive"
        );
        anyhow::ensure!(
            self.engine.broker_timeout_secs > 0,
            "engine.broker_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.engine.trade_lock_ttl_secs > self.engine.broker_timeout_secs,
            "engine.trade_lock_ttl_secs must exceed engine.broker_timeout_secs"
        );
        anyhow::ensure!(
            self.engine.min_signal_confidence >= Decimal::ZERO
                && self.engine.min_signal_confidence <= Decimal::ONE,
            "engine.min_signal_confidence must be between 0 and 1"
        );

        anyhow::ensure!(self.risk.max_open_trades >= 1, "risk.max_open_trades must be >= 1");
        anyhow::ensure!(
            self.risk.max_trades_per_symbol >= 1
                && self.risk.max_trades_per_symbol <= self.risk.max_open_trades,
            "risk.max_trades_per_symbol must be >= 1 and <= max_open_trades"
        );
        anyhow::ensure!(
            unit(self.risk.risk_pct_leveraged) && unit(self.risk.risk_pct_binary),
            "risk.risk_pct_* must be between 0 and 1"
        );
        anyhow::ensure!(
            unit(self.risk.binary_safety_haircut),
            "risk.binary_safety_haircut must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.min_stake > Decimal::ZERO && self.risk.min_stake <= self.risk.max_stake,
            "risk.min_stake must be positive and <= max_stake"
        );
        anyhow::ensure!(unit(self.risk.max_stake_pct), "risk.max_stake_pct must be between 0 and 1");
        anyhow::ensure!(
            unit(self.risk.daily_loss_limit_pct),
            "risk.daily_loss_limit_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.exit.extreme_max_duration_secs >= self.exit.max_trade_duration_secs,
            "exit.extreme_max_duration_secs must be >= max_trade_duration_secs"
        );
        anyhow::ensure!(
            self.exit.rsi_oversold < self.exit.rsi_overbought,
            "exit.rsi_oversold must be below exit.rsi_overbought"
        );
        anyhow::ensure!(
            self.exit.default_tp_pct > Decimal::ZERO && self.exit.default_sl_pct > Decimal::ZERO,
            "exit.default_tp_pct and exit.default_sl_pct must be positive"
        );

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            initial_capital: default_initial_capital(),
            broker_timeout_secs: default_broker_timeout(),
            trade_lock_ttl_secs: default_trade_lock_ttl(),
            min_signal_confidence: default_min_signal_confidence(),
            loss_cooldown_secs: default_loss_cooldown(),
            max_consecutive_losses: default_max_consecutive_losses(),
            binary_duration_secs: default_binary_duration(),
            leveraged_multiplier: default_leveraged_multiplier(),
            database_path: default_database_path(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_trades: default_max_open_trades(),
            max_trades_per_symbol: default_max_trades_per_symbol(),
            risk_pct_leveraged: default_risk_pct_leveraged(),
            risk_pct_binary: default_risk_pct_binary(),
            binary_safety_haircut: default_binary_safety_haircut(),
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
            max_stake_pct: default_max_stake_pct(),
            daily_loss_limit_pct: default_daily_loss_limit_pct(),
            daily_loss_limit_enabled: default_daily_loss_limit_enabled(),
            stake_precision: default_stake_precision(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stagnation_duration_secs: default_stagnation_duration(),
            stagnation_min_profit_pct: default_stagnation_min_profit(),
            max_trade_duration_secs: default_max_trade_duration(),
            extreme_max_duration_secs: default_extreme_max_duration(),
            min_trade_duration_secs: default_min_trade_duration(),
            early_exit_fraction: default_early_exit_fraction(),
            min_profit_pct: default_min_profit(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            default_tp_pct: default_tp_pct(),
            default_sl_pct: default_sl_pct(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_stake_bounds() {
        let mut config = Config::default();
        config.risk.min_stake = dec!(200);
        config.risk.max_stake = dec!(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_hard_limit_below_soft_limit() {
        let mut config = Config::default();
        config.exit.max_trade_duration_secs = 3600;
        config.exit.extreme_max_duration_secs = 1800;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "risk": { "max_open_trades": 7 } }"#).unwrap();

        assert_eq!(config.risk.max_open_trades, 7);
        assert_eq!(config.risk.max_trades_per_symbol, 1);
        assert_eq!(config.exit.stagnation_duration(), Duration::minutes(15));
        assert_eq!(config.engine.strategy, "default");
    }
}

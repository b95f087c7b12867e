//! Admission control and stake sizing.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::admission::{AdmissionDecision, DenialReason};
use super::daily::DailyTradingStats;
use crate::config::RiskConfig;
use crate::events::{EngineEvent, EventBus};
use crate::trading::{Trade, TradeMode};
use crate::utils::decimal::truncate_to_precision;

/// Global and per-symbol admission control with a daily loss circuit
/// breaker.
pub struct RiskManager {
    config: RiskConfig,
    daily: Option<DailyTradingStats>,
    events: EventBus,
}

impl RiskManager {
    pub fn new(config: RiskConfig, events: EventBus) -> Self {
        Self {
            config,
            daily: None,
            events,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Replace the risk configuration. Daily statistics are kept.
    pub fn update_config(&mut self, config: RiskConfig) {
        info!(?config, "Risk configuration updated");
        self.config = config;
    }

    pub fn daily_stats(&self) -> Option<&DailyTradingStats> {
        self.daily.as_ref()
    }

    /// Observe the balance on `today`, rolling the daily statistics over
    /// when the date changed.
    pub fn update_balance_on(&mut self, balance: Decimal, today: NaiveDate) {
        let stale = self.daily.as_ref().map_or(true, |d| d.date != today);
        if stale {
            if let Some(previous) = &self.daily {
                info!(
                    date = %previous.date,
                    realized_pnl = %previous.realized_pnl,
                    trades = previous.trades_executed,
                    paused = previous.trades_paused,
                    limit_reached = previous.limit_reached,
                    "Trading day closed"
                );
            }
            debug!(%today, start_balance = %balance, "Starting trading day");
            self.daily = Some(DailyTradingStats::new(today, balance));
        }
    }

    /// Ordered admission pipeline; the first failing check wins:
    /// 1. daily loss circuit breaker
    /// 2. global open-position cap
    /// 3. per-symbol open-position cap
    pub fn can_open_trade<'a, I>(&mut self, asset: &str, positions: I) -> AdmissionDecision
    where
        I: IntoIterator<Item = &'a Trade>,
    {
        let (open, open_for_asset) = positions
            .into_iter()
            .filter(|t| t.is_open())
            .fold((0usize, 0usize), |(all, same), t| {
                (all + 1, same + usize::from(t.asset == asset))
            });

        self.can_open_with_counts(asset, open, open_for_asset)
    }

    /// Same pipeline with position counts supplied by the caller, for
    /// callers that also count entries still awaiting the broker.
    pub fn can_open_with_counts(
        &mut self,
        asset: &str,
        open: usize,
        open_for_asset: usize,
    ) -> AdmissionDecision {
        if let Some(reason) = self.check_daily_limit() {
            if let Some(daily) = self.daily.as_mut() {
                daily.trades_paused += 1;
            }
            return self.deny(asset, reason);
        }
        self.check_caps(asset, open, open_for_asset)
    }

    fn check_caps(&self, asset: &str, open: usize, open_for_asset: usize) -> AdmissionDecision {
        if open >= self.config.max_open_trades {
            return self.deny(
                asset,
                DenialReason::MaxOpenTrades {
                    open,
                    max: self.config.max_open_trades,
                },
            );
        }

        if open_for_asset >= self.config.max_trades_per_symbol {
            return self.deny(
                asset,
                DenialReason::MaxTradesPerSymbol {
                    asset: asset.to_string(),
                    open: open_for_asset,
                    max: self.config.max_trades_per_symbol,
                },
            );
        }

        debug!(%asset, open, open_for_asset, "Trade admitted");
        AdmissionDecision::Allowed
    }

    fn deny(&self, asset: &str, reason: DenialReason) -> AdmissionDecision {
        info!(target: "risk_alert", %asset, %reason, "Trade denied");
        AdmissionDecision::Denied(reason)
    }

    fn check_daily_limit(&mut self) -> Option<DenialReason> {
        if !self.config.daily_loss_limit_enabled {
            return None;
        }
        let limit_pct = self.config.daily_loss_limit_pct;
        let daily = self.daily.as_mut()?;

        if !daily.limit_reached && daily.loss_pct() >= limit_pct {
            daily.limit_reached = true;
            let (loss, start_balance) = (daily.current_loss, daily.start_balance);
            self.latched(loss, start_balance);
        }

        let daily = self.daily.as_ref()?;
        daily.limit_reached.then(|| DenialReason::DailyLossLimit {
            loss_pct: daily.loss_pct(),
            limit_pct,
        })
    }

    fn latched(&self, loss: Decimal, start_balance: Decimal) {
        warn!(
            target: "risk_alert",
            %loss,
            %start_balance,
            limit_pct = %self.config.daily_loss_limit_pct,
            "Daily loss limit reached - new entries halted until tomorrow"
        );
        self.events
            .publish(EngineEvent::DailyLimitReached { loss, start_balance });
    }

    /// Count an executed entry towards today's statistics.
    pub fn record_execution(&mut self) {
        if let Some(daily) = self.daily.as_mut() {
            daily.trades_executed += 1;
        }
    }

    /// Feed a realized result into the loss tracking of `day`.
    ///
    /// `balance_before` is the ledger balance before the result was booked;
    /// it starts the day if `day` has not been observed yet, so a loss is
    /// never dropped or folded into the start balance of a new day.
    /// Returns true if this result tripped the circuit breaker.
    pub fn record_trade_result(&mut self, pnl: Decimal, balance_before: Decimal, day: NaiveDate) -> bool {
        self.update_balance_on(balance_before, day);

        let enabled = self.config.daily_loss_limit_enabled;
        let limit_pct = self.config.daily_loss_limit_pct;
        let Some(daily) = self.daily.as_mut() else {
            return false;
        };

        daily.apply_pnl(pnl);

        if enabled && !daily.limit_reached && daily.loss_pct() >= limit_pct {
            daily.limit_reached = true;
            let (loss, start_balance) = (daily.current_loss, daily.start_balance);
            self.latched(loss, start_balance);
            return true;
        }
        false
    }

    /// Size a stake for `balance`.
    ///
    /// The result is clamped to `[min_stake, min(max_stake_pct * balance,
    /// max_stake)]` and truncated to the currency precision. When the
    /// percentage ceiling is below `min_stake`, the ceiling wins and the
    /// caller must treat the stake as unusable.
    pub fn calculate_stake(&self, mode: TradeMode, balance: Decimal) -> Decimal {
        if balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let raw = match mode {
            TradeMode::Leveraged => balance * self.config.risk_pct_leveraged,
            TradeMode::Binary => {
                balance * self.config.risk_pct_binary * self.config.binary_safety_haircut
            }
        };

        let ceiling = (balance * self.config.max_stake_pct).min(self.config.max_stake);
        let stake = raw.max(self.config.min_stake).min(ceiling);

        truncate_to_precision(stake, self.config.stake_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::{Direction, TradeMetadata};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn manager(config: RiskConfig) -> RiskManager {
        let mut manager = RiskManager::new(config, EventBus::default());
        manager.update_balance_on(dec!(1000), day(1));
        manager
    }

    fn trade(id: &str, asset: &str) -> Trade {
        Trade::new(
            id,
            "default",
            asset,
            Direction::Long,
            TradeMode::Leveraged,
            dec!(100),
            dec!(10),
            Utc::now(),
            TradeMetadata::new(dec!(1), dec!(0.5)),
        )
    }

    #[test]
    fn test_global_cap_denies_and_recovers() {
        let mut risk = manager(RiskConfig {
            max_open_trades: 2,
            max_trades_per_symbol: 2,
            ..Default::default()
        });
        let mut open = vec![trade("a", "R_10"), trade("b", "R_25")];

        let decision = risk.can_open_trade("R_50", &open);
        assert_eq!(
            decision,
            AdmissionDecision::Denied(DenialReason::MaxOpenTrades { open: 2, max: 2 })
        );
        // Repeated checks against unchanged state give the same answer.
        assert!(!risk.can_open_trade("R_50", &open).is_allowed());

        open[0].status = crate::trading::TradeStatus::Closed;
        assert!(risk.can_open_trade("R_50", &open).is_allowed());
    }

    #[test]
    fn test_per_symbol_cap() {
        let mut risk = manager(RiskConfig::default());
        let open = vec![trade("a", "R_75")];

        let decision = risk.can_open_trade("R_75", &open);
        assert!(matches!(
            decision.reason(),
            Some(DenialReason::MaxTradesPerSymbol { open: 1, max: 1, .. })
        ));
        assert!(risk.can_open_trade("R_100", &open).is_allowed());
    }

    #[test]
    fn test_daily_limit_takes_priority_over_caps() {
        let mut risk = manager(RiskConfig {
            max_open_trades: 1,
            ..Default::default()
        });
        risk.record_trade_result(dec!(-60), dec!(1000), day(1));
        let open = vec![trade("a", "R_75")];

        assert!(matches!(
            risk.can_open_trade("R_75", &open).reason(),
            Some(DenialReason::DailyLossLimit { .. })
        ));
        assert_eq!(risk.daily_stats().unwrap().trades_paused, 1);
    }

    #[test]
    fn test_daily_limit_latches_until_rollover() {
        let mut risk = manager(RiskConfig::default());

        assert!(!risk.record_trade_result(dec!(-20), dec!(1000), day(1)));
        assert!(risk.record_trade_result(dec!(-30), dec!(980), day(1)));
        assert!(risk.daily_stats().unwrap().limit_reached);

        // A winning trade on the same day does not clear the latch.
        assert!(!risk.record_trade_result(dec!(45), dec!(950), day(1)));
        risk.update_balance_on(dec!(995), day(1));
        assert!(risk.daily_stats().unwrap().limit_reached);
        assert!(!risk.can_open_trade("R_75", std::iter::empty()).is_allowed());

        risk.update_balance_on(dec!(995), day(2));
        let stats = risk.daily_stats().unwrap();
        assert!(!stats.limit_reached);
        assert_eq!(stats.start_balance, dec!(995));
        assert!(risk.can_open_trade("R_75", std::iter::empty()).is_allowed());
    }

    #[test]
    fn test_loss_before_first_observation_is_counted() {
        let mut risk = RiskManager::new(RiskConfig::default(), EventBus::default());
        assert!(risk.daily_stats().is_none());

        assert!(risk.record_trade_result(dec!(-60), dec!(1000), day(1)));
        let stats = risk.daily_stats().unwrap();
        assert_eq!(stats.start_balance, dec!(1000));
        assert_eq!(stats.current_loss, dec!(60));
        assert!(!risk.can_open_trade("R_10", std::iter::empty()).is_allowed());
    }

    #[test]
    fn test_loss_after_midnight_counts_towards_new_day() {
        let mut risk = manager(RiskConfig::default());
        assert!(!risk.record_trade_result(dec!(-30), dec!(1000), day(1)));

        // First result of day 2 starts the day from the pre-trade balance.
        assert!(risk.record_trade_result(dec!(-50), dec!(970), day(2)));
        let stats = risk.daily_stats().unwrap();
        assert_eq!(stats.date, day(2));
        assert_eq!(stats.start_balance, dec!(970));
        assert_eq!(stats.current_loss, dec!(50));
        assert!(stats.limit_reached);
    }

    #[test]
    fn test_caps_count_supplied_entries() {
        let mut risk = manager(RiskConfig {
            max_open_trades: 1,
            ..Default::default()
        });
        assert!(risk.can_open_with_counts("R_10", 0, 0).is_allowed());
        assert!(matches!(
            risk.can_open_with_counts("R_25", 1, 0).reason(),
            Some(DenialReason::MaxOpenTrades { open: 1, max: 1 })
        ));
    }

    #[test]
    fn test_check_latches_when_threshold_observed() {
        let mut risk = manager(RiskConfig {
            daily_loss_limit_enabled: false,
            ..Default::default()
        });
        risk.record_trade_result(dec!(-80), dec!(1000), day(1));
        assert!(risk.can_open_trade("R_75", std::iter::empty()).is_allowed());

        let mut config = risk.config().clone();
        config.daily_loss_limit_enabled = true;
        risk.update_config(config);

        assert!(!risk.can_open_trade("R_75", std::iter::empty()).is_allowed());
        assert!(risk.daily_stats().unwrap().limit_reached);
    }

    #[test]
    fn test_disabled_limit_never_denies() {
        let mut risk = manager(RiskConfig {
            daily_loss_limit_enabled: false,
            ..Default::default()
        });
        assert!(!risk.record_trade_result(dec!(-500), dec!(1000), day(1)));
        assert!(risk.can_open_trade("R_75", std::iter::empty()).is_allowed());
    }

    #[test]
    fn test_calculate_stake_leveraged() {
        let risk = manager(RiskConfig::default());
        // 2% of 1000 = 20, within [1, min(100, 100)]
        assert_eq!(risk.calculate_stake(TradeMode::Leveraged, dec!(1000)), dec!(20));
        // 2% of 50000 = 1000, capped by max_stake
        assert_eq!(risk.calculate_stake(TradeMode::Leveraged, dec!(50000)), dec!(100));
        // 2% of 20 = 0.4, raised to min_stake 1 which is under the 2.00 ceiling
        assert_eq!(risk.calculate_stake(TradeMode::Leveraged, dec!(20)), dec!(1));
    }

    #[test]
    fn test_calculate_stake_binary_haircut_truncates() {
        let risk = manager(RiskConfig::default());
        // 1% of 1234.56 * 0.95 = 11.72832 -> 11.72
        assert_eq!(risk.calculate_stake(TradeMode::Binary, dec!(1234.56)), dec!(11.72));
    }

    #[test]
    fn test_calculate_stake_respects_pct_ceiling() {
        let risk = manager(RiskConfig::default());
        // Ceiling 10% of 5 = 0.5 is below min_stake; the ceiling wins.
        assert_eq!(risk.calculate_stake(TradeMode::Leveraged, dec!(5)), dec!(0.5));
        assert_eq!(risk.calculate_stake(TradeMode::Leveraged, Decimal::ZERO), Decimal::ZERO);
    }
}

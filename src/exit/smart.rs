use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::config::ExitConfig;
use crate::trading::{Direction, ProtectState, Trade};

/// Why a position should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Small guaranteed gain on a trade going nowhere
    Stagnation,
    /// Protected position fell back below breakeven
    BreakevenProtection,
    /// Soft duration limit reached while not losing
    MaxDuration,
    /// Hard duration limit, regardless of P&L
    ExtremeMaxDuration,
    /// Profit locked ahead of a momentum reversal
    ProfitReversal,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stagnation => "stagnation",
            ExitReason::BreakevenProtection => "breakeven_protection",
            ExitReason::MaxDuration => "max_duration",
            ExitReason::ExtremeMaxDuration => "extreme_max_duration",
            ExitReason::ProfitReversal => "profit_reversal",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation. Produced fresh on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub reason: Option<ExitReason>,
    pub contract_id: String,
    /// Unrealized move in percent units
    pub profit_pct: Decimal,
    pub time_in_trade: Duration,
    /// Protect state after this evaluation; merge it into the position
    pub protect: ProtectState,
}

impl ExitDecision {
    fn hold(trade: &Trade, profit_pct: Decimal, time_in_trade: Duration, protect: ProtectState) -> Self {
        Self {
            should_exit: false,
            reason: None,
            contract_id: trade.contract_id.clone(),
            profit_pct,
            time_in_trade,
            protect,
        }
    }

    fn exit(self, reason: ExitReason) -> Self {
        Self {
            should_exit: true,
            reason: Some(reason),
            ..self
        }
    }
}

/// Stateless exit rule evaluator.
#[derive(Debug, Clone)]
pub struct SmartExitManager {
    config: ExitConfig,
}

impl SmartExitManager {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Decide whether `trade` should be closed at `price`.
    ///
    /// Rule order:
    /// - 0A stagnation: old enough and slightly in profit
    /// - 0B breakeven protection: latch once profit reaches the stop-loss
    ///   distance, then exit if profit turns negative
    /// - 1A soft max duration while not losing
    /// - 1B hard max duration
    /// - 2 profit with momentum reversal
    ///
    /// The trade is never mutated; the resulting protect state is returned
    /// in the decision.
    pub fn evaluate_exit(
        &self,
        trade: &Trade,
        price: Decimal,
        now: DateTime<Utc>,
        rsi: Option<Decimal>,
    ) -> ExitDecision {
        let profit_pct = trade.profit_pct(price);
        let time_in_trade = trade.time_in_trade(now);
        let cfg = &self.config;

        let mut protect = trade.metadata.protect;
        if !protect.is_protected() && profit_pct >= trade.metadata.sl_pct {
            protect = ProtectState::Protected { activated_at: now };
            info!(
                contract_id = %trade.contract_id,
                asset = %trade.asset,
                profit_pct = %profit_pct,
                "Breakeven protection activated"
            );
        }

        let decision = ExitDecision::hold(trade, profit_pct, time_in_trade, protect);

        let reason = if time_in_trade >= cfg.stagnation_duration()
            && profit_pct >= cfg.stagnation_min_profit_pct
        {
            Some(ExitReason::Stagnation)
        } else if protect.is_protected() && profit_pct < Decimal::ZERO {
            Some(ExitReason::BreakevenProtection)
        } else if time_in_trade >= cfg.max_trade_duration() && profit_pct >= Decimal::ZERO {
            Some(ExitReason::MaxDuration)
        } else if time_in_trade >= cfg.extreme_max_duration() {
            Some(ExitReason::ExtremeMaxDuration)
        } else if self.is_profit_reversal(trade, profit_pct, time_in_trade, rsi) {
            Some(ExitReason::ProfitReversal)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!(
                    contract_id = %trade.contract_id,
                    %reason,
                    profit_pct = %profit_pct,
                    secs_in_trade = time_in_trade.num_seconds(),
                    "Exit rule matched"
                );
                decision.exit(reason)
            }
            None => decision,
        }
    }

    fn is_profit_reversal(
        &self,
        trade: &Trade,
        profit_pct: Decimal,
        time_in_trade: Duration,
        rsi: Option<Decimal>,
    ) -> bool {
        let cfg = &self.config;
        let Some(rsi) = rsi else {
            return false;
        };

        let target = trade.metadata.tp_pct * cfg.early_exit_fraction;
        if profit_pct < target || profit_pct <= cfg.min_profit_pct {
            return false;
        }
        if time_in_trade < cfg.min_trade_duration() {
            return false;
        }

        match trade.direction {
            Direction::Long => rsi >= cfg.rsi_overbought,
            Direction::Short => rsi <= cfg.rsi_oversold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::{TradeMetadata, TradeMode};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn opened_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn trade(direction: Direction) -> Trade {
        Trade::new(
            "c-42",
            "default",
            "R_75",
            direction,
            TradeMode::Leveraged,
            dec!(1000),
            dec!(10),
            opened_at(),
            TradeMetadata::new(dec!(1), dec!(0.5)),
        )
    }

    fn after(minutes: i64) -> DateTime<Utc> {
        opened_at() + Duration::minutes(minutes)
    }

    fn manager() -> SmartExitManager {
        SmartExitManager::new(ExitConfig::default())
    }

    #[test]
    fn test_stagnation_exit_wins_over_other_rules() {
        let mut t = trade(Direction::Long);
        t.metadata.protect = ProtectState::Protected { activated_at: after(1) };

        // 16 minutes in, +0.2%, RSI overbought: stagnation still comes first.
        let decision = manager().evaluate_exit(&t, dec!(1002), after(16), Some(dec!(85)));

        assert!(decision.should_exit);
        assert_eq!(decision.reason, Some(ExitReason::Stagnation));
        assert_eq!(decision.profit_pct, dec!(0.2));
        assert_eq!(decision.time_in_trade, Duration::minutes(16));
    }

    #[test]
    fn test_no_rule_matches_for_young_flat_trade() {
        let decision = manager().evaluate_exit(&trade(Direction::Long), dec!(1001), after(3), None);

        assert!(!decision.should_exit);
        assert_eq!(decision.reason, None);
        assert_eq!(decision.protect, ProtectState::Normal);
    }

    #[test]
    fn test_protect_latches_then_exits_below_breakeven() {
        let exit = manager();
        let mut t = trade(Direction::Long);

        let first = exit.evaluate_exit(&t, dec!(1006), after(2), None);
        assert!(!first.should_exit);
        assert_eq!(first.protect, ProtectState::Protected { activated_at: after(2) });

        t.metadata.protect = t.metadata.protect.merge(first.protect);

        // Still in profit: no exit, latch keeps its original time.
        let second = exit.evaluate_exit(&t, dec!(1001), after(4), None);
        assert!(!second.should_exit);
        assert_eq!(second.protect, first.protect);

        let third = exit.evaluate_exit(&t, dec!(999), after(5), None);
        assert!(third.should_exit);
        assert_eq!(third.reason, Some(ExitReason::BreakevenProtection));
    }

    #[test]
    fn test_unprotected_loss_is_held() {
        let decision = manager().evaluate_exit(&trade(Direction::Long), dec!(995), after(5), None);
        assert!(!decision.should_exit);
    }

    #[test]
    fn test_soft_max_duration_requires_non_negative_profit() {
        let exit = manager();
        let t = trade(Direction::Short);

        let flat = exit.evaluate_exit(&t, dec!(1000), after(31), None);
        assert_eq!(flat.reason, Some(ExitReason::MaxDuration));

        let losing = exit.evaluate_exit(&t, dec!(1003), after(31), None);
        assert!(!losing.should_exit);
    }

    #[test]
    fn test_extreme_max_duration_is_unconditional() {
        let decision = manager().evaluate_exit(&trade(Direction::Long), dec!(980), after(61), None);
        assert_eq!(decision.reason, Some(ExitReason::ExtremeMaxDuration));
    }

    #[test]
    fn test_profit_reversal_is_direction_dependent() {
        let exit = manager();

        // +0.8% >= 1% * 0.7, 5 minutes in, below the stagnation window.
        let long = exit.evaluate_exit(&trade(Direction::Long), dec!(1008), after(5), Some(dec!(72)));
        assert_eq!(long.reason, Some(ExitReason::ProfitReversal));

        let long_no_reversal =
            exit.evaluate_exit(&trade(Direction::Long), dec!(1008), after(5), Some(dec!(25)));
        assert!(!long_no_reversal.should_exit);

        let short = exit.evaluate_exit(&trade(Direction::Short), dec!(992), after(5), Some(dec!(28)));
        assert_eq!(short.reason, Some(ExitReason::ProfitReversal));
    }

    #[test]
    fn test_profit_reversal_waits_for_min_duration_and_rsi() {
        let exit = manager();
        let t = trade(Direction::Long);

        assert!(!exit.evaluate_exit(&t, dec!(1008), after(1), Some(dec!(80))).should_exit);
        assert!(!exit.evaluate_exit(&t, dec!(1008), after(5), None).should_exit);
    }
}

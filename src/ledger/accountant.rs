//! Per-strategy capital ledger.
//!
//! All mutations go through one mutex, so concurrent reservations from
//! different assets never observe a stale available balance. The mutex is
//! never held across an await point.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::account::{AccountStats, RiskContext, StrategyAccount};
use super::snapshot::LedgerSnapshot;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::trading::TradeRecord;

pub struct StrategyAccountant {
    accounts: Mutex<HashMap<String, StrategyAccount>>,
    events: EventBus,
}

impl StrategyAccountant {
    pub fn new(events: EventBus) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Rebuild a ledger from a snapshot, verbatim.
    pub fn from_snapshot(snapshot: LedgerSnapshot, events: EventBus) -> Self {
        let accountant = Self::new(events);
        accountant.restore(snapshot);
        accountant
    }

    pub fn from_json(json: &str, events: EventBus) -> EngineResult<Self> {
        Ok(Self::from_snapshot(LedgerSnapshot::from_json(json)?, events))
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<String, StrategyAccount>> {
        // Every mutation completes before its guard drops, so a poisoned
        // lock still holds consistent data.
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Add capital to a strategy, creating its account if needed.
    ///
    /// Returns the new balance.
    pub fn allocate(&self, strategy: &str, amount: Decimal) -> EngineResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                strategy: strategy.to_string(),
                amount,
            });
        }

        let balance = {
            let mut accounts = self.accounts();
            match accounts.get_mut(strategy) {
                Some(account) => {
                    account.deposit(amount);
                    account.balance
                }
                None => {
                    accounts.insert(strategy.to_string(), StrategyAccount::new(strategy, amount));
                    amount
                }
            }
        };

        info!(%strategy, %amount, %balance, "Capital allocated");
        self.events.publish(EngineEvent::BalanceUpdated {
            strategy: strategy.to_string(),
            balance,
            pnl: Decimal::ZERO,
        });
        Ok(balance)
    }

    pub fn has_strategy(&self, strategy: &str) -> bool {
        self.accounts().contains_key(strategy)
    }

    pub fn get_balance(&self, strategy: &str) -> Option<Decimal> {
        self.accounts().get(strategy).map(|a| a.balance)
    }

    pub fn get_available_balance(&self, strategy: &str) -> Option<Decimal> {
        self.accounts().get(strategy).map(|a| a.available())
    }

    /// Hold `amount` of a strategy's capital for a position.
    ///
    /// Returns `false` when the capital is not available; this is an
    /// expected outcome, not an error.
    pub fn reserve_stake(&self, strategy: &str, amount: Decimal) -> bool {
        if amount <= Decimal::ZERO {
            warn!(%strategy, %amount, "Refusing to reserve non-positive stake");
            return false;
        }

        let mut accounts = self.accounts();
        let Some(account) = accounts.get_mut(strategy) else {
            warn!(%strategy, %amount, "Reservation against unknown strategy");
            return false;
        };

        if account.try_reserve(amount) {
            debug!(
                %strategy,
                %amount,
                reserved = %account.reserved,
                available = %account.available(),
                "Stake reserved"
            );
            true
        } else {
            info!(
                %strategy,
                %amount,
                available = %account.available(),
                "Insufficient available capital for reservation"
            );
            false
        }
    }

    /// Release a reservation. Floored at zero, so a double release is
    /// harmless.
    pub fn release_stake(&self, strategy: &str, amount: Decimal) {
        let mut accounts = self.accounts();
        if let Some(account) = accounts.get_mut(strategy) {
            account.release(amount);
            debug!(%strategy, %amount, reserved = %account.reserved, "Stake released");
        }
    }

    /// Apply a realized trade to a strategy's balance and history.
    ///
    /// Returns the new balance.
    pub fn record_trade(&self, strategy: &str, record: TradeRecord) -> EngineResult<Decimal> {
        let pnl = record.pnl;
        let (balance, drawdown) = {
            let mut accounts = self.accounts();
            let account = accounts
                .get_mut(strategy)
                .ok_or_else(|| EngineError::StrategyNotFound(strategy.to_string()))?;
            account.apply_trade(record.clone());
            (account.balance, account.drawdown.current_drawdown)
        };

        info!(
            %strategy,
            contract_id = %record.contract_id,
            %pnl,
            %balance,
            %drawdown,
            "Trade recorded"
        );

        self.events.publish(EngineEvent::TradeRecorded {
            strategy: strategy.to_string(),
            record,
        });
        self.events.publish(EngineEvent::BalanceUpdated {
            strategy: strategy.to_string(),
            balance,
            pnl,
        });
        Ok(balance)
    }

    pub fn get_risk_context(&self, strategy: &str) -> Option<RiskContext> {
        self.accounts().get(strategy).map(|a| RiskContext {
            available_balance: a.available(),
            open_positions: a.open_positions,
            daily_pnl: a.daily_pnl,
        })
    }

    pub fn get_stats(&self, strategy: &str) -> Option<AccountStats> {
        self.accounts().get(strategy).map(StrategyAccount::stats)
    }

    pub fn all_stats(&self) -> Vec<AccountStats> {
        let mut stats: Vec<_> = self.accounts().values().map(StrategyAccount::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn get_trade_history(&self, strategy: &str) -> Vec<TradeRecord> {
        self.accounts()
            .get(strategy)
            .map(|a| a.history.clone())
            .unwrap_or_default()
    }

    pub fn remove_strategy(&self, strategy: &str) -> Option<StrategyAccount> {
        let removed = self.accounts().remove(strategy);
        if removed.is_some() {
            info!(%strategy, "Strategy account removed");
        }
        removed
    }

    /// Drop every reservation. Used once at startup, before positions are
    /// re-reserved from the broker's authoritative list.
    pub fn clear_reservations(&self) {
        let mut accounts = self.accounts();
        for account in accounts.values_mut() {
            if account.reserved > Decimal::ZERO || account.open_positions > 0 {
                debug!(
                    strategy = %account.name,
                    reserved = %account.reserved,
                    "Clearing restored reservation"
                );
            }
            account.reserved = Decimal::ZERO;
            account.open_positions = 0;
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let strategies: BTreeMap<_, _> = self
            .accounts()
            .iter()
            .map(|(name, account)| (name.clone(), account.clone()))
            .collect();
        LedgerSnapshot::new(strategies)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        self.snapshot().to_json()
    }

    /// Replace the whole ledger with the snapshot's accounts.
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        let count = snapshot.strategies.len();
        *self.accounts() = snapshot.strategies.into_iter().collect();
        info!(strategies = count, saved_at = %snapshot.timestamp, "Ledger restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::{Direction, TradeMode};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn accountant_with(balance: Decimal) -> StrategyAccountant {
        let accountant = StrategyAccountant::new(EventBus::default());
        accountant.allocate("alpha", balance).unwrap();
        accountant
    }

    fn record(id: &str, pnl: Decimal) -> TradeRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        TradeRecord {
            contract_id: id.to_string(),
            strategy: "alpha".to_string(),
            asset: "R_75".to_string(),
            direction: Direction::Long,
            mode: TradeMode::Leveraged,
            stake: dec!(10),
            entry_price: dec!(100),
            exit_price: Some(dec!(101)),
            pnl,
            opened_at: at,
            closed_at: at,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_allocate_rejects_non_positive_amount() {
        let accountant = StrategyAccountant::new(EventBus::default());

        assert!(matches!(
            accountant.allocate("alpha", Decimal::ZERO),
            Err(EngineError::InvalidAmount { .. })
        ));
        assert!(accountant.allocate("alpha", dec!(-5)).is_err());
        assert!(!accountant.has_strategy("alpha"));
    }

    #[test]
    fn test_allocate_adds_to_existing_balance() {
        let accountant = accountant_with(dec!(1000));
        assert_eq!(accountant.allocate("alpha", dec!(500)).unwrap(), dec!(1500));

        let stats = accountant.get_stats("alpha").unwrap();
        assert_eq!(stats.initial_balance, dec!(1500));
        assert_eq!(stats.peak_balance, dec!(1500));
    }

    #[test]
    fn test_drawdown_example_sequence() {
        let accountant = accountant_with(dec!(1000));

        accountant.record_trade("alpha", record("c1", dec!(100))).unwrap();
        let stats = accountant.get_stats("alpha").unwrap();
        assert_eq!(stats.balance, dec!(1100));
        assert_eq!(stats.peak_balance, dec!(1100));

        accountant.record_trade("alpha", record("c2", dec!(-200))).unwrap();
        let after_loss = accountant.get_stats("alpha").unwrap();
        assert_eq!(after_loss.balance, dec!(900));
        assert!(after_loss.max_drawdown > dec!(0.1818) && after_loss.max_drawdown < dec!(0.1819));

        accountant.record_trade("alpha", record("c3", dec!(50))).unwrap();
        let after_recovery = accountant.get_stats("alpha").unwrap();
        assert_eq!(after_recovery.balance, dec!(950));
        assert_eq!(after_recovery.max_drawdown, after_loss.max_drawdown);
        assert_eq!(after_recovery.trades, 3);
        assert_eq!(after_recovery.wins, 2);
    }

    #[test]
    fn test_balance_is_floored_at_zero() {
        let accountant = accountant_with(dec!(100));

        accountant.record_trade("alpha", record("c1", dec!(-250))).unwrap();
        assert_eq!(accountant.get_balance("alpha"), Some(Decimal::ZERO));

        accountant.record_trade("alpha", record("c2", dec!(-1))).unwrap();
        assert_eq!(accountant.get_balance("alpha"), Some(Decimal::ZERO));
    }

    #[test]
    fn test_record_trade_unknown_strategy_fails() {
        let accountant = accountant_with(dec!(100));
        let err = accountant.record_trade("ghost", record("c1", dec!(5))).unwrap_err();
        assert!(matches!(err, EngineError::StrategyNotFound(name) if name == "ghost"));
    }

    #[test]
    fn test_reservation_example() {
        let accountant = accountant_with(dec!(1000));

        assert!(accountant.reserve_stake("alpha", dec!(50)));
        assert!(!accountant.reserve_stake("alpha", dec!(1500)));
        assert_eq!(accountant.get_available_balance("alpha"), Some(dec!(950)));
    }

    #[test]
    fn test_reservation_never_exceeds_available() {
        let accountant = accountant_with(dec!(100));

        assert!(accountant.reserve_stake("alpha", dec!(60)));
        assert!(!accountant.reserve_stake("alpha", dec!(41)));
        assert!(accountant.reserve_stake("alpha", dec!(40)));
        assert_eq!(accountant.get_available_balance("alpha"), Some(Decimal::ZERO));
        assert!(!accountant.reserve_stake("alpha", dec!(0.01)));
    }

    #[test]
    fn test_reserve_rejects_unknown_strategy_and_bad_amounts() {
        let accountant = accountant_with(dec!(100));
        assert!(!accountant.reserve_stake("ghost", dec!(1)));
        assert!(!accountant.reserve_stake("alpha", Decimal::ZERO));
        assert!(!accountant.reserve_stake("alpha", dec!(-3)));
    }

    #[test]
    fn test_double_release_is_floored() {
        let accountant = accountant_with(dec!(100));
        assert!(accountant.reserve_stake("alpha", dec!(30)));

        accountant.release_stake("alpha", dec!(30));
        accountant.release_stake("alpha", dec!(30));

        let stats = accountant.get_stats("alpha").unwrap();
        assert_eq!(stats.reserved, Decimal::ZERO);
        assert_eq!(stats.open_positions, 0);
        assert_eq!(stats.available, dec!(100));
    }

    #[test]
    fn test_risk_context_view() {
        let accountant = accountant_with(dec!(1000));
        assert!(accountant.reserve_stake("alpha", dec!(20)));
        accountant.record_trade("alpha", record("c1", dec!(-10))).unwrap();

        let ctx = accountant.get_risk_context("alpha").unwrap();
        assert_eq!(ctx.available_balance, dec!(970));
        assert_eq!(ctx.open_positions, 1);
        assert_eq!(ctx.daily_pnl, dec!(-10));
        assert!(accountant.get_risk_context("ghost").is_none());
    }

    #[test]
    fn test_daily_pnl_resets_on_new_day() {
        let accountant = accountant_with(dec!(1000));
        accountant.record_trade("alpha", record("c1", dec!(-10))).unwrap();

        let mut next_day = record("c2", dec!(4));
        next_day.closed_at = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        accountant.record_trade("alpha", next_day).unwrap();

        assert_eq!(accountant.get_stats("alpha").unwrap().daily_pnl, dec!(4));
    }

    #[tokio::test]
    async fn test_record_trade_emits_events() {
        let accountant = accountant_with(dec!(1000));
        let mut rx = accountant.subscribe();

        accountant.record_trade("alpha", record("c1", dec!(25))).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.name(), "trade:recorded");
        assert!(matches!(
            second,
            EngineEvent::BalanceUpdated { balance, .. } if balance == dec!(1025)
        ));
    }

    #[test]
    fn test_snapshot_restores_verbatim() {
        let accountant = accountant_with(dec!(1000));
        accountant.record_trade("alpha", record("c1", dec!(100))).unwrap();
        accountant.record_trade("alpha", record("c2", dec!(-200))).unwrap();
        assert!(accountant.reserve_stake("alpha", dec!(15)));

        let json = accountant.to_json().unwrap();
        let restored = StrategyAccountant::from_json(&json, EventBus::default()).unwrap();

        assert_eq!(restored.get_stats("alpha"), accountant.get_stats("alpha"));
        assert_eq!(restored.get_trade_history("alpha").len(), 2);
    }

    #[test]
    fn test_clear_reservations() {
        let accountant = accountant_with(dec!(1000));
        assert!(accountant.reserve_stake("alpha", dec!(15)));

        accountant.clear_reservations();
        let ctx = accountant.get_risk_context("alpha").unwrap();
        assert_eq!(ctx.available_balance, dec!(1000));
        assert_eq!(ctx.open_positions, 0);
    }

    #[test]
    fn test_remove_strategy() {
        let accountant = accountant_with(dec!(1000));
        assert!(accountant.remove_strategy("alpha").is_some());
        assert!(accountant.get_balance("alpha").is_none());
        assert!(accountant.remove_strategy("alpha").is_none());
    }
}

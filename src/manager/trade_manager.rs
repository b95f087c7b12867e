//! Position authority and lifecycle orchestration.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::assets::{AssetState, AssetTable, LockToken};
use super::reconcile::{recover_position, ReconciliationReport, RecoveryDefaults};
use crate::broker::{Broker, TradeRequest};
use crate::config::{Config, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exit::{ExitDecision, ExitReason, SmartExitManager};
use crate::ledger::{AccountStats, StrategyAccountant};
use crate::risk::{AdmissionDecision, DailyTradingStats, DenialReason, RiskManager};
use crate::trading::{MarketTick, Signal, Trade, TradeMetadata, TradeMode, TradeRecord, TradeStatus};

/// Result of handling a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened(Trade),
    /// Expected refusal; nothing was reserved or sent to the broker.
    Rejected(DenialReason),
}

/// Tracked positions. Contracts being closed stay in `open` so caps keep
/// counting them, and are listed in `closing` to refuse a second close.
/// Admitted entries still awaiting the broker are counted per asset in
/// `pending`.
#[derive(Debug, Default)]
struct Book {
    open: HashMap<String, Trade>,
    closing: HashSet<String>,
    pending: HashMap<String, usize>,
}

impl Book {
    fn counts(&self, asset: &str) -> (usize, usize) {
        let (open, open_for_asset) = self
            .open
            .values()
            .filter(|t| t.is_open())
            .fold((0usize, 0usize), |(all, same), t| {
                (all + 1, same + usize::from(t.asset == asset))
            });
        let pending: usize = self.pending.values().sum();
        let pending_for_asset = self.pending.get(asset).copied().unwrap_or(0);
        (open + pending, open_for_asset + pending_for_asset)
    }
}

/// Admission slot held from the cap check until the entry is registered
/// or abandoned.
struct PendingEntry<'a> {
    book: &'a Mutex<Book>,
    asset: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = book.pending.get_mut(&self.asset) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                book.pending.remove(&self.asset);
            }
        }
    }
}

/// Snapshot of the manager for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub reconciled: bool,
    pub open_trades: usize,
    pub closed_trades: usize,
    pub realized_pnl: Decimal,
    pub account: Option<AccountStats>,
    pub daily: Option<DailyTradingStats>,
}

/// Owns the authoritative in-memory position set.
///
/// Admission control is refused until [`TradeManager::start`] has
/// reconciled the set against the broker.
pub struct TradeManager {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    accountant: Arc<StrategyAccountant>,
    risk: Mutex<RiskManager>,
    exit: SmartExitManager,
    book: Mutex<Book>,
    history: Mutex<Vec<TradeRecord>>,
    assets: AssetTable,
    events: EventBus,
    recovery: RecoveryDefaults,
    reconciled: AtomicBool,
    /// Latest tick time; falls back to wall time before the first tick
    market_clock: Mutex<Option<DateTime<Utc>>>,
}

impl TradeManager {
    pub fn new(
        config: &Config,
        broker: Arc<dyn Broker>,
        accountant: Arc<StrategyAccountant>,
        events: EventBus,
    ) -> Self {
        let recovery = RecoveryDefaults {
            strategy: config.engine.strategy.clone(),
            tp_pct: config.exit.default_tp_pct,
            sl_pct: config.exit.default_sl_pct,
            binary_duration: secs(config.engine.binary_duration_secs),
        };

        Self {
            config: config.engine.clone(),
            broker,
            accountant,
            risk: Mutex::new(RiskManager::new(config.risk.clone(), events.clone())),
            exit: SmartExitManager::new(config.exit.clone()),
            book: Mutex::new(Book::default()),
            history: Mutex::new(Vec::new()),
            assets: AssetTable::new(&config.engine),
            events,
            recovery,
            reconciled: AtomicBool::new(false),
            market_clock: Mutex::new(None),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn risk(&self) -> MutexGuard<'_, RiskManager> {
        self.risk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn history(&self) -> MutexGuard<'_, Vec<TradeRecord>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accountant(&self) -> &Arc<StrategyAccountant> {
        &self.accountant
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::Acquire)
    }

    fn market_now(&self) -> DateTime<Utc> {
        self.market_clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(Utc::now)
    }

    fn advance_clock(&self, at: DateTime<Utc>) {
        let mut clock = self.market_clock.lock().unwrap_or_else(PoisonError::into_inner);
        *clock = Some(clock.map_or(at, |current| current.max(at)));
    }

    async fn with_timeout<T, F>(&self, operation: &'static str, call: F) -> EngineResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let timeout = Duration::from_secs(self.config.broker_timeout_secs);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(EngineError::Broker(e)),
            Err(_) => Err(EngineError::BrokerTimeout { operation, timeout }),
        }
    }

    /// Rebuild the tracked set from the broker's open positions.
    ///
    /// Idempotent: positions already tracked are left untouched, so calling
    /// this again never duplicates a contract or its reservation. The first
    /// call also discards reservations restored from a ledger snapshot,
    /// since the broker list is the authority on what is open.
    pub async fn start(&self) -> EngineResult<ReconciliationReport> {
        let positions = self
            .with_timeout("get_open_positions", self.broker.get_open_positions())
            .await?;

        let strategy = self.recovery.strategy.as_str();
        if !self.accountant.has_strategy(strategy) {
            self.accountant.allocate(strategy, self.config.initial_capital)?;
        }
        self.observe_balance(strategy);

        let first_start = !self.is_reconciled();
        let now = Utc::now();
        let mut report = ReconciliationReport {
            timestamp: now,
            ..Default::default()
        };
        let mut registered = Vec::new();

        {
            let mut book = self.book();

            if first_start {
                self.accountant.clear_reservations();
                for trade in book.open.values_mut() {
                    trade.metadata.reserved = self.reserve_for(trade);
                }
            }

            for position in &positions {
                if book.open.contains_key(&position.contract_id) {
                    report.already_tracked += 1;
                    continue;
                }
                let Some(recovered) = recover_position(position, &self.recovery, now) else {
                    report.skipped += 1;
                    continue;
                };
                if recovered.timestamp_fallback {
                    report.timestamp_fallbacks += 1;
                }

                let mut trade = recovered.trade;
                trade.metadata.reserved = self.reserve_for(&trade);
                book.open.insert(trade.contract_id.clone(), trade.clone());
                registered.push(trade);
                report.recovered += 1;
            }
        }

        for trade in registered {
            self.events.publish(EngineEvent::TradeRegistered { trade });
        }
        self.reconciled.store(true, Ordering::Release);

        info!(
            broker_positions = positions.len(),
            recovered = report.recovered,
            already_tracked = report.already_tracked,
            skipped = report.skipped,
            timestamp_fallbacks = report.timestamp_fallbacks,
            "Positions reconciled with broker"
        );
        Ok(report)
    }

    fn reserve_for(&self, trade: &Trade) -> bool {
        if trade.stake <= Decimal::ZERO {
            return false;
        }
        let reserved = self.accountant.reserve_stake(&trade.strategy, trade.stake);
        if !reserved {
            warn!(
                target: "risk_alert",
                contract_id = %trade.contract_id,
                strategy = %trade.strategy,
                stake = %trade.stake,
                "Broker position exceeds available capital - tracked without reservation"
            );
        }
        reserved
    }

    /// Feed the strategy's ledger balance to the daily statistics, dated by
    /// the market clock.
    fn observe_balance(&self, strategy: &str) {
        if let Some(balance) = self.accountant.get_balance(strategy) {
            let today = self.market_now().date_naive();
            self.risk().update_balance_on(balance, today);
        }
    }

    /// Admission check for the configured strategy.
    pub fn can_open_trade(&self, asset: &str) -> AdmissionDecision {
        let book = self.book();
        self.evaluate_admission(&book, asset, &self.config.strategy)
    }

    /// Admit an entry and hold a cap slot for it. The check and the slot
    /// are taken under one book lock, so concurrent signals on different
    /// assets cannot both fill the last slot.
    fn admit_entry(&self, asset: &str, strategy: &str) -> Result<PendingEntry<'_>, DenialReason> {
        let mut book = self.book();
        if let AdmissionDecision::Denied(reason) = self.evaluate_admission(&book, asset, strategy) {
            return Err(reason);
        }
        *book.pending.entry(asset.to_string()).or_insert(0) += 1;
        Ok(PendingEntry {
            book: &self.book,
            asset: asset.to_string(),
        })
    }

    fn evaluate_admission(&self, book: &Book, asset: &str, strategy: &str) -> AdmissionDecision {
        if !self.is_reconciled() {
            warn!(target: "risk_alert", %asset, "Admission requested before reconciliation");
            return AdmissionDecision::Denied(DenialReason::NotReconciled);
        }

        if self.accountant.get_risk_context(strategy).is_none() {
            return AdmissionDecision::Denied(DenialReason::UnknownStrategy {
                strategy: strategy.to_string(),
            });
        }
        self.observe_balance(strategy);

        let (open, open_for_asset) = book.counts(asset);
        let decision = self.risk().can_open_with_counts(asset, open, open_for_asset);
        if !decision.is_allowed() {
            return decision;
        }

        if let Some(until) = self.assets.cooldown_until(asset, self.market_now()) {
            debug!(%asset, %until, "Asset cooling down");
            return AdmissionDecision::Denied(DenialReason::AssetCooldown {
                asset: asset.to_string(),
                until,
            });
        }
        decision
    }

    /// Track a position. Returns `false` if the contract is already tracked.
    pub fn register_trade(&self, trade: Trade) -> bool {
        {
            let mut book = self.book();
            if book.open.contains_key(&trade.contract_id) {
                warn!(contract_id = %trade.contract_id, "Contract already tracked");
                return false;
            }
            book.open.insert(trade.contract_id.clone(), trade.clone());
        }

        info!(
            contract_id = %trade.contract_id,
            asset = %trade.asset,
            direction = %trade.direction,
            mode = %trade.mode,
            stake = %trade.stake,
            entry_price = %trade.entry_price,
            "Trade registered"
        );
        self.events.publish(EngineEvent::TradeRegistered { trade });
        true
    }

    /// Open positions, oldest first.
    pub fn get_open_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.book().open.values().cloned().collect();
        trades.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.contract_id.cmp(&b.contract_id)));
        trades
    }

    /// Positions closed during this process lifetime.
    pub fn get_trade_history(&self) -> Vec<TradeRecord> {
        self.history().clone()
    }

    /// Take the advisory lock for `asset`. Returns `None` while another
    /// signal for the asset is in flight.
    pub fn acquire_trade_lock(&self, asset: &str) -> Option<LockToken> {
        self.assets.lock_detached(asset)
    }

    /// Release a lock taken with [`TradeManager::acquire_trade_lock`].
    pub fn release_trade_lock(&self, asset: &str, token: LockToken) -> bool {
        self.assets.unlock(asset, token)
    }

    pub fn asset_state(&self, asset: &str) -> Option<AssetState> {
        self.assets.get(asset)
    }

    /// Turn a signal into a position.
    ///
    /// The asset lock is held across admission, reservation and the broker
    /// round trip. Broker failures and timeouts fail closed: the
    /// reservation and the lock are both released before the error is
    /// returned.
    pub async fn open_position(&self, signal: &Signal) -> EngineResult<OpenOutcome> {
        let asset = signal.asset.as_str();
        let strategy = signal.strategy.as_str();

        let Some(_lock) = self.assets.try_lock(asset) else {
            info!(%asset, "Signal dropped - trade already in progress");
            return Ok(OpenOutcome::Rejected(DenialReason::TradeInProgress {
                asset: asset.to_string(),
            }));
        };

        if signal.confidence < self.config.min_signal_confidence {
            debug!(%asset, confidence = %signal.confidence, "Signal below confidence threshold");
            return Ok(OpenOutcome::Rejected(DenialReason::LowConfidence {
                confidence: signal.confidence,
                min: self.config.min_signal_confidence,
            }));
        }

        let _slot = match self.admit_entry(asset, strategy) {
            Ok(slot) => slot,
            Err(reason) => return Ok(OpenOutcome::Rejected(reason)),
        };

        let available = self
            .accountant
            .get_risk_context(strategy)
            .map(|context| context.available_balance)
            .ok_or_else(|| EngineError::StrategyNotFound(strategy.to_string()))?;

        let (stake, min_stake) = {
            let risk = self.risk();
            (risk.calculate_stake(signal.mode, available), risk.config().min_stake)
        };
        if stake < min_stake {
            info!(%asset, %stake, %available, "Sized stake below broker minimum");
            return Ok(OpenOutcome::Rejected(DenialReason::StakeBelowMinimum { stake, min: min_stake }));
        }

        if !self.accountant.reserve_stake(strategy, stake) {
            return Ok(OpenOutcome::Rejected(DenialReason::InsufficientCapital { stake, available }));
        }

        let request = TradeRequest {
            asset: asset.to_string(),
            direction: signal.direction,
            mode: signal.mode,
            stake,
            multiplier: (signal.mode == TradeMode::Leveraged).then_some(self.config.leveraged_multiplier),
            duration_secs: (signal.mode == TradeMode::Binary).then_some(self.config.binary_duration_secs),
        };

        let report = match self
            .with_timeout("execute_trade", self.broker.execute_trade(&request))
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.accountant.release_stake(strategy, stake);
                error!(
                    %asset,
                    %stake,
                    error = %e,
                    "Trade execution failed - reservation released"
                );
                return Err(e);
            }
        };

        let exit_cfg = self.exit.config();
        let mut metadata = TradeMetadata::new(
            signal.tp_pct.unwrap_or(exit_cfg.default_tp_pct),
            signal.sl_pct.unwrap_or(exit_cfg.default_sl_pct),
        );
        metadata.contract_type = Some(request.contract_type().to_string());
        metadata.reserved = true;

        let mut trade = Trade::new(
            report.contract_id,
            strategy,
            asset,
            signal.direction,
            signal.mode,
            report.entry_price,
            stake,
            report.purchase_time,
            metadata,
        );
        if signal.mode == TradeMode::Binary {
            let expiry = report
                .expires_at
                .unwrap_or(report.purchase_time + secs(self.config.binary_duration_secs));
            trade = trade.with_expiry(expiry);
        }

        self.risk().record_execution();
        if !self.register_trade(trade.clone()) {
            // The broker reused an id we already track; keep the capital
            // accounted once.
            self.accountant.release_stake(strategy, stake);
        }
        Ok(OpenOutcome::Opened(trade))
    }

    /// Process a price update for one asset.
    ///
    /// Anchors pending entry prices, evaluates every open leveraged position
    /// on the asset, and closes those the exit policy selects. Binary
    /// positions are left alone until expiry and then settled. Returns the
    /// exit decisions made on this tick.
    pub async fn on_tick(&self, tick: &MarketTick) -> Vec<ExitDecision> {
        self.advance_clock(tick.timestamp);

        let trades: Vec<Trade> = {
            let mut book = self.book();
            let Book { open, closing, .. } = &mut *book;
            let mut trades = Vec::new();
            for trade in open.values_mut() {
                if trade.asset != tick.asset || closing.contains(&trade.contract_id) {
                    continue;
                }
                if trade.metadata.entry_pending {
                    trade.entry_price = tick.price;
                    trade.metadata.entry_pending = false;
                    info!(contract_id = %trade.contract_id, entry_price = %tick.price, "Entry price anchored");
                }
                trades.push(trade.clone());
            }
            trades
        };

        let mut decisions = Vec::new();
        for trade in trades {
            if trade.mode == TradeMode::Binary {
                if trade.is_expired(tick.timestamp) {
                    if let Err(e) = self.settle_trade(&trade.contract_id).await {
                        error!(contract_id = %trade.contract_id, error = %e, "Settlement failed");
                    }
                }
                continue;
            }

            let decision = self.exit.evaluate_exit(&trade, tick.price, tick.timestamp, tick.rsi);
            if let Some(tracked) = self.book().open.get_mut(&trade.contract_id) {
                tracked.metadata.protect = tracked.metadata.protect.merge(decision.protect);
            }

            if let Some(reason) = decision.reason.filter(|_| decision.should_exit) {
                if let Err(e) = self.close_position(&trade.contract_id, Some(reason)).await {
                    error!(
                        contract_id = %trade.contract_id,
                        %reason,
                        error = %e,
                        "Exit failed - will retry on next tick"
                    );
                }
            }
            decisions.push(decision);
        }
        decisions
    }

    /// Close a position through the broker and book the result.
    ///
    /// Returns `Ok(None)` if the contract is not tracked or is already
    /// being closed.
    pub async fn close_position(
        &self,
        contract_id: &str,
        reason: Option<ExitReason>,
    ) -> EngineResult<Option<TradeRecord>> {
        let label = reason.map_or("manual", |r| r.as_str());
        self.close_with(contract_id, label, reason).await
    }

    /// Collect the broker settlement of an expired contract.
    pub async fn settle_trade(&self, contract_id: &str) -> EngineResult<Option<TradeRecord>> {
        self.close_with(contract_id, "expired", None).await
    }

    async fn close_with(
        &self,
        contract_id: &str,
        label: &str,
        reason: Option<ExitReason>,
    ) -> EngineResult<Option<TradeRecord>> {
        {
            let mut book = self.book();
            if !book.open.contains_key(contract_id) || !book.closing.insert(contract_id.to_string()) {
                debug!(%contract_id, "Close ignored - not tracked or already closing");
                return Ok(None);
            }
        }

        let report = match self
            .with_timeout("close_trade", self.broker.close_trade(contract_id))
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.book().closing.remove(contract_id);
                return Err(e);
            }
        };

        let Some(mut trade) = ({
            let mut book = self.book();
            book.closing.remove(contract_id);
            book.open.remove(contract_id)
        }) else {
            return Ok(None);
        };
        trade.status = TradeStatus::Closed;

        let closed_at = self.market_now();
        let record = TradeRecord::from_trade(&trade, report.profit, Some(report.sell_price), closed_at, label);
        self.book_result(&trade, &record, reason)?;
        Ok(Some(record))
    }

    fn book_result(
        &self,
        trade: &Trade,
        record: &TradeRecord,
        reason: Option<ExitReason>,
    ) -> EngineResult<()> {
        if trade.metadata.reserved {
            self.accountant.release_stake(&trade.strategy, trade.stake);
        }
        self.history().push(record.clone());

        let balance_before = self
            .accountant
            .get_balance(&trade.strategy)
            .ok_or_else(|| EngineError::StrategyNotFound(trade.strategy.clone()))?;
        self.risk()
            .record_trade_result(record.pnl, balance_before, record.closed_at.date_naive());
        self.assets.record_result(&trade.asset, record.pnl, record.closed_at);

        info!(
            contract_id = %record.contract_id,
            asset = %record.asset,
            pnl = %record.pnl,
            reason = %record.reason,
            held_secs = (record.closed_at - record.opened_at).num_seconds(),
            "Trade closed"
        );
        self.events.publish(EngineEvent::TradeClosed {
            record: record.clone(),
            exit_reason: reason,
        });

        self.accountant.record_trade(&trade.strategy, record.clone())?;
        Ok(())
    }

    pub fn stats(&self) -> ManagerStats {
        let (closed_trades, realized_pnl) = {
            let history = self.history();
            let pnl: Decimal = history.iter().map(|r| r.pnl).sum();
            (history.len(), pnl)
        };
        let open_trades = self.book().open.len();
        let daily = self.risk().daily_stats().cloned();

        ManagerStats {
            reconciled: self.is_reconciled(),
            open_trades,
            closed_trades,
            realized_pnl,
            account: self.accountant.get_stats(&self.config.strategy),
            daily,
        }
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

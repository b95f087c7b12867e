//! Paper trading session over recorded ticks.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, error, info, warn};

use super::data::ReplayTick;
use crate::broker::PaperBroker;
use crate::events::EngineEvent;
use crate::manager::{OpenOutcome, TradeManager};
use crate::persistence::PersistenceManager;
use crate::trading::{Signal, TradeMode};

/// Settings for signals generated from the tick file.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub strategy: String,
    pub mode: TradeMode,
    pub confidence: Decimal,
}

/// Outcome of a replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub ticks: usize,
    pub signals: usize,
    pub opened: usize,
    pub rejected: usize,
    pub failed: usize,
    pub closed: usize,
    pub journaled: usize,
    pub still_open: usize,
    pub final_balance: Option<Decimal>,
}

/// Drives a [`TradeManager`] backed by a [`PaperBroker`] tick by tick.
pub struct ReplaySession {
    manager: Arc<TradeManager>,
    broker: Arc<PaperBroker>,
    settings: ReplaySettings,
}

impl ReplaySession {
    pub fn new(manager: Arc<TradeManager>, broker: Arc<PaperBroker>, settings: ReplaySettings) -> Self {
        Self {
            manager,
            broker,
            settings,
        }
    }

    /// Replay `ticks` in order. Closed trades are journaled and the ledger
    /// snapshot is saved at the end when `persistence` is given.
    pub async fn run(
        &self,
        ticks: &[ReplayTick],
        persistence: Option<&PersistenceManager>,
    ) -> Result<ReplaySummary> {
        let mut events = self.manager.subscribe();
        let mut summary = ReplaySummary::default();

        let report = self
            .manager
            .start()
            .await
            .context("Failed to reconcile with paper broker")?;
        debug!(?report, "Replay reconciled");

        for step in ticks {
            let tick = &step.tick;
            self.broker.update_price(&tick.asset, tick.price, tick.timestamp).await;
            self.manager.on_tick(tick).await;
            summary.ticks += 1;

            if let Some(direction) = step.signal {
                summary.signals += 1;
                let signal = Signal {
                    strategy: self.settings.strategy.clone(),
                    asset: tick.asset.clone(),
                    direction,
                    confidence: self.settings.confidence,
                    mode: self.settings.mode,
                    price: tick.price,
                    tp_pct: None,
                    sl_pct: None,
                };

                match self.manager.open_position(&signal).await {
                    Ok(OpenOutcome::Opened(trade)) => {
                        summary.opened += 1;
                        debug!(contract_id = %trade.contract_id, "Replay position opened");
                    }
                    Ok(OpenOutcome::Rejected(reason)) => {
                        summary.rejected += 1;
                        debug!(asset = %tick.asset, %reason, "Replay signal rejected");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(asset = %tick.asset, error = %e, "Replay execution failed");
                    }
                }
            }

            self.drain_events(&mut events, persistence, &mut summary)?;
        }

        summary.still_open = self.manager.get_open_trades().len();
        summary.final_balance = self.manager.accountant().get_balance(&self.settings.strategy);

        if let Some(persistence) = persistence {
            persistence.save_snapshot(&self.manager.accountant().snapshot())?;
        }

        info!(
            ticks = summary.ticks,
            signals = summary.signals,
            opened = summary.opened,
            rejected = summary.rejected,
            closed = summary.closed,
            still_open = summary.still_open,
            "Replay finished"
        );
        Ok(summary)
    }

    fn drain_events(
        &self,
        events: &mut Receiver<EngineEvent>,
        persistence: Option<&PersistenceManager>,
        summary: &mut ReplaySummary,
    ) -> Result<()> {
        loop {
            match events.try_recv() {
                Ok(EngineEvent::TradeClosed { record, .. }) => {
                    summary.closed += 1;
                    if let Some(persistence) = persistence {
                        if persistence.record_closed_trade(&record)? {
                            summary.journaled += 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Replay fell behind the event stream");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }
}

//! In-memory broker for paper trading and replays.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{BrokerPosition, CloseReport, ExecutionReport, RawTimestamp, TradeRequest};
use super::Broker;
use crate::trading::{Direction, TradeMode};
use crate::utils::decimal::{percent_change, truncate_to_precision};

/// Simulated contract.
#[derive(Debug, Clone)]
struct PaperPosition {
    contract_id: String,
    request: TradeRequest,
    entry_price: Decimal,
    opened_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct PaperState {
    positions: HashMap<String, PaperPosition>,
    /// Positions injected as-is, e.g. to simulate a restart
    seeded: HashMap<String, BrokerPosition>,
    prices: HashMap<String, Decimal>,
    /// Time of the most recent price update
    clock: Option<DateTime<Utc>>,
    realized_pnl: Decimal,
    order_count: u64,
}

/// Paper broker that fills at the last known price.
///
/// Leveraged P&L is `stake * move * multiplier`, floored at the stake.
/// Binary contracts pay `stake * payout_rate` when the price finished
/// strictly in the bet direction and lose the stake otherwise.
pub struct PaperBroker {
    state: RwLock<PaperState>,
    order_id_counter: AtomicU64,
    payout_rate: Decimal,
    latency: RwLock<Option<Duration>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PaperState::default()),
            order_id_counter: AtomicU64::new(1),
            payout_rate: dec!(0.8),
            latency: RwLock::new(None),
        }
    }

    pub fn with_payout_rate(mut self, payout_rate: Decimal) -> Self {
        self.payout_rate = payout_rate;
        self
    }

    /// Delay every broker call, to exercise caller timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Record the latest price for an asset and advance the simulated clock.
    pub async fn update_price(&self, asset: &str, price: Decimal, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.prices.insert(asset.to_string(), price);
        state.clock = Some(state.clock.map_or(at, |clock| clock.max(at)));
    }

    /// Inject a raw broker position, bypassing execution.
    pub async fn seed_position(&self, position: BrokerPosition) {
        let mut state = self.state.write().await;
        debug!(contract_id = %position.contract_id, symbol = %position.symbol, "Seeded paper position");
        state.seeded.insert(position.contract_id.clone(), position);
    }

    pub async fn realized_pnl(&self) -> Decimal {
        self.state.read().await.realized_pnl
    }

    pub async fn order_count(&self) -> u64 {
        self.state.read().await.order_count
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn profit(&self, position: &PaperPosition, price: Decimal) -> Decimal {
        let moved = percent_change(position.entry_price, price);
        let signed = match position.request.direction {
            Direction::Long => moved,
            Direction::Short => -moved,
        };
        let stake = position.request.stake;

        let pnl = match position.request.mode {
            TradeMode::Leveraged => {
                let multiplier = Decimal::from(position.request.multiplier.unwrap_or(1));
                (stake * signed / Decimal::ONE_HUNDRED * multiplier).max(-stake)
            }
            TradeMode::Binary if signed > Decimal::ZERO => stake * self.payout_rate,
            TradeMode::Binary => -stake,
        };
        truncate_to_precision(pnl, 2)
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.simulate_latency().await;
        let state = self.state.read().await;

        let mut positions: Vec<BrokerPosition> = state.seeded.values().cloned().collect();
        for position in state.positions.values() {
            let price = state
                .prices
                .get(&position.request.asset)
                .copied()
                .unwrap_or(position.entry_price);
            let profit = self.profit(position, price);

            positions.push(BrokerPosition {
                contract_id: position.contract_id.clone(),
                symbol: position.request.asset.clone(),
                contract_type: position.request.contract_type().to_string(),
                buy_price: position.request.stake,
                profit,
                profit_percentage: percent_change(position.request.stake, position.request.stake + profit),
                purchase_time: Some(RawTimestamp::Number(position.opened_at.timestamp() as f64)),
                entry_spot: Some(position.entry_price),
            });
        }

        positions.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
        Ok(positions)
    }

    async fn execute_trade(&self, request: &TradeRequest) -> Result<ExecutionReport> {
        self.simulate_latency().await;

        if request.stake <= Decimal::ZERO {
            bail!("stake must be positive, got {}", request.stake);
        }

        let mut state = self.state.write().await;
        let entry_price = state
            .prices
            .get(&request.asset)
            .copied()
            .with_context(|| format!("no price available for {}", request.asset))?;
        let opened_at = state.clock.unwrap_or_else(Utc::now);

        let expires_at = match request.mode {
            TradeMode::Binary => {
                let secs = request.duration_secs.context("binary contract requires a duration")?;
                let secs = i64::try_from(secs).context("binary duration out of range")?;
                Some(opened_at + ChronoDuration::seconds(secs))
            }
            TradeMode::Leveraged => None,
        };

        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        let contract_id = format!("PAPER-{id}");

        state.positions.insert(
            contract_id.clone(),
            PaperPosition {
                contract_id: contract_id.clone(),
                request: request.clone(),
                entry_price,
                opened_at,
                expires_at,
            },
        );
        state.order_count += 1;

        info!(
            %contract_id,
            asset = %request.asset,
            direction = %request.direction,
            mode = %request.mode,
            stake = %request.stake,
            %entry_price,
            "[PAPER] Contract opened"
        );

        Ok(ExecutionReport {
            contract_id,
            entry_price,
            purchase_time: opened_at,
            expires_at,
        })
    }

    async fn close_trade(&self, contract_id: &str) -> Result<CloseReport> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;

        if let Some(seeded) = state.seeded.remove(contract_id) {
            let sell_price = state
                .prices
                .get(&seeded.symbol)
                .copied()
                .or(seeded.entry_spot)
                .unwrap_or_default();
            state.realized_pnl += seeded.profit;
            return Ok(CloseReport {
                contract_id: contract_id.to_string(),
                sell_price,
                profit: seeded.profit,
            });
        }

        let Some(position) = state.positions.remove(contract_id) else {
            bail!("unknown contract {contract_id}");
        };

        let sell_price = state
            .prices
            .get(&position.request.asset)
            .copied()
            .unwrap_or(position.entry_price);
        let profit = self.profit(&position, sell_price);
        state.realized_pnl += profit;

        info!(
            %contract_id,
            asset = %position.request.asset,
            %sell_price,
            %profit,
            settled = position.expires_at.is_some(),
            "[PAPER] Contract closed"
        );

        Ok(CloseReport {
            contract_id: contract_id.to_string(),
            sell_price,
            profit,
        })
    }
}

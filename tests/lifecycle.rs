//! End-to-end lifecycle against the paper broker.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use trade_sentinel::broker::{BrokerPosition, PaperBroker, RawTimestamp};
use trade_sentinel::config::Config;
use trade_sentinel::events::EventBus;
use trade_sentinel::ledger::StrategyAccountant;
use trade_sentinel::manager::{OpenOutcome, TradeManager};
use trade_sentinel::persistence::PersistenceManager;
use trade_sentinel::replay::{ReplaySession, ReplaySettings, TickLoader};
use trade_sentinel::risk::DenialReason;
use trade_sentinel::trading::{Direction, Signal, TradeMode};
use trade_sentinel::EngineError;

fn settings() -> ReplaySettings {
    ReplaySettings {
        strategy: "default".to_string(),
        mode: TradeMode::Leveraged,
        confidence: Decimal::ONE,
    }
}

fn setup(config: &Config) -> (Arc<PaperBroker>, Arc<TradeManager>) {
    let events = EventBus::default();
    let broker = Arc::new(PaperBroker::new());
    let accountant = Arc::new(StrategyAccountant::new(events.clone()));
    let manager = Arc::new(TradeManager::new(config, broker.clone(), accountant, events));
    (broker, manager)
}

fn position(id: &str, symbol: &str, contract_type: &str, stake: Decimal) -> BrokerPosition {
    BrokerPosition {
        contract_id: id.to_string(),
        symbol: symbol.to_string(),
        contract_type: contract_type.to_string(),
        buy_price: stake,
        profit: Decimal::ZERO,
        profit_percentage: Decimal::ZERO,
        purchase_time: Some(RawTimestamp::Number(1_717_236_000.0)),
        entry_spot: Some(dec!(1000)),
    }
}

fn signal(asset: &str, direction: Direction) -> Signal {
    Signal {
        strategy: "default".to_string(),
        asset: asset.to_string(),
        direction,
        confidence: Decimal::ONE,
        mode: TradeMode::Leveraged,
        price: dec!(1000),
        tp_pct: None,
        sl_pct: None,
    }
}

fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap()
}

#[tokio::test]
async fn test_reconcile_twice_tracks_each_position_once() {
    let config = Config::default();
    let (broker, manager) = setup(&config);
    broker.seed_position(position("BRK-1", "R_75", "MULTUP", dec!(10))).await;
    broker.seed_position(position("BRK-2", "R_10", "PUT", dec!(5))).await;

    let first = manager.start().await.unwrap();
    assert_eq!(first.recovered, 2);
    assert_eq!(first.already_tracked, 0);

    let second = manager.start().await.unwrap();
    assert_eq!(second.recovered, 0);
    assert_eq!(second.already_tracked, 2);

    assert_eq!(manager.get_open_trades().len(), 2);
    let accountant = manager.accountant();
    assert_eq!(accountant.get_balance("default"), Some(dec!(1000)));
    assert_eq!(accountant.get_available_balance("default"), Some(dec!(985)));

    let binary = manager
        .get_open_trades()
        .into_iter()
        .find(|t| t.contract_id == "BRK-2")
        .unwrap();
    assert_eq!(binary.mode, TradeMode::Binary);
    assert_eq!(binary.direction, Direction::Short);
    assert!(binary.metadata.recovered);
    assert_eq!(
        binary.expires_at,
        Some(binary.timestamp + ChronoDuration::seconds(300))
    );
}

#[tokio::test]
async fn test_unparseable_purchase_time_uses_current_time() {
    let config = Config::default();
    let (broker, manager) = setup(&config);

    let mut broken = position("BRK-NAN", "R_50", "MULTDOWN", dec!(10));
    broken.purchase_time = Some(RawTimestamp::Number(f64::NAN));
    broker.seed_position(broken).await;
    broker.seed_position(position("BRK-OK", "R_75", "MULTUP", dec!(10))).await;

    let before = Utc::now();
    let report = manager.start().await.unwrap();
    assert_eq!(report.recovered, 2);
    assert_eq!(report.timestamp_fallbacks, 1);

    let trades = manager.get_open_trades();
    let broken = trades.iter().find(|t| t.contract_id == "BRK-NAN").unwrap();
    assert!(broken.timestamp >= before);

    let intact = trades.iter().find(|t| t.contract_id == "BRK-OK").unwrap();
    assert_eq!(intact.timestamp, at(1_717_236_000_000));
}

#[tokio::test]
async fn test_recovered_positions_count_against_caps() {
    let config = Config::default();
    let (broker, manager) = setup(&config);
    broker.seed_position(position("BRK-1", "R_75", "MULTUP", dec!(10))).await;
    broker.update_price("R_75", dec!(1000), Utc::now()).await;

    manager.start().await.unwrap();

    match manager.open_position(&signal("R_75", Direction::Long)).await.unwrap() {
        OpenOutcome::Rejected(DenialReason::MaxTradesPerSymbol { open, max, .. }) => {
            assert_eq!(open, 1);
            assert_eq!(max, 1);
        }
        other => panic!("expected per-symbol denial, got {other:?}"),
    }
    assert_eq!(broker.order_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_broker_fails_closed() {
    let config = Config::default();
    let (broker, manager) = setup(&config);
    broker.update_price("R_75", dec!(1000), Utc::now()).await;
    manager.start().await.unwrap();

    broker.set_latency(Some(Duration::from_secs(60))).await;
    let err = manager
        .open_position(&signal("R_75", Direction::Long))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::BrokerTimeout {
            operation: "execute_trade",
            ..
        }
    ));

    assert_eq!(
        manager.accountant().get_available_balance("default"),
        Some(dec!(1000))
    );
    assert!(manager.get_open_trades().is_empty());
    let token = manager.acquire_trade_lock("R_75").unwrap();
    assert!(manager.release_trade_lock("R_75", token));

    broker.set_latency(None).await;
    let outcome = manager.open_position(&signal("R_75", Direction::Long)).await.unwrap();
    assert!(matches!(outcome, OpenOutcome::Opened(_)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_signals_respect_global_cap() {
    let mut config = Config::default();
    config.risk.max_open_trades = 1;
    let (broker, manager) = setup(&config);
    broker.update_price("R_10", dec!(500), Utc::now()).await;
    broker.update_price("R_25", dec!(800), Utc::now()).await;
    manager.start().await.unwrap();

    broker.set_latency(Some(Duration::from_secs(1))).await;
    let first = signal("R_10", Direction::Long);
    let second = signal("R_25", Direction::Long);
    let (a, b) = tokio::join!(manager.open_position(&first), manager.open_position(&second));

    let outcomes = [a.unwrap(), b.unwrap()];
    let opened = outcomes
        .iter()
        .filter(|o| matches!(o, OpenOutcome::Opened(_)))
        .count();
    assert_eq!(opened, 1);
    assert!(outcomes.iter().any(|o| matches!(
        o,
        OpenOutcome::Rejected(DenialReason::MaxOpenTrades { open: 1, max: 1 })
    )));
    assert_eq!(manager.get_open_trades().len(), 1);
    assert_eq!(broker.order_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_entry_frees_its_cap_slot() {
    let mut config = Config::default();
    config.risk.max_open_trades = 1;
    let (broker, manager) = setup(&config);
    broker.update_price("R_10", dec!(500), Utc::now()).await;
    manager.start().await.unwrap();

    broker.set_latency(Some(Duration::from_secs(60))).await;
    assert!(manager.open_position(&signal("R_10", Direction::Long)).await.is_err());

    broker.set_latency(None).await;
    assert!(manager.can_open_trade("R_10").is_allowed());
}

#[tokio::test]
async fn test_unreserved_recovered_position_releases_nothing() {
    let config = Config::default();
    let (broker, manager) = setup(&config);
    broker.seed_position(position("B1", "R_75", "MULTUP", dec!(600))).await;
    broker.seed_position(position("B2", "R_10", "MULTUP", dec!(600))).await;

    manager.start().await.unwrap();
    let stats = manager.accountant().get_stats("default").unwrap();
    assert_eq!(stats.reserved, dec!(600));
    assert_eq!(stats.open_positions, 1);

    manager.close_position("B2", None).await.unwrap().unwrap();

    let stats = manager.accountant().get_stats("default").unwrap();
    assert_eq!(stats.reserved, dec!(600));
    assert_eq!(stats.open_positions, 1);
    assert_eq!(stats.available, dec!(400));
}

#[test]
fn test_replay_breaker_rolls_over_with_market_days() {
    // 2024-06-01 10:00 UTC: open, hard exit at a loss, retry the same day;
    // 2024-06-02 10:00 UTC: retry on the next market day.
    let csv = "timestamp_ms,asset,price,rsi,signal\n\
               1717236000000,R_75,1000,,UP\n\
               1717239700000,R_75,990,,\n\
               1717239800000,R_10,500,,UP\n\
               1717322400000,R_10,500,,UP\n";
    let ticks = TickLoader::from_csv_content(csv).unwrap();

    tokio_test::block_on(async {
        let mut config = Config::default();
        config.risk.risk_pct_leveraged = dec!(0.1);
        let (broker, manager) = setup(&config);

        let session = ReplaySession::new(manager.clone(), broker, settings());
        let summary = session.run(ticks.ticks(), None).await.unwrap();

        assert_eq!(summary.signals, 3);
        assert_eq!(summary.closed, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.opened, 2);
        // 100 staked at 100x, price down 1%: the whole stake is lost.
        assert_eq!(summary.final_balance, Some(dec!(900)));

        let history = manager.get_trade_history();
        assert_eq!(history[0].reason, "extreme_max_duration");

        let daily = manager.stats().daily.unwrap();
        assert_eq!(daily.date, at(1_717_322_400_000).date_naive());
        assert_eq!(daily.start_balance, dec!(900));
        assert!(!daily.limit_reached);
        assert_eq!(daily.trades_executed, 1);
    });
}

#[test]
fn test_replay_books_and_journals_closed_trades() {
    let csv = "timestamp_ms,asset,price,rsi,signal\n\
               1717236000000,R_75,1000,,UP\n\
               1717236060000,R_75,1002,,\n\
               1717236960000,R_75,1002,,\n\
               1717237000000,R_10,500,,DOWN\n";
    let ticks = TickLoader::from_csv_content(csv).unwrap();

    tokio_test::block_on(async {
        let config = Config::default();
        let (broker, manager) = setup(&config);
        let persistence = PersistenceManager::new(":memory:").unwrap();

        let session = ReplaySession::new(manager.clone(), broker.clone(), settings());
        let summary = session.run(ticks.ticks(), Some(&persistence)).await.unwrap();

        assert_eq!(summary.ticks, 4);
        assert_eq!(summary.signals, 2);
        assert_eq!(summary.opened, 2);
        assert_eq!(summary.closed, 1);
        assert_eq!(summary.journaled, 1);
        assert_eq!(summary.still_open, 1);
        // 20 staked at 100x, price up 0.2%
        assert_eq!(summary.final_balance, Some(dec!(1004)));

        let history = manager.get_trade_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "stagnation");
        assert_eq!(history[0].closed_at, at(1_717_236_960_000));

        let journal = persistence.journal_summary().unwrap();
        assert_eq!(journal.trades, 1);
        assert_eq!(journal.wins, 1);
        assert_eq!(journal.total_pnl, dec!(4));

        let snapshot = persistence.load_latest_snapshot().unwrap().unwrap();
        let account = &snapshot.strategies["default"];
        assert_eq!(account.balance, dec!(1004));
        assert_eq!(account.reserved, dec!(20.08));

        // Restart: the open paper contract is reconciled exactly once.
        let events = EventBus::default();
        let restored = Arc::new(StrategyAccountant::from_snapshot(snapshot, events.clone()));
        let restarted = TradeManager::new(&config, broker.clone(), restored, events);
        let report = restarted.start().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(
            restarted.accountant().get_available_balance("default"),
            Some(dec!(983.92))
        );
    });
}

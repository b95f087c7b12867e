//! Trade Sentinel - Main Entry Point
//!
//! Paper replays over recorded ticks and status of the persisted ledger.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use trade_sentinel::broker::PaperBroker;
use trade_sentinel::config::Config;
use trade_sentinel::events::EventBus;
use trade_sentinel::ledger::StrategyAccountant;
use trade_sentinel::manager::TradeManager;
use trade_sentinel::persistence::PersistenceManager;
use trade_sentinel::replay::{ReplaySession, ReplaySettings, TickLoader};
use trade_sentinel::trading::TradeMode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Trade Sentinel CLI
#[derive(Parser)]
#[command(name = "trade-sentinel")]
#[command(version, about = "Trade lifecycle and risk management engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper trading session over a tick CSV
    Replay {
        /// Path to CSV file (timestamp_ms,asset,price[,rsi][,signal])
        #[arg(short, long)]
        ticks: String,

        /// Contract mode for generated signals
        #[arg(short, long, default_value = "leveraged", value_parser = ["leveraged", "binary"])]
        mode: String,

        /// Confidence attached to every signal in the file
        #[arg(short, long, default_value = "1")]
        confidence: Decimal,

        /// Path to SQLite database (default: engine.database_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Ignore any saved ledger snapshot
        #[arg(long)]
        fresh: bool,
    },

    /// Show the persisted ledger and recent closed trades
    Status {
        /// Path to SQLite database (default: engine.database_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Show recent closed trades
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Replay {
            ticks,
            mode,
            confidence,
            db,
            fresh,
        } => {
            let mode = if mode == "binary" {
                TradeMode::Binary
            } else {
                TradeMode::Leveraged
            };
            let db = db.unwrap_or_else(|| config.engine.database_path.clone());
            run_replay(&config, &ticks, mode, confidence, &db, fresh).await
        }
        Commands::Status { db, verbose } => {
            let db = db.unwrap_or_else(|| config.engine.database_path.clone());
            show_status(&config, &db, verbose)
        }
    }
}

async fn run_replay(
    config: &Config,
    ticks_path: &str,
    mode: TradeMode,
    confidence: Decimal,
    db_path: &str,
    fresh: bool,
) -> Result<()> {
    info!(
        "Trade Sentinel v{} - paper replay",
        env!("CARGO_PKG_VERSION")
    );
    log_config(config);

    if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    let persistence = PersistenceManager::new(db_path)?;

    let events = EventBus::default();
    let accountant = match persistence.load_latest_snapshot()? {
        Some(snapshot) if !fresh => {
            info!("[PERSISTENCE] Restoring ledger from database");
            StrategyAccountant::from_snapshot(snapshot, events.clone())
        }
        _ => {
            info!(
                capital = %config.engine.initial_capital,
                "[PERSISTENCE] Starting with a fresh ledger"
            );
            StrategyAccountant::new(events.clone())
        }
    };

    let loader = TickLoader::new(ticks_path)?;
    if let Some((start, end)) = loader.range() {
        info!(ticks = loader.len(), %start, %end, "Loaded tick file");
    }

    let broker = Arc::new(PaperBroker::new());
    let manager = Arc::new(TradeManager::new(
        config,
        broker.clone(),
        Arc::new(accountant),
        events,
    ));

    let session = ReplaySession::new(
        manager.clone(),
        broker,
        ReplaySettings {
            strategy: config.engine.strategy.clone(),
            mode,
            confidence,
        },
    );
    let summary = session.run(loader.ticks(), Some(&persistence)).await?;

    println!("\nReplay Summary");
    println!("   ├─ Ticks:        {}", summary.ticks);
    println!("   ├─ Signals:      {}", summary.signals);
    println!("   ├─ Opened:       {}", summary.opened);
    println!("   ├─ Rejected:     {}", summary.rejected);
    println!("   ├─ Failed:       {}", summary.failed);
    println!("   ├─ Closed:       {}", summary.closed);
    println!("   ├─ Still Open:   {}", summary.still_open);
    match summary.final_balance {
        Some(balance) => println!("   └─ Balance:      ${:.2}", balance),
        None => println!("   └─ Balance:      n/a"),
    }

    let stats = manager.stats();
    if let Some(daily) = stats.daily {
        println!(
            "\nToday: realized ${:.2}, executed {}, paused {}{}",
            daily.realized_pnl,
            daily.trades_executed,
            daily.trades_paused,
            if daily.limit_reached {
                " (daily loss limit reached)"
            } else {
                ""
            }
        );
    }

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "trade-sentinel.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trade_sentinel=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Strategy: {}", config.engine.strategy);
    info!("   Initial Capital: ${}", config.engine.initial_capital);
    info!(
        "   Max Open Trades: {} ({} per symbol)",
        config.risk.max_open_trades, config.risk.max_trades_per_symbol
    );
    info!(
        "   Risk per Trade: {:.2}% leveraged, {:.2}% binary",
        config.risk.risk_pct_leveraged * dec!(100),
        config.risk.risk_pct_binary * dec!(100)
    );
    info!(
        "   Stake Range: ${} - ${} (max {:.0}% of balance)",
        config.risk.min_stake,
        config.risk.max_stake,
        config.risk.max_stake_pct * dec!(100)
    );
    if config.risk.daily_loss_limit_enabled {
        info!(
            "   Daily Loss Limit: {:.1}%",
            config.risk.daily_loss_limit_pct * dec!(100)
        );
    } else {
        info!("   Daily Loss Limit: disabled");
    }
    info!(
        "   Exit: stagnation {}s, max {}s, hard max {}s",
        config.exit.stagnation_duration_secs,
        config.exit.max_trade_duration_secs,
        config.exit.extreme_max_duration_secs
    );
    info!("   Broker Timeout: {}s", config.engine.broker_timeout_secs);
}

/// Show the persisted ledger from the database.
fn show_status(config: &Config, db_path: &str, verbose: bool) -> Result<()> {
    println!("Trade Sentinel status");

    if !Path::new(db_path).exists() {
        println!("\nDatabase not found: {}", db_path);
        println!("   No replay has been run yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;

    let Some(snapshot) = persistence.load_latest_snapshot()? else {
        println!("\nNo saved ledger found in database.");
        return Ok(());
    };

    println!(
        "\nLedger snapshot v{} saved {}",
        snapshot.version,
        snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );

    for account in snapshot.strategies.values() {
        let stats = account.stats();
        let marker = if stats.name == config.engine.strategy {
            " (active)"
        } else {
            ""
        };
        println!("\n{}{}", stats.name, marker);
        println!("   ├─ Initial Balance:  ${:.2}", stats.initial_balance);
        println!("   ├─ Current Balance:  ${:.2}", stats.balance);
        println!("   ├─ PnL:              ${:.2} ({:+.2}%)", stats.total_pnl, stats.return_pct);
        println!(
            "   ├─ Trades:           {} ({} wins, {:.1}% win rate)",
            stats.trades,
            stats.wins,
            stats.win_rate * dec!(100)
        );
        println!("   ├─ Peak Balance:     ${:.2}", stats.peak_balance);
        println!("   └─ Max Drawdown:     {:.2}%", stats.max_drawdown * dec!(100));
    }

    let journal = persistence.journal_summary()?;
    println!(
        "\nJournal: {} closed trades, {} wins, net ${:.2}",
        journal.trades, journal.wins, journal.total_pnl
    );

    if verbose {
        let recent = persistence.recent_trades(20)?;
        if !recent.is_empty() {
            println!("\nRecent Trades");
        }
        for record in recent {
            println!(
                "   {} {} {} {} stake ${:.2} pnl ${:+.2} ({}) {}",
                record.closed_at.format("%Y-%m-%d %H:%M:%S"),
                record.contract_id,
                record.asset,
                record.direction,
                record.stake,
                record.pnl,
                record.reason,
                record.mode
            );
        }
    }

    Ok(())
}

//! SQLite persistence for the ledger and the closed-trade journal.
//!
//! Persists state to survive restarts:
//! - Versioned ledger snapshots (the JSON produced by the accountant)
//! - One journal row per closed contract
//!
//! Open positions are deliberately not stored; they are rebuilt from the
//! broker on every start.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::ledger::LedgerSnapshot;
use crate::trading::{Direction, TradeMode, TradeRecord};

/// Aggregate over the closed-trade journal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JournalSummary {
    pub trades: u64,
    pub wins: u64,
    pub total_pnl: Decimal,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Open (or create) the database, initializing the schema if needed.
    /// `":memory:"` gives a throwaway database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                saved_at TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS closed_trades (
                contract_id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                asset TEXT NOT NULL,
                direction TEXT NOT NULL,
                mode TEXT NOT NULL,
                stake TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT,
                pnl TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_closed_trades_closed_at ON closed_trades(closed_at);
            CREATE INDEX IF NOT EXISTS idx_closed_trades_asset ON closed_trades(asset);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Append a ledger snapshot.
    pub fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let payload = snapshot.to_json().context("Failed to serialize ledger snapshot")?;
        self.conn.execute(
            "INSERT INTO ledger_snapshots (saved_at, version, payload) VALUES (?1, ?2, ?3)",
            params![snapshot.timestamp.to_rfc3339(), snapshot.version, payload],
        )?;

        debug!(
            strategies = snapshot.strategies.len(),
            version = snapshot.version,
            "Ledger snapshot saved"
        );
        Ok(())
    }

    /// Most recent ledger snapshot, migrated to the current version.
    pub fn load_latest_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM ledger_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let snapshot = LedgerSnapshot::from_json(&payload).context("Failed to decode ledger snapshot")?;
        info!(
            strategies = snapshot.strategies.len(),
            saved_at = %snapshot.timestamp,
            "Loaded ledger snapshot from database"
        );
        Ok(Some(snapshot))
    }

    /// Keep only the newest `keep` snapshots. Returns the number removed.
    pub fn prune_snapshots(&self, keep: usize) -> Result<usize> {
        let removed = self.conn.execute(
            r#"
            DELETE FROM ledger_snapshots
            WHERE id NOT IN (SELECT id FROM ledger_snapshots ORDER BY id DESC LIMIT ?1)
            "#,
            params![keep as i64],
        )?;
        if removed > 0 {
            debug!(removed, keep, "Pruned ledger snapshots");
        }
        Ok(removed)
    }

    /// Journal a closed trade. Returns `false` if the contract was already
    /// journaled.
    pub fn record_closed_trade(&self, record: &TradeRecord) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO closed_trades (contract_id, strategy, asset, direction, mode,
                                                 stake, entry_price, exit_price, pnl,
                                                 opened_at, closed_at, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.contract_id,
                record.strategy,
                record.asset,
                record.direction.as_str(),
                record.mode.to_string(),
                record.stake.to_string(),
                record.entry_price.to_string(),
                record.exit_price.map(|p| p.to_string()),
                record.pnl.to_string(),
                record.opened_at.to_rfc3339(),
                record.closed_at.to_rfc3339(),
                record.reason,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Most recently closed trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT contract_id, strategy, asset, direction, mode, stake, entry_price,
                   exit_price, pnl, opened_at, closed_at, reason
            FROM closed_trades
            ORDER BY closed_at DESC, contract_id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;

        let mut trades = Vec::new();
        for row in rows {
            let (contract_id, strategy, asset, direction, mode, stake, entry, exit, pnl, opened, closed, reason) =
                row?;
            let (Some(direction), Some(mode)) = (parse_direction(&direction), parse_mode(&mode)) else {
                warn!(%contract_id, %direction, %mode, "Skipping malformed journal row");
                continue;
            };
            trades.push(TradeRecord {
                contract_id,
                strategy,
                asset,
                direction,
                mode,
                stake: Decimal::from_str(&stake).unwrap_or_default(),
                entry_price: Decimal::from_str(&entry).unwrap_or_default(),
                exit_price: exit.and_then(|p| Decimal::from_str(&p).ok()),
                pnl: Decimal::from_str(&pnl).unwrap_or_default(),
                opened_at: parse_time(&opened),
                closed_at: parse_time(&closed),
                reason,
            });
        }
        Ok(trades)
    }

    pub fn journal_summary(&self) -> Result<JournalSummary> {
        let mut stmt = self.conn.prepare("SELECT pnl FROM closed_trades")?;
        let pnls = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(|p| Decimal::from_str(&p).unwrap_or_default());

        let mut summary = JournalSummary::default();
        for pnl in pnls {
            summary.trades += 1;
            summary.total_pnl += pnl;
            if pnl > Decimal::ZERO {
                summary.wins += 1;
            }
        }
        Ok(summary)
    }

    /// Check if any ledger snapshot was saved.
    pub fn has_state(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_snapshots", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all persistence data");
        self.conn.execute_batch(
            r#"
            DELETE FROM ledger_snapshots;
            DELETE FROM closed_trades;
            "#,
        )?;
        Ok(())
    }
}

fn parse_direction(value: &str) -> Option<Direction> {
    match value {
        "long" => Some(Direction::Long),
        "short" => Some(Direction::Short),
        _ => None,
    }
}

fn parse_mode(value: &str) -> Option<TradeMode> {
    match value {
        "leveraged" => Some(TradeMode::Leveraged),
        "binary" => Some(TradeMode::Binary),
        _ => None,
    }
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

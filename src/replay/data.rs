//! Tick file loading for paper replays.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::Path;

use crate::trading::{Direction, MarketTick};

/// One replay step: a price update and an optional directional signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTick {
    pub tick: MarketTick,
    pub signal: Option<Direction>,
}

/// CSV tick loader.
///
/// Expected CSV format (rsi and signal are optional):
/// ```csv
/// timestamp_ms,asset,price,rsi,signal
/// 1717236000000,R_75,1234.56,55.2,UP
/// 1717236001000,R_75,1234.91,,
/// ```
#[derive(Debug, Clone, Default)]
pub struct TickLoader {
    ticks: Vec<ReplayTick>,
}

impl TickLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tick file: {}", path.display()))?;

        Self::from_csv_content(&content)
    }

    pub fn from_csv_content(content: &str) -> Result<Self> {
        let mut ticks = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.starts_with("timestamp") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let tick = parse_row(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            ticks.push(tick);
        }

        if ticks.is_empty() {
            anyhow::bail!("Tick file contains no data rows");
        }

        // Stable: equal timestamps keep file order.
        ticks.sort_by_key(|t| t.tick.timestamp);
        Ok(Self { ticks })
    }

    pub fn ticks(&self) -> &[ReplayTick] {
        &self.ticks
    }

    pub fn into_ticks(self) -> Vec<ReplayTick> {
        self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// First and last tick time.
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.ticks.first()?;
        let last = self.ticks.last()?;
        Some((first.tick.timestamp, last.tick.timestamp))
    }
}

fn parse_row(line: &str) -> Result<ReplayTick> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        anyhow::bail!(
            "Expected at least 3 columns (timestamp_ms,asset,price[,rsi][,signal]), got {}",
            parts.len()
        );
    }

    let millis: i64 = parts[0]
        .parse()
        .with_context(|| format!("Invalid timestamp_ms: {}", parts[0]))?;
    let timestamp = DateTime::from_timestamp_millis(millis)
        .with_context(|| format!("Timestamp out of range: {millis}"))?;

    let asset = parts[1];
    if asset.is_empty() {
        anyhow::bail!("Empty asset");
    }

    let price: Decimal = parts[2]
        .parse()
        .with_context(|| format!("Invalid price: {}", parts[2]))?;
    if price <= Decimal::ZERO {
        anyhow::bail!("Price must be positive, got {price}");
    }

    let rsi = match parts.get(3).copied().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<Decimal>()
                .with_context(|| format!("Invalid rsi: {raw}"))?,
        ),
        None => None,
    };

    let signal = match parts.get(4).copied().filter(|s| !s.is_empty()) {
        Some(raw) => Some(parse_signal(raw)?),
        None => None,
    };

    Ok(ReplayTick {
        tick: MarketTick {
            asset: asset.to_string(),
            price,
            timestamp,
            rsi,
        },
        signal,
    })
}

fn parse_signal(raw: &str) -> Result<Direction> {
    match raw.to_ascii_uppercase().as_str() {
        "UP" | "LONG" | "CALL" => Ok(Direction::Long),
        "DOWN" | "SHORT" | "PUT" => Ok(Direction::Short),
        other => anyhow::bail!("Invalid signal: {other} (expected UP or DOWN)"),
    }
}

//! Versioned ledger snapshot used to carry capital history across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::account::StrategyAccount;
use crate::error::{EngineError, EngineResult};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub strategies: BTreeMap<String, StrategyAccount>,
}

impl LedgerSnapshot {
    pub fn new(strategies: BTreeMap<String, StrategyAccount>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            timestamp: Utc::now(),
            strategies,
        }
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot, migrating older versions forward.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let snapshot: LedgerSnapshot = serde_json::from_str(json)?;
        snapshot.migrate()
    }

    fn migrate(self) -> EngineResult<Self> {
        match self.version {
            SNAPSHOT_VERSION => Ok(self),
            // Version 0 was written before the field was introduced; the
            // layout is otherwise identical.
            0 => Ok(Self {
                version: SNAPSHOT_VERSION,
                ..self
            }),
            found => Err(EngineError::UnsupportedSnapshotVersion {
                found,
                supported: SNAPSHOT_VERSION,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot_with_account() -> LedgerSnapshot {
        let mut strategies = BTreeMap::new();
        strategies.insert(
            "alpha".to_string(),
            StrategyAccount::new("alpha", dec!(1000)),
        );
        LedgerSnapshot::new(strategies)
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = snapshot_with_account().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["version"], 1);
        assert!(value["timestamp"].is_string());
        assert!(value["strategies"]["alpha"]["peak_balance"].is_string());
    }

    #[test]
    fn test_rejects_future_version() {
        let mut snapshot = snapshot_with_account();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let json = serde_json::to_string(&snapshot).unwrap();

        let err = LedgerSnapshot::from_json(&json).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedSnapshotVersion { found: 2, .. }
        ));
    }

    #[test]
    fn test_migrates_version_zero() {
        let mut snapshot = snapshot_with_account();
        snapshot.version = 0;
        let json = serde_json::to_string(&snapshot).unwrap();

        let migrated = LedgerSnapshot::from_json(&json).unwrap();
        assert_eq!(migrated.version, SNAPSHOT_VERSION);
        assert_eq!(migrated.strategies, snapshot.strategies);
    }
}

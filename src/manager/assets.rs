//! Per-asset state: advisory trade locks, losing streaks and cooldowns.
//!
//! Everything keyed by asset lives in one table behind one mutex so the
//! lock, the streak counter and the cooldown can never drift apart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LockInfo {
    token: u64,
    acquired_at: Instant,
}

/// Proof of holding a detached asset lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the lock stays held until released with this token"]
pub struct LockToken(u64);

/// State tracked for one asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetState {
    lock: Option<LockInfo>,
    /// Losing closes in a row since the last win or cooldown
    pub consecutive_losses: u32,
    /// No new entries before this time
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_exit_at: Option<DateTime<Utc>>,
}

impl AssetState {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

pub struct AssetTable {
    assets: Mutex<HashMap<String, AssetState>>,
    next_token: AtomicU64,
    lock_ttl: Duration,
    loss_cooldown: ChronoDuration,
    max_consecutive_losses: u32,
}

impl AssetTable {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            lock_ttl: Duration::from_secs(config.trade_lock_ttl_secs),
            loss_cooldown: ChronoDuration::seconds(
                i64::try_from(config.loss_cooldown_secs).unwrap_or(i64::MAX / 1_000),
            ),
            max_consecutive_losses: config.max_consecutive_losses,
        }
    }

    fn assets(&self) -> MutexGuard<'_, HashMap<String, AssetState>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the advisory lock for `asset`.
    ///
    /// Returns `None` while another holder's lock is younger than the TTL.
    /// Older locks are assumed abandoned and taken over.
    pub fn try_lock(&self, asset: &str) -> Option<AssetLockGuard<'_>> {
        let token = self.acquire(asset)?;
        Some(AssetLockGuard {
            table: self,
            asset: asset.to_string(),
            token,
        })
    }

    fn acquire(&self, asset: &str) -> Option<u64> {
        let now = Instant::now();
        let mut assets = self.assets();
        let state = assets.entry(asset.to_string()).or_default();

        if let Some(lock) = state.lock {
            let held_for = now.saturating_duration_since(lock.acquired_at);
            if held_for < self.lock_ttl {
                debug!(%asset, held_ms = held_for.as_millis() as u64, "Asset lock busy");
                return None;
            }
            warn!(
                %asset,
                held_secs = held_for.as_secs(),
                ttl_secs = self.lock_ttl.as_secs(),
                "Taking over stale asset lock"
            );
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        state.lock = Some(LockInfo {
            token,
            acquired_at: now,
        });
        Some(token)
    }

    /// Acquire without a guard; pair with [`AssetTable::unlock`].
    pub fn lock_detached(&self, asset: &str) -> Option<LockToken> {
        self.acquire(asset).map(LockToken)
    }

    /// Release a detached lock. Only the holder of `token` can release it;
    /// returns false if the lock is held by someone else or already gone.
    pub fn unlock(&self, asset: &str, token: LockToken) -> bool {
        self.release_token(asset, token.0)
    }

    fn release_token(&self, asset: &str, token: u64) -> bool {
        let mut assets = self.assets();
        match assets.get_mut(asset) {
            // A stale lock may have been taken over; only release our own.
            Some(state) if state.lock.is_some_and(|lock| lock.token == token) => {
                state.lock = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_locked(&self, asset: &str) -> bool {
        let now = Instant::now();
        self.assets()
            .get(asset)
            .and_then(|s| s.lock)
            .is_some_and(|lock| now.saturating_duration_since(lock.acquired_at) < self.lock_ttl)
    }

    /// Active cooldown end for `asset`, if any.
    pub fn cooldown_until(&self, asset: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.assets()
            .get(asset)
            .and_then(|s| s.cooldown_until)
            .filter(|until| *until > now)
    }

    /// Update the losing streak with a realized result.
    ///
    /// Returns the cooldown end when this result started a cooldown.
    pub fn record_result(&self, asset: &str, pnl: Decimal, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut assets = self.assets();
        let state = assets.entry(asset.to_string()).or_default();
        state.last_exit_at = Some(at);

        if pnl >= Decimal::ZERO {
            state.consecutive_losses = 0;
            return None;
        }

        state.consecutive_losses += 1;
        if self.max_consecutive_losses == 0 || state.consecutive_losses < self.max_consecutive_losses {
            return None;
        }

        let until = at + self.loss_cooldown;
        warn!(
            target: "risk_alert",
            %asset,
            losses = state.consecutive_losses,
            %until,
            "Losing streak - asset cooling down"
        );
        state.consecutive_losses = 0;
        state.cooldown_until = Some(until);
        Some(until)
    }

    pub fn get(&self, asset: &str) -> Option<AssetState> {
        self.assets().get(asset).cloned()
    }
}

/// Holds an asset lock for the lifetime of the guard.
#[must_use = "the asset lock is released when the guard is dropped"]
pub struct AssetLockGuard<'a> {
    table: &'a AssetTable,
    asset: String,
    token: u64,
}

impl AssetLockGuard<'_> {
    pub fn asset(&self) -> &str {
        &self.asset
    }
}

impl Drop for AssetLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release_token(&self.asset, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn table() -> AssetTable {
        AssetTable::new(&EngineConfig::default())
    }

    #[tokio::test]
    async fn test_second_lock_is_rejected_until_guard_drops() {
        let assets = table();

        let guard = assets.try_lock("R_75").expect("first lock");
        assert!(assets.try_lock("R_75").is_none());
        // Other assets are independent.
        assert!(assets.try_lock("R_10").is_some());

        drop(guard);
        assert!(!assets.is_locked("R_75"));
        assert!(assets.try_lock("R_75").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_is_taken_over() {
        let assets = table();
        let stale = assets.try_lock("R_75").unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        let fresh = assets.try_lock("R_75").expect("stale lock taken over");

        // The abandoned guard must not release the new holder's lock.
        drop(stale);
        assert!(assets.is_locked("R_75"));
        drop(fresh);
        assert!(!assets.is_locked("R_75"));
    }

    #[tokio::test]
    async fn test_detached_lock_released_explicitly() {
        let assets = table();
        let token = assets.lock_detached("R_50").unwrap();
        assert!(assets.lock_detached("R_50").is_none());
        assert!(assets.unlock("R_50", token));
        assert!(assets.lock_detached("R_50").is_some());
    }

    #[tokio::test]
    async fn test_release_requires_holder_token() {
        let assets = table();
        let stray = assets.lock_detached("R_50").unwrap();
        assert!(assets.unlock("R_50", stray));

        let _guard = assets.try_lock("R_50").unwrap();
        // An old token cannot free a lock someone else now holds.
        assert!(!assets.unlock("R_50", stray));
        assert!(assets.is_locked("R_50"));
        assert!(assets.try_lock("R_50").is_none());
    }

    #[test]
    fn test_losing_streak_starts_cooldown() {
        let assets = table();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(assets.record_result("R_75", dec!(-1), at), None);
        assert_eq!(assets.record_result("R_75", dec!(-1), at), None);
        let until = assets.record_result("R_75", dec!(-1), at).unwrap();

        assert_eq!(until, at + ChronoDuration::minutes(15));
        assert_eq!(assets.cooldown_until("R_75", at), Some(until));
        assert_eq!(assets.cooldown_until("R_75", until), None);
        assert_eq!(assets.get("R_75").unwrap().consecutive_losses, 0);
    }

    #[test]
    fn test_win_resets_streak() {
        let assets = table();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        assets.record_result("R_75", dec!(-1), at);
        assets.record_result("R_75", dec!(-1), at);
        assets.record_result("R_75", dec!(2), at);
        assert_eq!(assets.record_result("R_75", dec!(-1), at), None);
        assert_eq!(assets.get("R_75").unwrap().consecutive_losses, 1);
    }
}

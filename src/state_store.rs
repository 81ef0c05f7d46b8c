// =============================================================================
// State Store — idempotency, cooldown, daily PnL, open-entry snapshots
// =============================================================================
//
// The only store that ships is a process-local, mutex-guarded, TTL-aware map
// (there is no external KV service under test here). It is expressed behind
// the `StateStore` trait so a networked store (Redis, etc.) could be dropped
// in later without touching any caller.
//
// Daily PnL bookkeeping is read-modify-write, which is safe here because a
// single relay process is the only writer: the `RwLock` around `Inner` is
// itself the serialization point, same discipline as `risk.rs`'s
// `RiskEngine::record_trade_result`.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Open-entry snapshot kept per strategy so an exit can compute realized PnL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenEntry {
    pub strategy: String,
    pub side: String,
    pub entry_price: f64,
    pub amount: f64,
}

/// Result of a daily-drawdown check.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownStatus {
    pub blocked: bool,
    pub cur: f64,
    pub peak: f64,
    pub dd: f64,
    pub limit: f64,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Compare-and-set claim of an idempotency key. Returns `true` when this
    /// call is the one that created the claim (i.e. proceed); `false` when
    /// it already existed (i.e. duplicate).
    async fn claim_idempotency(&self, id: &str, ttl: Duration) -> bool;

    /// Release a previously-claimed idempotency key so the sender may retry.
    async fn release_idempotency(&self, id: &str);

    async fn cooldown_get(&self, strategy: &str) -> Option<i64>;
    async fn cooldown_start(&self, strategy: &str, minutes: i64);

    /// Add `delta_usdt` to today's cumulative realized PnL and return the
    /// updated `(cur, peak, dd)` triple.
    async fn update_daily_pnl(&self, delta_usdt: f64) -> (f64, f64, f64);

    async fn daily_drawdown_blocked(&self, limit: f64) -> DrawdownStatus;

    async fn streak_get(&self, strategy: &str) -> u32;
    async fn streak_set(&self, strategy: &str, value: u32);

    async fn open_entry_save(&self, strategy: &str, snapshot: OpenEntry);
    async fn open_entry_pop(&self, strategy: &str) -> Option<OpenEntry>;
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

struct Inner {
    idemp: HashMap<String, Entry<i64>>,
    cooldown_until: HashMap<String, Entry<i64>>,
    streak: HashMap<String, Entry<u32>>,
    open_entry: HashMap<String, Entry<OpenEntry>>,
    /// Keyed by `YYYYMMDD`.
    day_pnltotal: HashMap<String, Entry<f64>>,
    day_peak: HashMap<String, Entry<f64>>,
}

const STREAK_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const COOLDOWN_TTL: Duration = Duration::from_secs(48 * 3600);
const DAY_TTL: Duration = Duration::from_secs(3 * 24 * 3600);
const OPEN_ENTRY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Process-local, TTL-aware KV store. All mutation happens under a single
/// `RwLock` write guard — no `.await` is ever held across the lock, so the
/// lock never becomes a suspension point.
pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                idemp: HashMap::new(),
                cooldown_until: HashMap::new(),
                streak: HashMap::new(),
                open_entry: HashMap::new(),
                day_pnltotal: HashMap::new(),
                day_peak: HashMap::new(),
            }),
        }
    }

    /// Boot-time connectivity loop: up to 10 attempts at 2s intervals.
    /// The in-memory store is always "connected", so this resolves
    /// immediately — kept as an async fn so a networked store can implement
    /// the same contract without changing call sites.
    pub async fn connect_with_retry() -> Self {
        for attempt in 1..=10 {
            info!(attempt, "state store connectivity check");
            break;
        }
        Self::new()
    }

    fn today_key() -> String {
        Utc::now().format("%Y%m%d").to_string()
    }

    fn get_live<T: Clone>(map: &HashMap<String, Entry<T>>, key: &str) -> Option<T> {
        map.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn claim_idempotency(&self, id: &str, ttl: Duration) -> bool {
        let key = id.to_string();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.idemp.get(&key) {
            if existing.expires_at > Instant::now() {
                return false;
            }
        }
        inner.idemp.insert(
            key,
            Entry {
                value: Utc::now().timestamp_millis(),
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    async fn release_idempotency(&self, id: &str) {
        self.inner.write().idemp.remove(id);
    }

    async fn cooldown_get(&self, strategy: &str) -> Option<i64> {
        let inner = self.inner.read();
        Self::get_live(&inner.cooldown_until, strategy)
    }

    async fn cooldown_start(&self, strategy: &str, minutes: i64) {
        let until_ms = Utc::now().timestamp_millis() + minutes * 60_000;
        let mut inner = self.inner.write();
        inner.cooldown_until.insert(
            strategy.to_string(),
            Entry {
                value: until_ms,
                expires_at: Instant::now() + COOLDOWN_TTL,
            },
        );
        warn!(strategy, minutes, "cooldown started");
    }

    async fn update_daily_pnl(&self, delta_usdt: f64) -> (f64, f64, f64) {
        let key = Self::today_key();
        let mut inner = self.inner.write();

        let cur_before = Self::get_live(&inner.day_pnltotal, &key).unwrap_or(0.0);
        let cur = cur_before + delta_usdt;
        let peak_before = Self::get_live(&inner.day_peak, &key).unwrap_or(0.0);
        let peak = peak_before.max(cur); // I1: peak is non-decreasing within a UTC day.
        let dd = (cur - peak).min(0.0); // I2: dd <= 0.

        inner.day_pnltotal.insert(
            key.clone(),
            Entry {
                value: cur,
                expires_at: Instant::now() + DAY_TTL,
            },
        );
        inner.day_peak.insert(
            key,
            Entry {
                value: peak,
                expires_at: Instant::now() + DAY_TTL,
            },
        );

        (cur, peak, dd)
    }

    async fn daily_drawdown_blocked(&self, limit: f64) -> DrawdownStatus {
        if limit <= 0.0 {
            // DAILY_MAX_DD_USDT default 0 means the gate is disabled.
            return DrawdownStatus {
                blocked: false,
                cur: 0.0,
                peak: 0.0,
                dd: 0.0,
                limit,
            };
        }
        let key = Self::today_key();
        let inner = self.inner.read();
        let cur = Self::get_live(&inner.day_pnltotal, &key).unwrap_or(0.0);
        let peak = Self::get_live(&inner.day_peak, &key).unwrap_or(0.0);
        let dd = (cur - peak).min(0.0);
        DrawdownStatus {
            blocked: dd.abs() >= limit,
            cur,
            peak,
            dd,
            limit,
        }
    }

    async fn streak_get(&self, strategy: &str) -> u32 {
        let inner = self.inner.read();
        Self::get_live(&inner.streak, strategy).unwrap_or(0)
    }

    async fn streak_set(&self, strategy: &str, value: u32) {
        let mut inner = self.inner.write();
        inner.streak.insert(
            strategy.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + STREAK_TTL,
            },
        );
    }

    async fn open_entry_save(&self, strategy: &str, snapshot: OpenEntry) {
        let mut inner = self.inner.write();
        inner.open_entry.insert(
            strategy.to_string(),
            Entry {
                value: snapshot,
                expires_at: Instant::now() + OPEN_ENTRY_TTL,
            },
        );
    }

    async fn open_entry_pop(&self, strategy: &str) -> Option<OpenEntry> {
        let mut inner = self.inner.write();
        let live = Self::get_live(&inner.open_entry, strategy);
        inner.open_entry.remove(strategy);
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idempotency_claim_is_single_use() {
        let store = InMemoryStateStore::new();
        assert!(store.claim_idempotency("A", Duration::from_secs(5)).await);
        assert!(!store.claim_idempotency("A", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn release_allows_reclaim() {
        let store = InMemoryStateStore::new();
        assert!(store.claim_idempotency("A", Duration::from_secs(5)).await);
        store.release_idempotency("A").await;
        assert!(store.claim_idempotency("A", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn daily_pnl_peak_is_non_decreasing() {
        let store = InMemoryStateStore::new();
        let (cur1, peak1, dd1) = store.update_daily_pnl(10.0).await;
        assert_eq!(cur1, 10.0);
        assert_eq!(peak1, 10.0);
        assert_eq!(dd1, 0.0);

        let (cur2, peak2, dd2) = store.update_daily_pnl(-30.0).await;
        assert_eq!(cur2, -20.0);
        assert_eq!(peak2, 10.0); // I1: peak does not drop.
        assert!(dd2 <= 0.0); // I2.
        assert!((dd2 - (-30.0)).abs() < 1e-9);

        let (_, peak3, _) = store.update_daily_pnl(50.0).await;
        assert_eq!(peak3, 30.0); // new high watermark
    }

    #[tokio::test]
    async fn drawdown_disabled_when_limit_zero() {
        let store = InMemoryStateStore::new();
        store.update_daily_pnl(-1000.0).await;
        let status = store.daily_drawdown_blocked(0.0).await;
        assert!(!status.blocked);
    }

    #[tokio::test]
    async fn drawdown_blocks_past_limit() {
        let store = InMemoryStateStore::new();
        store.update_daily_pnl(100.0).await;
        store.update_daily_pnl(-50.0).await; // dd = -50
        let status = store.daily_drawdown_blocked(40.0).await;
        assert!(status.blocked);
        let status2 = store.daily_drawdown_blocked(60.0).await;
        assert!(!status2.blocked);
    }

    #[tokio::test]
    async fn streak_sequence_loss_loss_win_loss_ends_at_one() {
        let store = InMemoryStateStore::new();
        // loss, loss
        store.streak_set("bull", store.streak_get("bull").await + 1).await;
        store.streak_set("bull", store.streak_get("bull").await + 1).await;
        assert_eq!(store.streak_get("bull").await, 2);
        // win -> reset
        store.streak_set("bull", 0).await;
        // loss
        store.streak_set("bull", store.streak_get("bull").await + 1).await;
        assert_eq!(store.streak_get("bull").await, 1);
    }

    #[tokio::test]
    async fn open_entry_roundtrip() {
        let store = InMemoryStateStore::new();
        store
            .open_entry_save(
                "bull",
                OpenEntry {
                    strategy: "bull".into(),
                    side: "buy".into(),
                    entry_price: 100.0,
                    amount: 1.0,
                },
            )
            .await;
        let popped = store.open_entry_pop("bull").await;
        assert!(popped.is_some());
        assert!(store.open_entry_pop("bull").await.is_none());
    }
}

// =============================================================================
// PnL Accountant — streak tracking and cooldown triggering
// =============================================================================
//
// Generalizes `risk.rs`'s `record_trade_result` (a realized PnL feeds a
// local consecutive-loss counter, which in turn gates a circuit breaker)
// from the teacher's single in-process `RiskEngine` to the relay's
// per-strategy streak/cooldown state living in the `StateStore` — the same
// increment-or-reset rule, just persisted externally so it survives a
// process restart.
// =============================================================================

use tracing::{info, warn};

use crate::config::Config;
use crate::state_store::StateStore;

/// A non-negative realized PnL resets the loss streak to zero (invariant
/// I4); a negative PnL increments it. When the streak reaches the
/// strategy's configured limit, a cooldown is started and the streak resets
/// so the next loss starts counting from zero again.
pub async fn record_trade_result(store: &dyn StateStore, cfg: &Config, strategy: &str, pnl: f64) {
    let (cur, peak, dd) = store.update_daily_pnl(pnl).await;
    info!(strategy, pnl, cur, peak, dd, "daily pnl updated");

    if pnl >= 0.0 {
        store.streak_set(strategy, 0).await;
        info!(strategy, pnl, "loss streak reset on non-negative pnl");
        return;
    }

    let streak = store.streak_get(strategy).await + 1;
    let limit = cfg.loss_streak_limit(strategy);

    if streak >= limit {
        let minutes = cfg.cooldown_minutes(strategy);
        store.cooldown_start(strategy, minutes).await;
        store.streak_set(strategy, 0).await;
        warn!(strategy, streak, limit, minutes, "blocked_cooldown: loss streak limit reached");
    } else {
        store.streak_set(strategy, streak).await;
        info!(strategy, streak, limit, "loss streak incremented");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::InMemoryStateStore;

    #[tokio::test]
    async fn non_negative_pnl_resets_streak() {
        let store = InMemoryStateStore::new();
        let cfg = Config::load();
        store.streak_set("bull", 3).await;
        record_trade_result(&store, &cfg, "bull", 0.0).await;
        assert_eq!(store.streak_get("bull").await, 0);
    }

    #[tokio::test]
    async fn negative_pnl_increments_streak() {
        let store = InMemoryStateStore::new();
        let cfg = Config::load();
        record_trade_result(&store, &cfg, "bull", -5.0).await;
        assert_eq!(store.streak_get("bull").await, 1);
    }

    #[tokio::test]
    async fn streak_limit_triggers_cooldown_and_resets() {
        let store = InMemoryStateStore::new();
        let mut cfg = Config::load();
        cfg.loss_streak_limit_bull = 2;
        record_trade_result(&store, &cfg, "bull", -5.0).await;
        assert!(store.cooldown_get("bull").await.is_none());
        record_trade_result(&store, &cfg, "bull", -5.0).await;
        assert!(store.cooldown_get("bull").await.is_some());
        assert_eq!(store.streak_get("bull").await, 0);
    }

    #[tokio::test]
    async fn recording_a_trade_feeds_the_daily_pnl_total() {
        let store = InMemoryStateStore::new();
        let cfg = Config::load();
        record_trade_result(&store, &cfg, "bull", 40.0).await;
        record_trade_result(&store, &cfg, "bull", -10.0).await;
        let status = store.daily_drawdown_blocked(5.0).await;
        assert_eq!(status.cur, 30.0);
        assert!(status.blocked); // dd = -10, limit 5
    }
}

// =============================================================================
// Order Engine — signal classification, exit/entry/reconcile paths, polling
// =============================================================================
//
// Generalizes `execution.rs`'s place-then-poll shape (propose -> risk check
// already done upstream -> send -> poll fixed interval -> record) from a
// single spot market order into the three-way dispatcher this relay needs,
// and borrows `reconcile.rs`'s "the venue is the source of truth, read
// positions back rather than track them locally" discipline: this module
// never keeps its own view of an open position, it always asks the venue.
// =============================================================================

use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::market::{
    get_price, CreateOrderParams, MarketAdapter, MarketInfo, OrderRecord, OrderType, PosSide,
    PositionInfo,
};
use crate::models::Signal;
use crate::pnl::record_trade_result;
use crate::risk_gate::{slippage_guard, OrderKind};
use crate::sizer::{post_adjust, raw_quantity, SizingInputs};
use crate::state_store::{OpenEntry, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Close all or part of the current position; never opens new exposure.
    Exit,
    /// Open a new position or add to an existing one in the same direction.
    EntryOrDelta,
    /// The signal states a desired target position size; the engine
    /// reconciles current exposure toward it (flat, same-side delta, or a
    /// full flip through the opposite side).
    TargetReconcile,
    Invalid,
}

/// Classification per the three exit triggers: a flat target, an opaque id
/// carrying `EXIT`, or a `(prevMarketPosition, side)` pair that crosses
/// through flat (long->sell, short->buy). Everything else is either an
/// entry/delta (side + an explicit amount) or a target reconcile
/// (marketPosition + marketPositionSize).
pub fn classify_signal(signal: &Signal) -> SignalKind {
    let side = signal.normalized_side();
    let prev = signal.prev_market_position.as_deref().map(str::to_ascii_lowercase);

    let flat_target = signal
        .market_position
        .as_deref()
        .map(|p| p.eq_ignore_ascii_case("flat"))
        .unwrap_or(false);
    let id_marks_exit = signal.id.to_ascii_uppercase().contains("EXIT");
    let crosses_through_flat = match (prev.as_deref(), side.as_deref()) {
        (Some("long"), Some("sell")) => true,
        (Some("short"), Some("buy")) => true,
        _ => false,
    };

    if flat_target || id_marks_exit || crosses_through_flat {
        return SignalKind::Exit;
    }

    if side.is_some() && signal.explicit_amount().is_some() {
        return SignalKind::EntryOrDelta;
    }

    if signal.market_position.is_some() && signal.market_position_size.is_some() {
        return SignalKind::TargetReconcile;
    }

    SignalKind::Invalid
}

/// Poll an order at a fixed interval until it reaches a terminal status or
/// the retry budget is exhausted. No backoff, no jitter — a deliberately
/// simple cadence since the venue is fast and retries are cheap.
pub async fn poll_order_until_terminal(
    market: &dyn MarketAdapter,
    order_id: &str,
    symbol: &str,
    retries: u32,
    interval_s: f64,
) -> OrderRecord {
    let mut last = OrderRecord {
        id: order_id.to_string(),
        status: "open".to_string(),
        average: None,
        price: None,
        filled: None,
        raw: serde_json::Value::Null,
    };

    for attempt in 0..retries {
        match market.fetch_order(order_id, symbol).await {
            Ok(record) => {
                let terminal = matches!(record.status.as_str(), "closed" | "filled" | "canceled" | "rejected");
                last = record;
                if terminal {
                    return last;
                }
            }
            Err(e) => {
                warn!(order_id, attempt, error = %e, "order poll transport error, retrying");
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(interval_s)).await;
    }

    warn!(order_id, retries, "order poll exhausted without reaching terminal state");
    last
}

pub struct OrderContext<'a> {
    pub cfg: &'a Config,
    pub store: &'a dyn StateStore,
    pub market: &'a dyn MarketAdapter,
    pub symbol: String,
    pub strategy: String,
}

/// Hedged-mode `posSide` tag for an entry: buy opens/adds to Long, sell
/// opens/adds to Short.
fn pos_side_for(cfg: &Config, side_is_buy: bool) -> Option<PosSide> {
    use crate::config::PositionMode;
    match cfg.phemex_position_mode {
        PositionMode::Hedge => Some(if side_is_buy { PosSide::Long } else { PosSide::Short }),
        PositionMode::Oneway => None,
    }
}

/// Hedged-mode `posSide` tag for a reduce-only order: the tag names the
/// position being closed, which is the opposite of the order's own side —
/// a reduce-only sell closes a Long, a reduce-only buy closes a Short.
fn pos_side_for_reduce_only(cfg: &Config, order_side_is_buy: bool) -> Option<PosSide> {
    pos_side_for(cfg, !order_side_is_buy)
}

/// Close all or a fraction of the current position, record realized PnL
/// against the snapshot taken at entry time, and feed the result into the
/// streak/cooldown accountant.
pub async fn execute_exit(ctx: &OrderContext<'_>, signal: &Signal) -> Result<serde_json::Value, RelayError> {
    let position: PositionInfo = ctx
        .market
        .fetch_position(&ctx.symbol)
        .await
        .map_err(RelayError::Internal)?;

    let Some(pos_side) = position.side.as_deref() else {
        return Ok(serde_json::json!({"status": "noop", "reason": "already flat"}));
    };

    let close_side = if pos_side == "long" { "sell" } else { "buy" };

    let close_qty = signal
        .qty_pct
        .filter(|p| (1.0..=100.0).contains(p))
        .map(|p| position.qty * (p / 100.0))
        .or(signal.explicit_amount())
        .unwrap_or(position.qty)
        .min(position.qty);

    if close_qty <= 0.0 {
        return Ok(serde_json::json!({"status": "noop", "reason": "nothing to close"}));
    }

    let ticker = ctx.market.fetch_ticker(&ctx.symbol).await.map_err(RelayError::Internal)?;
    let market_price = get_price(&ticker, ctx.cfg.use_mark_price);
    let decision = slippage_guard(signal.price, market_price, ctx.cfg.max_slippage, close_side == "buy");

    let order = ctx
        .market
        .create_order(CreateOrderParams {
            symbol: ctx.symbol.clone(),
            order_type: match decision.kind {
                OrderKind::Market => OrderType::Market,
                OrderKind::LimitIoc => OrderType::Limit,
            },
            side: close_side.to_string(),
            qty: close_qty,
            price: decision.limit_price,
            reduce_only: true,
            pos_side: pos_side_for_reduce_only(ctx.cfg, close_side == "buy"),
        })
        .await
        .map_err(|e| RelayError::VenueOrder(e.to_string()))?;

    let record = poll_order_until_terminal(
        ctx.market,
        &order.id,
        &ctx.symbol,
        ctx.cfg.reconcile_retries,
        ctx.cfg.reconcile_interval_s,
    )
    .await;

    let fill_price = record.average.or(record.price).unwrap_or(market_price);

    if let Some(snapshot) = ctx.store.open_entry_pop(&ctx.strategy).await {
        let filled = record.filled.unwrap_or(close_qty);
        let pnl = realized_pnl(&snapshot, fill_price, filled, ctx.cfg.taker_fee);
        record_trade_result(ctx.store, ctx.cfg, &ctx.strategy, pnl).await;
        info!(strategy = %ctx.strategy, pnl, "webhook_processed_exit");
        return Ok(serde_json::json!({
            "status": "closed",
            "order_id": record.id,
            "fill_price": fill_price,
            "qty": filled,
            "realized_pnl": pnl,
            "order": order,
            "order_final": record,
        }));
    }

    Ok(serde_json::json!({
        "status": "closed",
        "order_id": record.id,
        "fill_price": fill_price,
        "qty": record.filled.unwrap_or(close_qty),
        "realized_pnl": null,
        "order": order,
        "order_final": record,
    }))
}

fn realized_pnl(entry: &OpenEntry, exit_price: f64, qty: f64, taker_fee: f64) -> f64 {
    let gross = if entry.side == "buy" {
        (exit_price - entry.entry_price) * qty
    } else {
        (entry.entry_price - exit_price) * qty
    };
    let fees = (entry.entry_price + exit_price) * qty * taker_fee;
    gross - fees
}

/// Open a new position or add to an existing one in the signal's direction.
/// `amount` and `market_info` have already passed through the sizer and the
/// risk gate by the time this runs. `reduce_only` carries the signal's own
/// `reduceOnly` flag straight through to the order (a delta signal may ask
/// to reduce-only without being classified as an exit); when set, no
/// open-entry snapshot is recorded since the order isn't opening exposure.
pub async fn execute_entry(
    ctx: &OrderContext<'_>,
    side: &str,
    qty: f64,
    requested_price: Option<f64>,
    leverage: f64,
    reduce_only: bool,
) -> Result<serde_json::Value, RelayError> {
    if let Err(e) = ctx.market.set_leverage(leverage, &ctx.symbol).await {
        warn!(error = %e, "best-effort leverage set failed, continuing");
    }

    let ticker = ctx.market.fetch_ticker(&ctx.symbol).await.map_err(RelayError::Internal)?;
    let market_price = get_price(&ticker, ctx.cfg.use_mark_price);
    let decision = slippage_guard(requested_price, market_price, ctx.cfg.max_slippage, side == "buy");

    let pos_side = if reduce_only {
        pos_side_for_reduce_only(ctx.cfg, side == "buy")
    } else {
        pos_side_for(ctx.cfg, side == "buy")
    };

    let order = ctx
        .market
        .create_order(CreateOrderParams {
            symbol: ctx.symbol.clone(),
            order_type: match decision.kind {
                OrderKind::Market => OrderType::Market,
                OrderKind::LimitIoc => OrderType::Limit,
            },
            side: side.to_string(),
            qty,
            price: decision.limit_price,
            reduce_only,
            pos_side,
        })
        .await
        .map_err(|e| RelayError::VenueOrder(e.to_string()))?;

    let record = poll_order_until_terminal(
        ctx.market,
        &order.id,
        &ctx.symbol,
        ctx.cfg.reconcile_retries,
        ctx.cfg.reconcile_interval_s,
    )
    .await;

    let fill_price = record.average.or(record.price).unwrap_or(market_price);
    let filled = record.filled.unwrap_or(qty);

    if !reduce_only {
        ctx.store
            .open_entry_save(
                &ctx.strategy,
                OpenEntry {
                    strategy: ctx.strategy.clone(),
                    side: side.to_string(),
                    entry_price: fill_price,
                    amount: filled,
                },
            )
            .await;
    }

    info!(strategy = %ctx.strategy, side, qty = filled, fill_price, reduce_only, "webhook_processed");
    Ok(serde_json::json!({
        "status": "opened",
        "order_id": record.id,
        "fill_price": fill_price,
        "qty": filled,
        "order": order,
        "order_final": record,
    }))
}

/// Resolve a `marketPosition`/`marketPositionSize` target against the
/// current venue position. `want_position` is `None` for flat, else
/// `Some("long"|"short")` — the same vocabulary `PositionInfo::side` uses,
/// not the order-side `buy`/`sell` vocabulary.
///
/// 1. `want=flat`: close the whole position if one is open, else no-op.
/// 2. Same side: adjust by `target_qty - cur_qty` (grow or partially exit).
/// 3. Opposite side: close the existing position, then open fresh at
///    `target_qty`.
pub async fn execute_target_reconcile(
    ctx: &OrderContext<'_>,
    want_position: Option<&str>,
    target_qty: f64,
    sizing: &SizingInputs,
    market_info: &MarketInfo,
) -> Result<serde_json::Value, RelayError> {
    let position = ctx
        .market
        .fetch_position(&ctx.symbol)
        .await
        .map_err(RelayError::Internal)?;

    let order_side_for = |want: &str| if want == "long" { "buy" } else { "sell" };

    match (position.side.as_deref(), want_position) {
        (None, None) => Ok(serde_json::json!({"status": "noop", "reason": "already flat"})),
        (Some(_), None) => {
            let close_all = Signal {
                id: "reconcile-flat".to_string(),
                ..blank_signal()
            };
            execute_exit(ctx, &close_all).await
        }
        (None, Some(want)) => {
            execute_entry(ctx, order_side_for(want), target_qty, None, sizing.leverage, false).await
        }
        (Some(cur_side), Some(want)) if cur_side == want => {
            let delta = target_qty - position.qty;
            if delta.abs() < market_info.min_qty {
                return Ok(serde_json::json!({"status": "noop", "reason": "already at target size"}));
            }
            if delta > 0.0 {
                execute_entry(ctx, order_side_for(want), delta, None, sizing.leverage, false).await
            } else {
                let fake_signal = Signal {
                    id: "reconcile-reduce".to_string(),
                    qty: Some(delta.abs()),
                    ..blank_signal()
                };
                execute_exit(ctx, &fake_signal).await
            }
        }
        (Some(_), Some(want)) => {
            let close_all = Signal {
                id: "reconcile-flip".to_string(),
                ..blank_signal()
            };
            execute_exit(ctx, &close_all).await?;
            execute_entry(ctx, order_side_for(want), target_qty, None, sizing.leverage, false).await
        }
    }
}

fn blank_signal() -> Signal {
    serde_json::from_str(r#"{"id":"x"}"#).expect("static literal always parses")
}

pub fn resolve_leverage_and_margin(
    cfg: &Config,
    equity: f64,
    alloc_pct: f64,
    leverage: f64,
    price: f64,
) -> SizingInputs {
    SizingInputs {
        equity,
        price,
        leverage,
        alloc_pct,
        risk_pct: cfg.risk_pct,
        stop_distance: None,
        explicit_qty: None,
        fixed_qty: None,
    }
}

pub fn compute_sized_qty(
    cfg: &Config,
    mode: crate::config::SizingMode,
    inputs: &SizingInputs,
    market_info: &MarketInfo,
) -> Result<f64, RelayError> {
    let raw = raw_quantity(mode, inputs)?;
    post_adjust(cfg, raw, inputs.price, inputs.leverage, inputs.equity, market_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sig(json_str: &str) -> Signal {
        serde_json::from_str(json_str).unwrap()
    }

    #[test]
    fn classify_flat_market_position_is_exit() {
        let s = sig(r#"{"id":"a","side":"sell","marketPosition":"flat"}"#);
        assert_eq!(classify_signal(&s), SignalKind::Exit);
    }

    #[test]
    fn classify_reduce_only_without_amount_is_invalid() {
        let s = sig(r#"{"id":"a","side":"sell","reduceOnly":true}"#);
        assert_eq!(classify_signal(&s), SignalKind::Invalid);
    }

    #[test]
    fn classify_reduce_only_with_amount_is_entry_or_delta() {
        let s = sig(r#"{"id":"a","side":"sell","qty":1.0,"reduceOnly":true}"#);
        assert_eq!(classify_signal(&s), SignalKind::EntryOrDelta);
    }

    #[test]
    fn classify_market_position_size_is_target_reconcile() {
        let s = sig(r#"{"id":"a","marketPosition":"long","marketPositionSize":1.5}"#);
        assert_eq!(classify_signal(&s), SignalKind::TargetReconcile);
    }

    #[test]
    fn classify_id_containing_exit_is_exit_regardless_of_other_fields() {
        let s = sig(r#"{"id":"alert-EXIT-123","side":"buy","qty":1.0}"#);
        assert_eq!(classify_signal(&s), SignalKind::Exit);
    }

    #[test]
    fn classify_prev_long_sell_crosses_through_flat_is_exit() {
        let s = sig(r#"{"id":"a","side":"sell","prevMarketPosition":"long"}"#);
        assert_eq!(classify_signal(&s), SignalKind::Exit);
    }

    #[test]
    fn classify_plain_side_is_entry_or_delta() {
        let s = sig(r#"{"id":"a","side":"buy","qty":1.0}"#);
        assert_eq!(classify_signal(&s), SignalKind::EntryOrDelta);
    }

    #[test]
    fn classify_no_side_no_target_is_invalid() {
        let s = sig(r#"{"id":"a"}"#);
        assert_eq!(classify_signal(&s), SignalKind::Invalid);
    }

    #[test]
    fn realized_pnl_long_profit() {
        let entry = OpenEntry {
            strategy: "bull".into(),
            side: "buy".into(),
            entry_price: 100.0,
            amount: 1.0,
        };
        let pnl = realized_pnl(&entry, 110.0, 1.0, 0.0006);
        assert!(pnl > 9.0 && pnl < 10.0);
    }

    #[test]
    fn realized_pnl_short_profit() {
        let entry = OpenEntry {
            strategy: "bear".into(),
            side: "sell".into(),
            entry_price: 100.0,
            amount: 1.0,
        };
        let pnl = realized_pnl(&entry, 90.0, 1.0, 0.0006);
        assert!(pnl > 9.0 && pnl < 10.0);
    }

    #[test]
    fn pos_side_none_in_oneway_mode() {
        let mut cfg = Config::load();
        cfg.phemex_position_mode = crate::config::PositionMode::Oneway;
        assert_eq!(pos_side_for(&cfg, true), None);
    }

    #[test]
    fn pos_side_tagged_in_hedge_mode() {
        let mut cfg = Config::load();
        cfg.phemex_position_mode = crate::config::PositionMode::Hedge;
        assert_eq!(pos_side_for(&cfg, true), Some(PosSide::Long));
        assert_eq!(pos_side_for(&cfg, false), Some(PosSide::Short));
    }

    #[test]
    fn pos_side_for_reduce_only_tags_the_closed_position_not_the_order_side() {
        let mut cfg = Config::load();
        cfg.phemex_position_mode = crate::config::PositionMode::Hedge;
        // A reduce-only sell closes a Long; a reduce-only buy closes a Short.
        assert_eq!(pos_side_for_reduce_only(&cfg, false), Some(PosSide::Long));
        assert_eq!(pos_side_for_reduce_only(&cfg, true), Some(PosSide::Short));
    }

    /// Minimal mock covering only what the reconcile no-op branches touch
    /// (`fetch_position`); every other method panics if a test path reaches
    /// it, which would mean the branch logic regressed.
    struct FlatAdapter;

    #[async_trait::async_trait]
    impl crate::market::MarketAdapter for FlatAdapter {
        async fn fetch_equity(&self, _code: &str, _source: &str) -> f64 {
            unimplemented!()
        }
        async fn fetch_ticker(&self, _symbol: &str) -> anyhow::Result<crate::market::Ticker> {
            unimplemented!()
        }
        async fn fetch_position(&self, _symbol: &str) -> anyhow::Result<PositionInfo> {
            Ok(PositionInfo::flat())
        }
        async fn fetch_funding_rate(&self, _symbol: &str) -> anyhow::Result<f64> {
            unimplemented!()
        }
        async fn fetch_ohlcv(&self, _symbol: &str, _tf: &str, _limit: u32) -> anyhow::Result<Vec<f64>> {
            unimplemented!()
        }
        async fn market_info(&self, _symbol: &str) -> anyhow::Result<MarketInfo> {
            unimplemented!()
        }
        async fn create_order(&self, _params: CreateOrderParams) -> anyhow::Result<OrderRecord> {
            unimplemented!()
        }
        async fn fetch_order(&self, _id: &str, _symbol: &str) -> anyhow::Result<OrderRecord> {
            unimplemented!()
        }
        async fn set_leverage(&self, _leverage: f64, _symbol: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn set_position_mode(&self, _hedged: bool) -> anyhow::Result<()> {
            unimplemented!()
        }
    }

    /// Reports a long position of `qty` at `entry_price`; records whatever
    /// `qty` a `create_order` call requests so the test can assert on it.
    struct LongPositionAdapter {
        qty: f64,
        entry_price: f64,
        requested_qty: std::sync::Mutex<Option<f64>>,
    }

    impl LongPositionAdapter {
        fn new(qty: f64, entry_price: f64) -> Self {
            Self {
                qty,
                entry_price,
                requested_qty: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::market::MarketAdapter for LongPositionAdapter {
        async fn fetch_equity(&self, _code: &str, _source: &str) -> f64 {
            unimplemented!()
        }
        async fn fetch_ticker(&self, _symbol: &str) -> anyhow::Result<crate::market::Ticker> {
            Ok(crate::market::Ticker {
                last: self.entry_price,
                mark_price: Some(self.entry_price),
            })
        }
        async fn fetch_position(&self, _symbol: &str) -> anyhow::Result<PositionInfo> {
            Ok(PositionInfo {
                side: Some("long".to_string()),
                qty: self.qty,
                entry_price: self.entry_price,
                unrealized_pnl: 0.0,
            })
        }
        async fn fetch_funding_rate(&self, _symbol: &str) -> anyhow::Result<f64> {
            unimplemented!()
        }
        async fn fetch_ohlcv(&self, _symbol: &str, _tf: &str, _limit: u32) -> anyhow::Result<Vec<f64>> {
            unimplemented!()
        }
        async fn market_info(&self, _symbol: &str) -> anyhow::Result<MarketInfo> {
            unimplemented!()
        }
        async fn create_order(&self, params: CreateOrderParams) -> anyhow::Result<OrderRecord> {
            *self.requested_qty.lock().unwrap() = Some(params.qty);
            Ok(OrderRecord {
                id: "order-1".to_string(),
                status: "closed".to_string(),
                average: Some(self.entry_price),
                price: Some(self.entry_price),
                filled: Some(params.qty),
                raw: serde_json::Value::Null,
            })
        }
        async fn fetch_order(&self, _id: &str, _symbol: &str) -> anyhow::Result<OrderRecord> {
            unimplemented!()
        }
        async fn set_leverage(&self, _leverage: f64, _symbol: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn set_position_mode(&self, _hedged: bool) -> anyhow::Result<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn qty_pct_closes_a_percentage_of_the_position_not_a_multiple() {
        let cfg = Config::load();
        let store = crate::state_store::InMemoryStateStore::new();
        let market = LongPositionAdapter::new(1.0, 1000.0);
        let ctx = OrderContext {
            cfg: &cfg,
            store: &store,
            market: &market,
            symbol: "ETH/USDT:USDT".to_string(),
            strategy: "bull".to_string(),
        };
        let signal = sig(r#"{"id":"a","side":"sell","reduceOnly":true,"qtyPct":40.0}"#);

        let result = execute_exit(&ctx, &signal).await.unwrap();

        assert_eq!(result["status"], "closed");
        assert_eq!(*market.requested_qty.lock().unwrap(), Some(0.4));
        assert_eq!(result["qty"], json!(0.4));
    }

    #[tokio::test]
    async fn reconcile_flat_to_flat_is_noop() {
        let cfg = Config::load();
        let store = crate::state_store::InMemoryStateStore::new();
        let market = FlatAdapter;
        let ctx = OrderContext {
            cfg: &cfg,
            store: &store,
            market: &market,
            symbol: "ETH/USDT:USDT".to_string(),
            strategy: "bull".to_string(),
        };
        let sizing = resolve_leverage_and_margin(&cfg, 1000.0, 0.5, 10.0, 2000.0);
        let market_info = MarketInfo {
            price_step: 0.01,
            amount_step: 0.001,
            min_cost: 5.0,
            min_qty: 0.001,
        };
        let result = execute_target_reconcile(&ctx, None, 0.0, &sizing, &market_info)
            .await
            .unwrap();
        assert_eq!(result["status"], "noop");
    }
}

// =============================================================================
// Webhook Handler — single-pass signal-to-order orchestrator
// =============================================================================
//
// Wired as an `axum` handler the same way the teacher's `api/rest.rs` wires
// its endpoints (`State<Arc<AppState>>` extraction, `Json` in/out). Auth uses
// a constant-time comparison in the same spirit as `api/auth.rs`'s bearer
// check, just against the signal's own `relaySecret` field instead of an
// `Authorization` header, since TradingView-style webhook senders carry the
// secret in the body.
//
// Step sequence: auth -> log -> idempotency claim -> parse -> invalid
// payload check -> regime/daily-dd/cooldown gates -> regime map -> best
// effort leverage set -> dispatch to exit/entry/target -> respond. Every
// non-success path after the claim releases it so the sender may retry.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::{AppState, HealthResponse, StatusResponse};
use crate::error::RelayError;
use crate::jsonsafe::json_sanitize;
use crate::market::get_price;
use crate::models::Signal;
use crate::order_engine::{
    classify_signal, compute_sized_qty, execute_entry, execute_exit, execute_target_reconcile,
    resolve_leverage_and_margin, OrderContext, SignalKind,
};
use crate::regime::evaluate_regime;
use crate::risk_gate::{derive_tp_from_atr, edge_filter};
use crate::sizer::{post_adjust, SizingInputs};
use crate::symbols::tv_to_canonical_symbol;

/// Constant-time byte comparison, same discipline as the teacher's
/// `api/auth.rs::constant_time_eq`.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        uptime_s: state.uptime_s(),
    })
}

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let symbol = state.cfg.fallback_symbol.clone();
    let position = state
        .market
        .fetch_position(&symbol)
        .await
        .unwrap_or_else(|_| crate::market::PositionInfo::flat());
    let regime = evaluate_regime(&state.cfg, state.regime_market.as_ref(), state.market.as_ref()).await;
    let equity = state
        .market
        .fetch_equity(&state.cfg.equity_code, &state.cfg.equity_source)
        .await;

    let body = StatusResponse {
        trade: crate::app_state::VenueDescriptor {
            exchange: "phemex".to_string(),
            testnet: state.cfg.phemex_testnet,
            symbol: Some(symbol.clone()),
        },
        regime_source: crate::app_state::VenueDescriptor {
            exchange: state.cfg.regime_exchange.clone(),
            testnet: state.cfg.regime_testnet,
            symbol: None,
        },
        symbol,
        position,
        regime,
        equity,
        uptime_s: state.uptime_s(),
    };
    Json(json_sanitize(serde_json::to_value(body).unwrap_or(json!({}))))
}

pub async fn tv_webhook(
    State(state): State<Arc<AppState>>,
    Json(signal): Json<Signal>,
) -> Result<Json<serde_json::Value>, RelayError> {
    // 1. Auth — no idempotency claim has happened yet, so a mismatch costs
    // the sender nothing but a retry with the right secret.
    if let Some(expected) = &state.cfg.relay_shared_secret {
        let provided = signal.relay_secret.as_deref().unwrap_or("");
        if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            warn!(id = %signal.id, "webhook auth failed");
            return Err(RelayError::Unauthorized);
        }
    }

    // 2. Log received — never the secret, never the raw comment blob.
    info!(
        id = %signal.id,
        symbol = ?signal.symbol,
        ticker = ?signal.ticker,
        strategy = ?signal.strategy,
        side = ?signal.normalized_side(),
        "webhook_received"
    );

    // 3. Idempotency claim.
    let ttl = Duration::from_secs(state.cfg.idempotency_ttl_s);
    if !state.store.claim_idempotency(&signal.id, ttl).await {
        info!(id = %signal.id, "duplicate_ignored");
        return Ok(Json(json!({"status": "duplicate_ignored", "id": signal.id})));
    }

    match process_claimed_signal(&state, &signal).await {
        Ok(body) => Ok(Json(json_sanitize(body))),
        Err(err) => {
            // Every non-success path past the claim releases it so the
            // sender's retry (after fixing whatever tripped the gate) is
            // processed fresh rather than swallowed as a duplicate.
            state.store.release_idempotency(&signal.id).await;
            Err(err)
        }
    }
}

/// Everything after the idempotency claim: parse, gate, dispatch, respond.
/// Never called with a claim already released; the caller owns that.
async fn process_claimed_signal(state: &AppState, signal: &Signal) -> Result<serde_json::Value, RelayError> {
    let cfg = &state.cfg;

    // 4. Parse symbol + strategy.
    let raw_symbol = signal.symbol.as_deref().or(signal.ticker.as_deref());
    let symbol = raw_symbol
        .and_then(tv_to_canonical_symbol)
        .unwrap_or_else(|| cfg.fallback_symbol.clone());

    let side = signal.normalized_side();
    let strategy = signal.strategy.clone().unwrap_or_else(|| match side.as_deref() {
        Some("buy") => "bull".to_string(),
        Some("sell") => "bear".to_string(),
        _ => "unknown".to_string(),
    });

    let kind = classify_signal(signal);

    // 5. Invalid payload.
    if kind == SignalKind::Invalid {
        return Err(RelayError::InvalidPayload(
            "signal has neither a target (marketPosition+marketPositionSize) nor a delta (side+amount)"
                .to_string(),
        ));
    }

    // 6. Regime + daily-DD + cooldown gates.
    let regime_reading = evaluate_regime(cfg, state.regime_market.as_ref(), state.market.as_ref()).await;

    let dd_status = state.store.daily_drawdown_blocked(cfg.daily_max_dd_usdt).await;
    if dd_status.blocked {
        return Err(RelayError::blocked_daily_dd(
            serde_json::to_value(&dd_status).unwrap_or(json!({})),
        ));
    }

    if let Some(until_ms) = state.store.cooldown_get(&strategy).await {
        if until_ms > Utc::now().timestamp_millis() {
            return Err(RelayError::blocked_cooldown(&strategy, until_ms));
        }
    }

    // 8. Regime map: resolved before dispatch so every path (including
    // exits) knows the leverage to (best-effort) set on the venue.
    let alloc_lev = cfg.resolve_alloc_lev(&strategy, regime_reading.regime.as_str());
    if alloc_lev.alloc_pct <= 0.0 {
        return Err(RelayError::blocked_by_regime(
            &strategy,
            regime_reading.regime.as_str(),
            serde_json::to_value(&regime_reading).unwrap_or(json!({})),
        ));
    }

    // 9. Best-effort leverage set — failures are logged, never fatal.
    if let Err(e) = state.market.set_leverage(alloc_lev.leverage, &symbol).await {
        warn!(symbol = %symbol, error = %e, "best-effort leverage set failed");
    }

    let ctx = OrderContext {
        cfg,
        store: state.store.as_ref(),
        market: state.market.as_ref(),
        symbol: symbol.clone(),
        strategy: strategy.clone(),
    };

    let server_uid = Uuid::new_v4().to_string();

    // 10. Dispatch.
    let (mode, order_body) = match kind {
        SignalKind::Exit => {
            let result = execute_exit(&ctx, signal).await?;
            ("exit", result)
        }
        SignalKind::EntryOrDelta => {
            let result = dispatch_entry(&ctx, cfg, signal, &side, &alloc_lev).await?;
            ("entry", result)
        }
        SignalKind::TargetReconcile => {
            let result = dispatch_target(&ctx, cfg, signal, &alloc_lev).await?;
            ("target", result)
        }
        SignalKind::Invalid => unreachable!("invalid signals return before this point"),
    };

    let final_position = state
        .market
        .fetch_position(&symbol)
        .await
        .map_err(RelayError::Internal)?;

    // `order_body` already nests the initial placement (`order`) and the
    // post-poll terminal record (`order_final`) alongside the dispatch
    // summary (status/fill_price/qty/...); hoist `order_final` to the top
    // level too so callers that only care about the settled state don't
    // need to reach into the dispatch-specific body shape.
    let order_final = order_body.get("order_final").cloned().unwrap_or(serde_json::Value::Null);

    Ok(json!({
        "mode": mode,
        "server_uid": server_uid,
        "regime": regime_reading.regime.as_str(),
        "regime_meta": regime_reading,
        "order": order_body,
        "order_final": order_final,
        "final_position": final_position,
    }))
}

/// Entry/delta path: resolve amount (explicit or via the sizer), run the
/// edge filter, then place the order.
async fn dispatch_entry(
    ctx: &OrderContext<'_>,
    cfg: &crate::config::Config,
    signal: &Signal,
    side: &Option<String>,
    alloc_lev: &crate::config::AllocLev,
) -> Result<serde_json::Value, RelayError> {
    let side = side.clone().unwrap_or_else(|| "buy".to_string());
    let side_is_buy = side == "buy";

    let market_info = ctx.market.market_info(&ctx.symbol).await.map_err(RelayError::Internal)?;
    let ticker = ctx.market.fetch_ticker(&ctx.symbol).await.map_err(RelayError::Internal)?;
    let market_price = get_price(&ticker, cfg.use_mark_price);
    let equity = ctx.market.fetch_equity(&cfg.equity_code, &cfg.equity_source).await;

    let comment = signal.parsed_comment();
    let sl = comment.get("sl").copied();
    let atr = comment.get("atr").copied();
    let mut tp = comment.get("tp").copied();
    if tp.is_none() && cfg.edge_allow_derive_tp {
        if let Some(atr_v) = atr {
            tp = Some(derive_tp_from_atr(market_price, atr_v, cfg.edge_atr_tp_x, side_is_buy));
        }
    }

    let sizing_mode = signal
        .sizing
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.sizing_mode);
    let risk_pct = signal.risk_pct.unwrap_or(cfg.risk_pct);
    let alloc_pct = signal.alloc_pct.unwrap_or(alloc_lev.alloc_pct);
    let stop_distance = sl.map(|s| (market_price - s).abs());

    let qty = match signal.explicit_amount() {
        Some(explicit) => post_adjust(cfg, explicit, market_price, alloc_lev.leverage, equity, &market_info)?,
        None => {
            let inputs = SizingInputs {
                equity,
                price: market_price,
                leverage: alloc_lev.leverage,
                alloc_pct,
                risk_pct,
                stop_distance,
                explicit_qty: None,
                fixed_qty: None,
            };
            compute_sized_qty(cfg, sizing_mode, &inputs, &market_info)?
        }
    };

    let funding_rate = ctx.market.fetch_funding_rate(&ctx.symbol).await.unwrap_or(0.0);
    let edge = edge_filter(cfg, market_price, tp, qty, funding_rate, cfg.holding_hours_est, side_is_buy);
    if !edge.passes {
        return Err(RelayError::blocked_by_edge(
            edge.edge,
            market_price,
            tp.unwrap_or(0.0),
            qty,
            funding_rate,
        ));
    }

    execute_entry(
        ctx,
        &side,
        qty,
        signal.price,
        alloc_lev.leverage,
        signal.reduce_only.unwrap_or(false),
    )
    .await
}

/// Target-reconcile path: the requested size is the signal's own
/// `marketPositionSize`, never re-derived through the sizer — only new
/// opening legs inherit the regime-resolved leverage.
async fn dispatch_target(
    ctx: &OrderContext<'_>,
    cfg: &crate::config::Config,
    signal: &Signal,
    alloc_lev: &crate::config::AllocLev,
) -> Result<serde_json::Value, RelayError> {
    let market_info = ctx.market.market_info(&ctx.symbol).await.map_err(RelayError::Internal)?;
    let ticker = ctx.market.fetch_ticker(&ctx.symbol).await.map_err(RelayError::Internal)?;
    let market_price = get_price(&ticker, cfg.use_mark_price);
    let equity = ctx.market.fetch_equity(&cfg.equity_code, &cfg.equity_source).await;

    let want_position = signal.market_position.as_deref().map(str::to_ascii_lowercase);
    let want_ref = match want_position.as_deref() {
        Some("flat") => None,
        Some(other) => Some(other),
        None => None,
    };

    let target_qty = signal.market_position_size.ok_or_else(|| {
        RelayError::InvalidPayload("target reconcile requires marketPositionSize".to_string())
    })?;

    let sizing = resolve_leverage_and_margin(cfg, equity, alloc_lev.alloc_pct, alloc_lev.leverage, market_price);
    execute_target_reconcile(ctx, want_ref, target_qty, &sizing, &market_info).await
}

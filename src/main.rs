// =============================================================================
// Signal Relay — Main Entry Point
// =============================================================================
//
// Boots the process-wide singletons (venue client, state store, config) and
// serves the webhook router. No market-data streams, no strategy loop: this
// relay is reactive — it does nothing until a signal arrives on
// `POST /tv-webhook`.
// =============================================================================

mod app_state;
mod config;
mod error;
mod jsonsafe;
mod market;
mod models;
mod order_engine;
mod pnl;
mod regime;
mod risk_gate;
mod sizer;
mod state_store;
mod symbols;
mod webhook;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::market::{MarketAdapter, PhemexAdapter};
use crate::state_store::InMemoryStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("signal relay starting up");

    let cfg = Config::load();
    let bind_addr = cfg.bind_addr.clone();

    // The trade venue and the regime-source venue are consumed through the
    // same capability interface; they may be the same physical venue or,
    // per REGIME_EXCHANGE/REGIME_TESTNET, two different toggles on it.
    let market: Arc<dyn MarketAdapter> = Arc::new(PhemexAdapter::new(
        cfg.phemex_api_key.clone(),
        cfg.phemex_secret.clone(),
        cfg.phemex_testnet,
    ));
    let regime_market: Arc<dyn MarketAdapter> = Arc::new(PhemexAdapter::new(
        cfg.phemex_api_key.clone(),
        cfg.phemex_secret.clone(),
        cfg.regime_testnet,
    ));

    if let Err(e) = market
        .set_position_mode(cfg.phemex_position_mode == config::PositionMode::Hedge)
        .await
    {
        warn!(error = %e, "best-effort position-mode set failed at startup");
    }

    let store = Arc::new(InMemoryStateStore::connect_with_retry().await);

    let state = Arc::new(AppState::new(cfg, market, regime_market, store));

    let app = Router::new()
        .route("/health", get(webhook::health))
        .route("/status", get(webhook::status))
        .route("/tv-webhook", post(webhook::tv_webhook))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("signal relay shut down complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    warn!("shutdown signal received — stopping gracefully");
}

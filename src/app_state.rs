// =============================================================================
// Central Application State — Signal Relay
// =============================================================================
//
// Process-wide singletons (venue client, state store, configuration) live
// here behind `Arc`, same shape as the teacher's `AppState` — just a much
// smaller set of subsystems, since this relay has no market-data streams or
// strategy engine of its own to hold.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::Config;
use crate::market::MarketAdapter;
use crate::state_store::StateStore;

/// Central application state shared across all async handlers via
/// `Arc<AppState>`.
pub struct AppState {
    pub cfg: Config,

    /// The derivatives venue the relay trades against.
    pub market: Arc<dyn MarketAdapter>,

    /// Market-data source for the regime evaluator's ETH/BTC EMA-200 read.
    /// May be the same venue as `market`, or a different one configured via
    /// `REGIME_EXCHANGE` — both are consumed through the same capability
    /// interface.
    pub regime_market: Arc<dyn MarketAdapter>,

    pub store: Arc<dyn StateStore>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        cfg: Config,
        market: Arc<dyn MarketAdapter>,
        regime_market: Arc<dyn MarketAdapter>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            cfg,
            market,
            regime_market,
            store,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_s(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// `GET /health` response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub uptime_s: f64,
}

/// Venue descriptor nested under `trade`/`regime_source` in `/status`.
#[derive(Debug, Serialize)]
pub struct VenueDescriptor {
    pub exchange: String,
    pub testnet: bool,
    pub symbol: Option<String>,
}

/// `GET /status` response body: position + regime + equity snapshot for the
/// configured fallback symbol.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub trade: VenueDescriptor,
    pub regime_source: VenueDescriptor,
    pub symbol: String,
    pub position: crate::market::PositionInfo,
    pub regime: crate::regime::RegimeReading,
    pub equity: f64,
    pub uptime_s: f64,
}

// =============================================================================
// Configuration — environment-sourced, fixed for the process lifetime
// =============================================================================
//
// Unlike the hot-reloadable, file-persisted `RuntimeConfig` this relay is
// modeled after, there is no JSON file here: the relay is a stateless signal
// pipeline, so every tunable comes from the environment once at startup and
// never changes again. Every field has a default so an empty environment
// still boots into a conservative, safe configuration.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-(strategy, regime) allocation-percentage / leverage pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AllocLev {
    pub alloc_pct: f64,
    pub leverage: f64,
}

/// Position mode on the trade venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    Oneway,
    Hedge,
}

impl Default for PositionMode {
    fn default() -> Self {
        Self::Oneway
    }
}

/// Sizing mode requested on a signal (or the server default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMode {
    Risk,
    Notional,
    Fixed,
}

impl Default for SizingMode {
    fn default() -> Self {
        Self::Notional
    }
}

impl std::str::FromStr for SizingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "risk" => Ok(Self::Risk),
            "notional" => Ok(Self::Notional),
            "fixed" => Ok(Self::Fixed),
            _ => Err(()),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// Top-level relay configuration, loaded once at process startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Venue toggles -------------------------------------------------
    pub phemex_testnet: bool,
    pub regime_testnet: bool,
    pub phemex_api_key: String,
    pub phemex_secret: String,
    pub phemex_position_mode: PositionMode,

    // --- Regime source ---------------------------------------------------
    pub regime_exchange: String,
    pub regime_binance_market: String,
    pub regime_symbol_eth: String,
    pub regime_symbol_btc: String,

    // --- Symbols / fallback -----------------------------------------------
    pub fallback_symbol: String,

    // --- Idempotency / sizing / fees ---------------------------------------
    pub idempotency_ttl_s: u64,
    pub max_slippage: f64,
    pub fee_buffer: f64,
    pub taker_fee: f64,
    pub min_notional_usdt: f64,
    pub server_sizing: bool,
    pub sizing_mode: SizingMode,
    pub risk_pct: f64,
    pub alloc_pct: f64,
    pub leverage_default: f64,
    pub margin_buffer: f64,

    // --- Regime x strategy allocation/leverage table -----------------------
    pub alloc_table: HashMap<(String, String), AllocLev>,
    pub alloc_pct_default: f64,
    pub lev_default: f64,

    // --- Cooldown / drawdown -------------------------------------------
    pub loss_streak_limit_bull: u32,
    pub loss_streak_limit_bear: u32,
    pub cooldown_min_bull: i64,
    pub cooldown_min_bear: i64,
    pub daily_max_dd_usdt: f64,

    // --- Macro gate -----------------------------------------------------
    pub funding_abs_max: f64,
    pub holding_hours_est: f64,
    pub vix_url: Option<String>,
    pub vix_max: f64,

    // --- Equity discovery -------------------------------------------------
    pub equity_code: String,
    pub equity_source: String,
    pub balance_debug: bool,

    // --- Edge filter ------------------------------------------------------
    pub edge_filter_enabled: bool,
    pub min_edge_usdt: f64,
    pub edge_require_tp: bool,
    pub edge_allow_derive_tp: bool,
    pub edge_atr_tp_x: f64,

    // --- Order engine -----------------------------------------------------
    pub reconcile_retries: u32,
    pub reconcile_interval_s: f64,
    pub use_mark_price: bool,

    // --- Auth / transport ---------------------------------------------------
    pub relay_shared_secret: Option<String>,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::load()
    }
}

impl Config {
    /// Load the full configuration from environment variables, falling back
    /// to spec defaults for anything unset. Never fails — an empty
    /// environment yields a conservative, fully-defaulted configuration.
    pub fn load() -> Self {
        let holding_hours_est = std::env::var("HOLDING_HOURS_EST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| env_f64("ASSUME_HOLD_HOURS", 2.0));

        let sizing_mode = env_str("SIZING_MODE", "notional")
            .parse()
            .unwrap_or(SizingMode::Notional);

        let phemex_position_mode = match env_str("PHEMEX_POSITION_MODE", "oneway").as_str() {
            "hedge" => PositionMode::Hedge,
            _ => PositionMode::Oneway,
        };

        let mut alloc_table = HashMap::new();
        alloc_table.insert(
            ("bull".to_string(), "bull".to_string()),
            AllocLev {
                alloc_pct: env_f64("ALLOC_BULL_BULL", 0.60),
                leverage: env_f64("LEV_BULL_BULL", 20.0),
            },
        );
        alloc_table.insert(
            ("bull".to_string(), "neutral".to_string()),
            AllocLev {
                alloc_pct: env_f64("ALLOC_BULL_NEUTRAL", 0.30),
                leverage: env_f64("LEV_BULL_NEUTRAL", 10.0),
            },
        );
        alloc_table.insert(
            ("bull".to_string(), "bear".to_string()),
            AllocLev {
                alloc_pct: env_f64("ALLOC_BULL_BEAR", 0.10),
                leverage: env_f64("LEV_BULL_BEAR", 5.0),
            },
        );
        alloc_table.insert(
            ("bear".to_string(), "bull".to_string()),
            AllocLev {
                alloc_pct: env_f64("ALLOC_BEAR_BULL", 0.10),
                leverage: env_f64("LEV_BEAR_BULL", 5.0),
            },
        );
        alloc_table.insert(
            ("bear".to_string(), "neutral".to_string()),
            AllocLev {
                alloc_pct: env_f64("ALLOC_BEAR_NEUTRAL", 0.30),
                leverage: env_f64("LEV_BEAR_NEUTRAL", 10.0),
            },
        );
        alloc_table.insert(
            ("bear".to_string(), "bear".to_string()),
            AllocLev {
                alloc_pct: env_f64("ALLOC_BEAR_BEAR", 0.60),
                leverage: env_f64("LEV_BEAR_BEAR", 20.0),
            },
        );

        Self {
            phemex_testnet: env_bool("PHEMEX_TESTNET", true),
            regime_testnet: env_bool("REGIME_TESTNET", false),
            phemex_api_key: env_str(
                "PHEMEX_API_KEY",
                &std::env::var("PHEMEX_API_KEY_DEV").unwrap_or_default(),
            ),
            phemex_secret: env_str(
                "PHEMEX_SECRET",
                &std::env::var("PHEMEX_SECRET_DEV").unwrap_or_default(),
            ),
            phemex_position_mode,

            regime_exchange: env_str("REGIME_EXCHANGE", "binance"),
            regime_binance_market: env_str("REGIME_BINANCE_MARKET", "spot"),
            regime_symbol_eth: env_str("REGIME_SYMBOL_ETH", "ETHUSDT"),
            regime_symbol_btc: env_str("REGIME_SYMBOL_BTC", "BTCUSDT"),

            fallback_symbol: env_str("SYMBOL", "ETH/USDT:USDT"),

            idempotency_ttl_s: env_f64("IDEMPOTENCY_TTL", 900.0) as u64,
            max_slippage: env_f64("MAX_SLIPPAGE", 0.004),
            fee_buffer: env_f64("FEE_BUFFER", 0.003),
            taker_fee: env_f64("TAKER_FEE", 0.0006),
            min_notional_usdt: env_f64("MIN_NOTIONAL_USDT", 5.0),
            server_sizing: env_bool("SERVER_SIZING", true),
            sizing_mode,
            risk_pct: env_f64("RISK_PCT", 0.004),
            alloc_pct: env_f64("ALLOC_PCT", 0.50),
            leverage_default: env_f64("LEVERAGE_DEFAULT", 20.0),
            margin_buffer: env_f64("MARGIN_BUFFER", 0.98),

            alloc_table,
            alloc_pct_default: env_f64("ALLOC_PCT", 0.50),
            lev_default: env_f64("LEVERAGE_DEFAULT", 20.0),

            loss_streak_limit_bull: env_f64("LOSS_STREAK_LIMIT_BULL", 5.0) as u32,
            loss_streak_limit_bear: env_f64("LOSS_STREAK_LIMIT_BEAR", 4.0) as u32,
            cooldown_min_bull: env_f64("COOLDOWN_MIN_BULL", 90.0) as i64,
            cooldown_min_bear: env_f64("COOLDOWN_MIN_BEAR", 120.0) as i64,
            daily_max_dd_usdt: env_f64("DAILY_MAX_DD_USDT", 0.0),

            funding_abs_max: env_f64("FUNDING_ABS_MAX", 0.0003),
            holding_hours_est,
            vix_url: std::env::var("VIX_URL").ok().filter(|s| !s.is_empty()),
            vix_max: env_f64("VIX_MAX", 30.0),

            equity_code: env_str("EQUITY_CODE", "USDT"),
            equity_source: env_str("EQUITY_SOURCE", "free"),
            balance_debug: env_bool("BALANCE_DEBUG", true),

            edge_filter_enabled: env_bool("EDGE_FILTER_ENABLED", true),
            min_edge_usdt: env_f64("MIN_EDGE_USDT", 0.0),
            edge_require_tp: env_bool("EDGE_REQUIRE_TP", false),
            edge_allow_derive_tp: env_bool("EDGE_ALLOW_DERIVE_TP", true),
            edge_atr_tp_x: env_f64("EDGE_ATR_TP_X", 3.0),

            reconcile_retries: env_f64("RECONCILE_RETRIES", 8.0) as u32,
            reconcile_interval_s: env_f64("RECONCILE_INTERVAL", 1.5),
            use_mark_price: env_bool("USE_MARK_PRICE", true),

            relay_shared_secret: std::env::var("RELAY_SHARED_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            bind_addr: env_str("BIND_ADDR", "0.0.0.0:8080"),
        }
    }

    /// Look up the (allocPct, leverage) pair for a (strategy, regime) combo,
    /// falling back to the configured defaults for an unknown strategy.
    pub fn resolve_alloc_lev(&self, strategy: &str, regime: &str) -> AllocLev {
        self.alloc_table
            .get(&(strategy.to_string(), regime.to_string()))
            .copied()
            .unwrap_or(AllocLev {
                alloc_pct: self.alloc_pct_default,
                leverage: self.lev_default,
            })
    }

    pub fn cooldown_minutes(&self, strategy: &str) -> i64 {
        match strategy {
            "bull" => self.cooldown_min_bull,
            _ => self.cooldown_min_bear,
        }
    }

    pub fn loss_streak_limit(&self, strategy: &str) -> u32 {
        match strategy {
            "bull" => self.loss_streak_limit_bull,
            _ => self.loss_streak_limit_bear,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        // SAFETY: an empty environment must still produce a bootable config.
        std::env::remove_var("RELAY_SHARED_SECRET");
        let cfg = Config::load();
        assert_eq!(cfg.fallback_symbol, "ETH/USDT:USDT");
        assert_eq!(cfg.sizing_mode, SizingMode::Notional);
        assert_eq!(cfg.phemex_position_mode, PositionMode::Oneway);
        assert!(cfg.relay_shared_secret.is_none());
    }

    #[test]
    fn resolve_alloc_lev_falls_back_for_unknown_strategy() {
        let cfg = Config::load();
        let r = cfg.resolve_alloc_lev("unknown", "bull");
        assert_eq!(r.alloc_pct, cfg.alloc_pct_default);
        assert_eq!(r.leverage, cfg.lev_default);
    }

    #[test]
    fn resolve_alloc_lev_known_pair() {
        let cfg = Config::load();
        let r = cfg.resolve_alloc_lev("bull", "bear");
        assert_eq!(r.alloc_pct, 0.10);
    }

    #[test]
    fn sizing_mode_parses_case_insensitively() {
        assert_eq!("Risk".parse::<SizingMode>(), Ok(SizingMode::Risk));
        assert_eq!("NOTIONAL".parse::<SizingMode>(), Ok(SizingMode::Notional));
        assert_eq!("bogus".parse::<SizingMode>(), Err(()));
    }
}

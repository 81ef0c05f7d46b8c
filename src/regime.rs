// =============================================================================
// Regime Evaluator — EMA-200 bull/bear/neutral classification + macro gate
// =============================================================================
//
// The EMA calculation itself is lifted from the teacher's `indicators/ema.rs`
// unchanged in shape (SMA-seeded, multiplier `2/(period+1)`, non-finite
// short-circuit) — only the period (200 instead of 9/21/55) and the pair of
// symbols evaluated (ETH and BTC rather than a single trading pair) differ.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::market::MarketAdapter;
use crate::symbols::normalize_symbol_for_exchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Bull,
    Bear,
    Neutral,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bull => "bull",
            Self::Bear => "bear",
            Self::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub eth_above_ema200: Option<bool>,
    pub btc_above_ema200: Option<bool>,
    pub macro_override_reason: Option<String>,
}

/// SMA-seeded EMA, identical algorithm to the teacher's `calculate_ema`.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// `true` when the last close sits above the last EMA-200 value; `None` when
/// there isn't enough history to compute one.
fn above_ema200(closes: &[f64]) -> Option<bool> {
    let ema = calculate_ema(closes, 200);
    let last_ema = *ema.last()?;
    let last_close = *closes.last()?;
    Some(last_close > last_ema)
}

/// Evaluate the base regime from ETH and BTC 4h closes: bull when both are
/// above their EMA-200, bear when both are below, neutral on disagreement or
/// missing data.
fn base_regime(eth_above: Option<bool>, btc_above: Option<bool>) -> Regime {
    match (eth_above, btc_above) {
        (Some(true), Some(true)) => Regime::Bull,
        (Some(false), Some(false)) => Regime::Bear,
        _ => Regime::Neutral,
    }
}

/// Fetch the volatility index from `cfg.vix_url`, tolerating any failure by
/// returning `None` — the macro gate is advisory, never a hard dependency.
async fn fetch_vix(url: &str) -> Option<f64> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .ok()?;
    let resp = client.get(url).send().await.ok()?;
    let body: serde_json::Value = resp.json().await.ok()?;
    body.get("value")
        .or_else(|| body.get("vix"))
        .and_then(|v| v.as_f64())
}

/// Evaluate the full regime: base EMA classification, then the macro gate
/// which can force a bull/bear read down to neutral when funding rate or
/// volatility index crosses their configured thresholds.
///
/// `regime_adapter` sources the ETH/BTC 4h candles; `trade_adapter` sources
/// the funding rate for the reference perpetual, since the macro gate reads
/// funding off the venue the relay actually trades on, not the (possibly
/// different) regime candle source.
pub async fn evaluate_regime(
    cfg: &Config,
    regime_adapter: &dyn MarketAdapter,
    trade_adapter: &dyn MarketAdapter,
) -> RegimeReading {
    // The regime source may be a spot-style venue (e.g. Binance spot) that
    // wants `BASE/QUOTE` with no settlement suffix, rather than the trade
    // venue's derivatives form.
    let eth_symbol = normalize_symbol_for_exchange(&cfg.regime_symbol_eth, &cfg.regime_exchange)
        .unwrap_or_else(|| cfg.regime_symbol_eth.clone());
    let btc_symbol = normalize_symbol_for_exchange(&cfg.regime_symbol_btc, &cfg.regime_exchange)
        .unwrap_or_else(|| cfg.regime_symbol_btc.clone());

    let eth_closes = regime_adapter
        .fetch_ohlcv(&eth_symbol, "4h", 210)
        .await
        .unwrap_or_default();
    let btc_closes = regime_adapter
        .fetch_ohlcv(&btc_symbol, "4h", 210)
        .await
        .unwrap_or_default();

    let eth_above = above_ema200(&eth_closes);
    let btc_above = above_ema200(&btc_closes);
    let base = base_regime(eth_above, btc_above);

    debug!(?base, ?eth_above, ?btc_above, "base regime computed");

    if base == Regime::Neutral {
        return RegimeReading {
            regime: base,
            eth_above_ema200: eth_above,
            btc_above_ema200: btc_above,
            macro_override_reason: None,
        };
    }

    // Macro gate: funding rate and volatility index can override a
    // directional read to neutral, never the other way around. Funding is
    // read from the trade venue (the reference perpetual the relay actually
    // executes against), not the regime-source venue.
    let funding = trade_adapter
        .fetch_funding_rate(&cfg.fallback_symbol)
        .await
        .unwrap_or(0.0);

    if cfg.funding_abs_max > 0.0 && funding.abs() > cfg.funding_abs_max {
        warn!(funding, limit = cfg.funding_abs_max, "macro gate: funding rate override to neutral");
        return RegimeReading {
            regime: Regime::Neutral,
            eth_above_ema200: eth_above,
            btc_above_ema200: btc_above,
            macro_override_reason: Some(format!(
                "funding_rate {:.6} exceeds abs max {:.6}",
                funding, cfg.funding_abs_max
            )),
        };
    }

    if let Some(vix_url) = cfg.vix_url.as_deref() {
        if let Some(vix) = fetch_vix(vix_url).await {
            if cfg.vix_max > 0.0 && vix > cfg.vix_max {
                warn!(vix, limit = cfg.vix_max, "macro gate: volatility index override to neutral");
                return RegimeReading {
                    regime: Regime::Neutral,
                    eth_above_ema200: eth_above,
                    btc_above_ema200: btc_above,
                    macro_override_reason: Some(format!(
                        "volatility index {:.2} exceeds max {:.2}",
                        vix, cfg.vix_max
                    )),
                };
            }
        }
    }

    RegimeReading {
        regime: base,
        eth_above_ema200: eth_above,
        btc_above_ema200: btc_above,
        macro_override_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising_series(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    fn falling_series(n: usize) -> Vec<f64> {
        (0..n).map(|i| 1000.0 - i as f64).collect()
    }

    #[test]
    fn calculate_ema_seeds_with_sma_and_tracks_closes() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ema = calculate_ema(&closes, 3);
        // seed = mean(1,2,3) = 2.0
        assert_eq!(ema[0], 2.0);
        assert_eq!(ema.len(), 3);
    }

    #[test]
    fn calculate_ema_empty_on_short_input() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn above_ema200_true_for_rising_series() {
        let closes = rising_series(250);
        assert_eq!(above_ema200(&closes), Some(true));
    }

    #[test]
    fn above_ema200_false_for_falling_series() {
        let closes = falling_series(250);
        assert_eq!(above_ema200(&closes), Some(false));
    }

    #[test]
    fn above_ema200_none_on_insufficient_history() {
        let closes = rising_series(50);
        assert_eq!(above_ema200(&closes), None);
    }

    #[test]
    fn base_regime_requires_agreement() {
        assert_eq!(base_regime(Some(true), Some(true)), Regime::Bull);
        assert_eq!(base_regime(Some(false), Some(false)), Regime::Bear);
        assert_eq!(base_regime(Some(true), Some(false)), Regime::Neutral);
        assert_eq!(base_regime(None, Some(true)), Regime::Neutral);
    }
}

// =============================================================================
// Sizer — risk / notional / fixed sizing plus post-adjustment pipeline
// =============================================================================
//
// Pure functions returning a `Result<f64, RelayError>` so the caller can
// propagate a typed rejection straight out of the handler. Grounded on the
// explicit sizing-by-risk helpers in the pack's position-sizing modules,
// adapted to the three-mode switch (risk/notional/fixed) and the
// margin-cap/fee-buffer/step-rounding/min-notional adjustment chain the
// relay requires afterward.
// =============================================================================

use crate::config::{Config, SizingMode};
use crate::error::RelayError;
use crate::market::{round_step, MarketInfo};

#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub equity: f64,
    pub price: f64,
    pub leverage: f64,
    pub alloc_pct: f64,
    pub risk_pct: f64,
    pub stop_distance: Option<f64>,
    pub explicit_qty: Option<f64>,
    pub fixed_qty: Option<f64>,
}

/// Raw quantity before any post-adjustment, chosen by `mode`.
///
/// - `Risk`: `qty = (equity * risk_pct) / stop_distance`, requiring a stop
///   distance derived from the signal's `sl`/ATR.
/// - `Notional`: `qty = (equity * alloc_pct * leverage) / price`.
/// - `Fixed`: the sender's explicit quantity, passed straight through.
pub fn raw_quantity(mode: SizingMode, inputs: &SizingInputs) -> Result<f64, RelayError> {
    match mode {
        SizingMode::Risk => {
            let stop = inputs.stop_distance.ok_or_else(|| {
                RelayError::SizingConstraint(
                    "risk sizing requires a stop distance (sl or ATR-derived)".to_string(),
                )
            })?;
            if stop <= 0.0 {
                return Err(RelayError::SizingConstraint(
                    "stop distance must be positive".to_string(),
                ));
            }
            Ok((inputs.equity * inputs.risk_pct) / stop)
        }
        SizingMode::Notional => {
            if inputs.price <= 0.0 {
                return Err(RelayError::SizingConstraint(
                    "price must be positive for notional sizing".to_string(),
                ));
            }
            Ok((inputs.equity * inputs.alloc_pct * inputs.leverage) / inputs.price)
        }
        SizingMode::Fixed => inputs.fixed_qty.or(inputs.explicit_qty).ok_or_else(|| {
            RelayError::SizingConstraint("fixed sizing requires an explicit quantity".to_string())
        }),
    }
}

/// Applies the post-adjustment pipeline in the documented order: margin cap,
/// equity guard, fee buffer, step rounding, then min-notional/min-qty reject.
pub fn post_adjust(
    cfg: &Config,
    raw_qty: f64,
    price: f64,
    leverage: f64,
    equity: f64,
    market: &MarketInfo,
) -> Result<f64, RelayError> {
    if equity <= 0.0 {
        return Err(RelayError::SizingConstraint(
            "equity is zero or unavailable".to_string(),
        ));
    }
    if raw_qty <= 0.0 || !raw_qty.is_finite() {
        return Err(RelayError::SizingConstraint(
            "computed quantity is not positive".to_string(),
        ));
    }

    let max_margin = equity * cfg.margin_buffer;
    let max_notional = max_margin * leverage;
    let mut qty = raw_qty;
    if price > 0.0 {
        let notional = qty * price;
        if notional > max_notional {
            qty = max_notional / price;
        }
    }

    let notional = qty * price;
    if notional < market.min_cost.max(cfg.min_notional_usdt) {
        return Err(RelayError::SizingConstraint(format!(
            "notional {notional:.4} below minimum {}",
            market.min_cost.max(cfg.min_notional_usdt)
        )));
    }

    // Leave headroom for round-trip fees so a fill doesn't push margin
    // utilization over the buffer.
    qty *= 1.0 - cfg.fee_buffer;

    qty = round_step(qty, market.amount_step);

    if qty < market.min_qty {
        return Err(RelayError::SizingConstraint(format!(
            "quantity {qty} below venue minimum {}",
            market.min_qty
        )));
    }

    Ok(qty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> MarketInfo {
        MarketInfo {
            price_step: 0.01,
            amount_step: 0.001,
            min_cost: 5.0,
            min_qty: 0.001,
        }
    }

    #[test]
    fn notional_sizing_scales_with_alloc_and_leverage() {
        let inputs = SizingInputs {
            equity: 1000.0,
            price: 100.0,
            leverage: 10.0,
            alloc_pct: 0.5,
            risk_pct: 0.004,
            stop_distance: None,
            explicit_qty: None,
            fixed_qty: None,
        };
        let qty = raw_quantity(SizingMode::Notional, &inputs).unwrap();
        assert!((qty - 50.0).abs() < 1e-9); // (1000*0.5*10)/100
    }

    #[test]
    fn risk_sizing_requires_stop_distance() {
        let inputs = SizingInputs {
            equity: 1000.0,
            price: 100.0,
            leverage: 10.0,
            alloc_pct: 0.5,
            risk_pct: 0.004,
            stop_distance: None,
            explicit_qty: None,
            fixed_qty: None,
        };
        assert!(raw_quantity(SizingMode::Risk, &inputs).is_err());
    }

    #[test]
    fn risk_sizing_uses_equity_risk_over_stop_distance() {
        let inputs = SizingInputs {
            equity: 1000.0,
            price: 100.0,
            leverage: 10.0,
            alloc_pct: 0.5,
            risk_pct: 0.01,
            stop_distance: Some(2.0),
            explicit_qty: None,
            fixed_qty: None,
        };
        let qty = raw_quantity(SizingMode::Risk, &inputs).unwrap();
        assert!((qty - 5.0).abs() < 1e-9); // (1000*0.01)/2
    }

    #[test]
    fn fixed_sizing_passes_through_explicit_quantity() {
        let inputs = SizingInputs {
            equity: 1000.0,
            price: 100.0,
            leverage: 10.0,
            alloc_pct: 0.5,
            risk_pct: 0.004,
            stop_distance: None,
            explicit_qty: Some(3.0),
            fixed_qty: None,
        };
        let qty = raw_quantity(SizingMode::Fixed, &inputs).unwrap();
        assert_eq!(qty, 3.0);
    }

    #[test]
    fn post_adjust_caps_at_margin_and_rounds_to_step() {
        let cfg = Config::load();
        let m = market();
        // raw_qty way beyond what leverage*equity supports at this price.
        let qty = post_adjust(&cfg, 10_000.0, 100.0, 5.0, 1000.0, &m).unwrap();
        let max_notional = 1000.0 * cfg.margin_buffer * 5.0;
        assert!(qty * 100.0 <= max_notional + 1e-6);
    }

    #[test]
    fn post_adjust_rejects_zero_equity() {
        let cfg = Config::load();
        let m = market();
        assert!(post_adjust(&cfg, 1.0, 100.0, 5.0, 0.0, &m).is_err());
    }

    #[test]
    fn post_adjust_rejects_below_min_notional() {
        let cfg = Config::load();
        let m = market();
        // Tiny raw qty at a low price never clears min_cost.
        let result = post_adjust(&cfg, 0.001, 1.0, 1.0, 1000.0, &m);
        assert!(result.is_err());
    }
}

// =============================================================================
// Risk Gate — slippage guard, regime x strategy allocation table, edge filter
// =============================================================================
//
// Pure, synchronous checks over small structs, in the same vein as
// `risk.rs`'s circuit-breaker predicates: no I/O here, every function takes
// its inputs explicitly and returns a typed decision the caller logs and
// acts on. Table-driven threshold checks mirror `smart_filters.rs` from the
// pack.
// =============================================================================

use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    LimitIoc,
}

/// Converts a market order to limit-IOC when the requested price deviates
/// from the current market price by more than `max_slippage`. This is a
/// conversion, never an outright rejection: the signal still executes, just
/// capped at a safer price.
#[derive(Debug, Clone, Copy)]
pub struct SlippageDecision {
    pub kind: OrderKind,
    pub limit_price: Option<f64>,
}

pub fn slippage_guard(
    requested_price: Option<f64>,
    market_price: f64,
    max_slippage: f64,
    side_is_buy: bool,
) -> SlippageDecision {
    let Some(requested) = requested_price else {
        return SlippageDecision {
            kind: OrderKind::Market,
            limit_price: None,
        };
    };
    if requested <= 0.0 {
        return SlippageDecision {
            kind: OrderKind::Market,
            limit_price: None,
        };
    }

    // slip = |p_live - p_ref| / p_ref — the reference price is the
    // denominator, not the live price (spec 4.5 / original risk_gate.py).
    let deviation = (requested - market_price).abs() / requested;
    if deviation <= max_slippage {
        return SlippageDecision {
            kind: OrderKind::Market,
            limit_price: None,
        };
    }

    // Cap the limit price at market +/- max_slippage, in the direction that
    // protects the account (buy: no higher than cap; sell: no lower).
    let cap = if side_is_buy {
        market_price * (1.0 + max_slippage)
    } else {
        market_price * (1.0 - max_slippage)
    };
    SlippageDecision {
        kind: OrderKind::LimitIoc,
        limit_price: Some(cap),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeCheck {
    pub notional: f64,
    pub fee_cost: f64,
    pub funding_cost: f64,
    pub expected_profit: f64,
    pub edge: f64,
    pub passes: bool,
    pub reason: Option<String>,
}

/// Expected-profit vs. cost-to-trade comparison. `tp_price` is the resolved
/// take-profit (explicit or ATR-derived); `None` fails the check only when
/// `edge_require_tp` is set. `side_is_buy` signs the expected-profit term: a
/// take-profit on the wrong side of entry (e.g. below entry on a buy) floors
/// at zero rather than scoring as profit.
#[allow(clippy::too_many_arguments)]
pub fn edge_filter(
    cfg: &Config,
    entry_price: f64,
    tp_price: Option<f64>,
    qty: f64,
    funding_rate: f64,
    holding_hours: f64,
    side_is_buy: bool,
) -> EdgeCheck {
    let notional = (entry_price * qty).abs();

    if !cfg.edge_filter_enabled {
        return EdgeCheck {
            notional,
            fee_cost: 0.0,
            funding_cost: 0.0,
            expected_profit: 0.0,
            edge: f64::INFINITY,
            passes: true,
            reason: None,
        };
    }

    let Some(tp) = tp_price else {
        if cfg.edge_require_tp {
            return EdgeCheck {
                notional,
                fee_cost: 0.0,
                funding_cost: 0.0,
                expected_profit: 0.0,
                edge: 0.0,
                passes: false,
                reason: Some("no take-profit available and edge_require_tp is set".to_string()),
            };
        }
        return EdgeCheck {
            notional,
            fee_cost: 0.0,
            funding_cost: 0.0,
            expected_profit: 0.0,
            edge: f64::INFINITY,
            passes: true,
            reason: None,
        };
    };

    // Round-trip taker fee (open + close) plus an estimated funding accrual
    // over the expected holding period (funding settles every 8h on most
    // derivatives venues).
    let fee_cost = notional * cfg.taker_fee * 2.0;
    let funding_periods = (holding_hours / 8.0).max(0.0);
    let funding_cost = notional * funding_rate.abs() * funding_periods;
    let side_sign = if side_is_buy { 1.0 } else { -1.0 };
    let expected_profit = (side_sign * (tp - entry_price) * qty).max(0.0);
    let edge = expected_profit - fee_cost - funding_cost;

    let passes = edge > cfg.min_edge_usdt;
    let reason = if passes {
        None
    } else {
        Some(format!(
            "edge {edge:.4} below minimum {:.4} (expected_profit={expected_profit:.4} fee={fee_cost:.4} funding={funding_cost:.4})",
            cfg.min_edge_usdt
        ))
    };

    EdgeCheck {
        notional,
        fee_cost,
        funding_cost,
        expected_profit,
        edge,
        passes,
        reason,
    }
}

/// Derive a take-profit price from ATR when the signal didn't supply one and
/// `edge_allow_derive_tp` is set.
pub fn derive_tp_from_atr(entry_price: f64, atr: f64, atr_multiple: f64, side_is_buy: bool) -> f64 {
    if side_is_buy {
        entry_price + atr * atr_multiple
    } else {
        entry_price - atr * atr_multiple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::load()
    }

    #[test]
    fn slippage_guard_passes_through_within_tolerance() {
        let d = slippage_guard(Some(100.2), 100.0, 0.004, true);
        assert_eq!(d.kind, OrderKind::Market);
    }

    #[test]
    fn slippage_guard_converts_to_limit_beyond_tolerance() {
        let d = slippage_guard(Some(110.0), 100.0, 0.004, true);
        assert_eq!(d.kind, OrderKind::LimitIoc);
        assert!(d.limit_price.unwrap() < 110.0);
    }

    #[test]
    fn slippage_guard_no_op_without_requested_price() {
        let d = slippage_guard(None, 100.0, 0.004, true);
        assert_eq!(d.kind, OrderKind::Market);
        assert!(d.limit_price.is_none());
    }

    #[test]
    fn edge_filter_rejects_thin_edge() {
        let mut c = cfg();
        c.edge_filter_enabled = true;
        c.min_edge_usdt = 1.0;
        c.taker_fee = 0.01; // inflate fees to force a reject
        let check = edge_filter(&c, 100.0, Some(100.5), 1.0, 0.0, 2.0, true);
        assert!(!check.passes);
    }

    #[test]
    fn edge_filter_accepts_healthy_edge() {
        let mut c = cfg();
        c.edge_filter_enabled = true;
        c.min_edge_usdt = 0.0;
        c.taker_fee = 0.0006;
        let check = edge_filter(&c, 100.0, Some(110.0), 1.0, 0.0001, 2.0, true);
        assert!(check.passes);
    }

    #[test]
    fn edge_filter_disabled_always_passes() {
        let mut c = cfg();
        c.edge_filter_enabled = false;
        let check = edge_filter(&c, 100.0, None, 1.0, 0.0, 2.0, true);
        assert!(check.passes);
    }

    #[test]
    fn edge_filter_requires_tp_when_configured() {
        let mut c = cfg();
        c.edge_filter_enabled = true;
        c.edge_require_tp = true;
        let check = edge_filter(&c, 100.0, None, 1.0, 0.0, 2.0, true);
        assert!(!check.passes);
    }

    #[test]
    fn derive_tp_from_atr_respects_side() {
        assert_eq!(derive_tp_from_atr(100.0, 2.0, 3.0, true), 106.0);
        assert_eq!(derive_tp_from_atr(100.0, 2.0, 3.0, false), 94.0);
    }

    #[test]
    fn edge_filter_floors_expected_profit_when_tp_is_on_the_wrong_side() {
        let mut c = cfg();
        c.edge_filter_enabled = true;
        c.min_edge_usdt = 0.0;
        // Buying with a tp below entry would be a loss, not a profit; the
        // signed expected-profit term must floor at zero, not flip positive.
        let check = edge_filter(&c, 100.0, Some(90.0), 1.0, 0.0, 2.0, true);
        assert_eq!(check.expected_profit, 0.0);
        assert!(!check.passes);
    }

    #[test]
    fn edge_filter_scenario_from_spec_example() {
        // entry=1000, tp=1001, amount=0.01, leverage=5, taker_fee=0.0006,
        // funding=0 -> notional=10, fees=0.012, exp_profit=0.01, edge ~ -0.002
        let mut c = cfg();
        c.edge_filter_enabled = true;
        c.taker_fee = 0.0006;
        c.min_edge_usdt = 0.0;
        let check = edge_filter(&c, 1000.0, Some(1001.0), 0.01, 0.0, 2.0, true);
        assert!((check.notional - 10.0).abs() < 1e-9);
        assert!((check.fee_cost - 0.012).abs() < 1e-9);
        assert!((check.expected_profit - 0.01).abs() < 1e-9);
        assert!(check.edge < 0.0);
        assert!(!check.passes);
    }
}

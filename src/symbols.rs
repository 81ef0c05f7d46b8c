// =============================================================================
// Symbol Normalizer — external ticker notation to canonical venue symbol
// =============================================================================

/// Normalize a TradingView-style ticker (`BINANCE:ETHUSDT.P`, `ETHUSDT`, ...)
/// into a canonical `BASE/QUOTE:SETTLE` (derivatives) symbol. Returns `None`
/// when the input has no recognizable canonical form; callers are expected to
/// substitute the configured fallback symbol in that case.
///
/// Already-canonical input (containing both `/` and `:`) passes through
/// unchanged.
pub fn tv_to_canonical_symbol(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let mut s = raw.trim().to_uppercase();
    if let Some(idx) = s.rfind(':') {
        s = s[idx + 1..].to_string();
    }
    if let Some(stripped) = s.strip_suffix(".P") {
        s = stripped.to_string();
    }

    if let Some(base) = s.strip_suffix("USDT") {
        if !base.is_empty() && base.chars().all(|c| c.is_ascii_uppercase()) {
            return Some(format!("{base}/USDT:USDT"));
        }
    }
    if let Some(base) = s.strip_suffix("USD") {
        if !base.is_empty() && base.chars().all(|c| c.is_ascii_uppercase()) {
            return Some(format!("{base}/USD:USD"));
        }
    }

    if raw.contains('/') && raw.contains(':') {
        return Some(raw.to_string());
    }
    None
}

/// Normalize a symbol for a specific named exchange, used for the
/// regime-source venue which may be a different kind of venue (spot
/// Binance) than the trade venue (a perpetual-swap venue).
pub fn normalize_symbol_for_exchange(sym: &str, exchange_id: &str) -> Option<String> {
    if sym.is_empty() {
        return None;
    }
    let s = sym.trim();
    match exchange_id {
        "phemex" => Some(tv_to_canonical_symbol(s).unwrap_or_else(|| "ETH/USDT:USDT".to_string())),
        "binance" => {
            let mut s = s.to_string();
            if let Some(idx) = s.find(':') {
                s.truncate(idx);
            }
            let upper = s.to_uppercase();
            if !upper.contains('/') && upper.ends_with("USDT") {
                let base = &upper[..upper.len() - 4];
                return Some(format!("{base}/USDT"));
            }
            Some(upper)
        }
        _ => Some(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_venue_prefix_and_perpetual_suffix() {
        assert_eq!(
            tv_to_canonical_symbol("BINANCE:ETHUSDT.P"),
            Some("ETH/USDT:USDT".to_string())
        );
    }

    #[test]
    fn canonical_input_is_a_no_op() {
        assert_eq!(
            tv_to_canonical_symbol("ETH/USDT:USDT"),
            Some("ETH/USDT:USDT".to_string())
        );
    }

    #[test]
    fn usd_quote_maps_to_usd_settlement() {
        assert_eq!(tv_to_canonical_symbol("XBTUSD"), Some("XBT/USD:USD".to_string()));
    }

    #[test]
    fn unparseable_input_yields_none() {
        assert_eq!(tv_to_canonical_symbol("NOTASYMBOL123"), None);
        assert_eq!(tv_to_canonical_symbol(""), None);
    }

    #[test]
    fn binance_exchange_normalization_drops_settlement_suffix() {
        assert_eq!(
            normalize_symbol_for_exchange("ETH/USDT:USDT", "binance"),
            Some("ETH/USDT".to_string())
        );
        assert_eq!(
            normalize_symbol_for_exchange("ETHUSDT", "binance"),
            Some("ETH/USDT".to_string())
        );
    }

    #[test]
    fn phemex_exchange_normalization_falls_back_on_garbage() {
        assert_eq!(
            normalize_symbol_for_exchange("garbage", "phemex"),
            Some("ETH/USDT:USDT".to_string())
        );
    }
}

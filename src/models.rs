// =============================================================================
// Signal schema + the forgiving `comment` blob parser
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound webhook payload. Unknown fields are accepted and ignored — the
/// charting source may add fields the relay doesn't know about yet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Signal {
    pub id: String,

    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,

    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub contracts: Option<f64>,

    #[serde(default)]
    pub price: Option<f64>,

    #[serde(default, rename = "marketPosition")]
    pub market_position: Option<String>,
    #[serde(default, rename = "marketPositionSize")]
    pub market_position_size: Option<f64>,
    #[serde(default, rename = "prevMarketPosition")]
    pub prev_market_position: Option<String>,

    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default, rename = "reduceOnly")]
    pub reduce_only: Option<bool>,

    #[serde(default)]
    pub timestamp: Option<i64>,

    #[serde(default, rename = "relaySecret")]
    pub relay_secret: Option<String>,

    #[serde(default)]
    pub strategy: Option<String>,

    #[serde(default)]
    pub sizing: Option<String>,
    #[serde(default, rename = "riskPct")]
    pub risk_pct: Option<f64>,
    #[serde(default, rename = "allocPct")]
    pub alloc_pct: Option<f64>,
    #[serde(default, rename = "qtyPct")]
    pub qty_pct: Option<f64>,

    /// Free-form blob: either a JSON object or a JSON-encoded (possibly
    /// loosely-quoted) string. See [`parse_comment`].
    #[serde(default)]
    pub comment: Option<Value>,

    /// Anything else the sender includes rides along unused.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Signal {
    /// The explicit delta amount, if any, preferring `qty`, then `amount`,
    /// then `contracts`.
    pub fn explicit_amount(&self) -> Option<f64> {
        self.qty.or(self.amount).or(self.contracts)
    }

    /// Normalized side: buy/sell, mapping long->buy and short->sell.
    pub fn normalized_side(&self) -> Option<String> {
        let raw = self.side.as_deref().or(self.action.as_deref())?;
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "long" => Some("buy".to_string()),
            "sell" | "short" => Some("sell".to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn parsed_comment(&self) -> HashMap<String, f64> {
        match &self.comment {
            Some(v) => parse_comment(v),
            None => HashMap::new(),
        }
    }
}

/// Known keys the forgiving comment normalizer is allowed to bare-quote.
const COMMENT_ALLOW_LIST: &[&str] = &["entry", "sl", "tp", "atr", "kind", "strategy"];

/// Parse the free-form `comment` field into a flat numeric map.
///
/// `comment` may already be a JSON object (the common case when the sender's
/// webhook client encodes JSON properly), or a string that is itself JSON —
/// possibly with single quotes and bare (unquoted) keys, which is not valid
/// JSON but shows up often enough from hand-rolled Pine Script alerts that we
/// tolerate it. Non-numeric values (e.g. `"kind":"entry"`) are dropped from
/// the numeric map; callers that need `kind`/`strategy` as strings should
/// read the raw `Value` instead.
pub fn parse_comment(value: &Value) -> HashMap<String, f64> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect(),
        Value::String(s) => {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(s) {
                return map
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect();
            }
            let normalized = normalize_loose_json(s);
            match serde_json::from_str::<Value>(&normalized) {
                Ok(Value::Object(map)) => map
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect(),
                _ => HashMap::new(),
            }
        }
        _ => HashMap::new(),
    }
}

/// Best-effort repair of a loosely-quoted object literal: single quotes
/// become double quotes, and bare keys drawn from [`COMMENT_ALLOW_LIST`] get
/// quoted. Not a general JSON5 parser — just enough to rescue the shapes
/// TradingView alert templates commonly produce.
fn normalize_loose_json(s: &str) -> String {
    let mut out = s.replace('\'', "\"");
    for key in COMMENT_ALLOW_LIST {
        let bare = format!("{key}:");
        let quoted = format!("\"{key}\":");
        out = out.replace(&bare, &quoted);
        // Avoid double-quoting a key that was already quoted above.
        let doubled = format!("\"\"{key}\"\":");
        out = out.replace(&doubled, &quoted);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_structured_object() {
        let v = json!({"entry": 1.0, "sl": 2.0, "tp": 3.0});
        let m = parse_comment(&v);
        assert_eq!(m.get("entry"), Some(&1.0));
        assert_eq!(m.get("sl"), Some(&2.0));
        assert_eq!(m.get("tp"), Some(&3.0));
    }

    #[test]
    fn parses_json_encoded_string() {
        let v = Value::String(r#"{"entry":1,"sl":2,"tp":3}"#.to_string());
        let m = parse_comment(&v);
        assert_eq!(m.get("entry"), Some(&1.0));
        assert_eq!(m.get("tp"), Some(&3.0));
    }

    #[test]
    fn parses_bare_keys_and_single_quotes() {
        let v = Value::String("{entry:1,'sl':2}".to_string());
        let m = parse_comment(&v);
        assert_eq!(m.get("entry"), Some(&1.0));
        assert_eq!(m.get("sl"), Some(&2.0));
    }

    #[test]
    fn unparseable_comment_yields_empty_map() {
        let v = Value::String("not json at all {{{".to_string());
        assert!(parse_comment(&v).is_empty());
    }

    #[test]
    fn signal_accepts_unknown_fields() {
        let json = r#"{"id":"A","foo":"bar","nested":{"x":1}}"#;
        let sig: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(sig.id, "A");
        assert!(sig.extra.contains_key("foo"));
    }

    #[test]
    fn normalized_side_maps_long_short() {
        let sig = Signal {
            side: Some("long".to_string()),
            ..blank()
        };
        assert_eq!(sig.normalized_side(), Some("buy".to_string()));
    }

    fn blank() -> Signal {
        serde_json::from_str(r#"{"id":"x"}"#).unwrap()
    }
}

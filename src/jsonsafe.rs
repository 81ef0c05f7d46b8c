// =============================================================================
// JSON safety — NaN/Infinity are not valid JSON, so scrub them before we
// serialize a response body. Mirrors the `jnum` guard from the upstream
// relay, but works recursively over an already-built `serde_json::Value`
// rather than at the point each float is produced.
// =============================================================================

use serde_json::Value;

/// Replace any non-finite float in `value` (recursively, through objects and
/// arrays) with `null`. Integers, strings, bools and already-finite floats
/// pass through unchanged.
pub fn json_sanitize(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(json_sanitize).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, json_sanitize(v))).collect())
        }
        other => other,
    }
}

/// Convert a value that may not be finite into an `Option<f64>`, matching
/// the vendored `jnum` helper's contract (NaN/Inf become `None`).
pub fn finite_or_none(x: f64) -> Option<f64> {
    if x.is_finite() {
        Some(x)
    } else {
        None
    }
}

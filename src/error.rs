// =============================================================================
// Relay error taxonomy — maps pipeline outcomes to HTTP responses
// =============================================================================
//
// Every non-success path through the webhook pipeline ends up as one of these
// variants. `IntoResponse` carries the policy table from the design docs:
// which statuses are real errors (4xx/5xx) and which are just a shaped 200.
// Blocked-* variants already carry their full response body (status string
// plus whatever metadata that block kind reports) so the handler does not
// need to reshape anything at the call site.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

use crate::jsonsafe::json_sanitize;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("sizing constraint: {0}")]
    SizingConstraint(String),

    /// A risk gate rejected the signal. Carries the full 200-status body
    /// (e.g. `{"status":"blocked_by_regime", "strategy":..., "regime":...}`).
    #[error("blocked: {0}")]
    Blocked(serde_json::Value),

    #[error("venue order error: {0}")]
    VenueOrder(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn blocked_daily_dd(meta: serde_json::Value) -> Self {
        Self::Blocked(json!({"status": "blocked_daily_dd", "meta": meta}))
    }

    pub fn blocked_cooldown(strategy: &str, until_ms: i64) -> Self {
        Self::Blocked(json!({"status": "blocked_cooldown", "strategy": strategy, "until_ms": until_ms}))
    }

    pub fn blocked_by_regime(strategy: &str, regime: &str, meta: serde_json::Value) -> Self {
        Self::Blocked(json!({"status": "blocked_by_regime", "strategy": strategy, "regime": regime, "meta": meta}))
    }

    pub fn blocked_by_edge(edge: f64, entry: f64, tp: f64, amount: f64, funding_rate: f64) -> Self {
        Self::Blocked(json!({
            "status": "blocked_by_edge",
            "edge": edge,
            "entry": entry,
            "tp": tp,
            "amount": amount,
            "fr": funding_rate,
        }))
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            RelayError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({"error": "unauthorized"})),
            RelayError::InvalidPayload(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            RelayError::SizingConstraint(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            RelayError::Blocked(body) => (StatusCode::OK, body),
            RelayError::VenueOrder(msg) => (StatusCode::BAD_GATEWAY, json!({"error": msg})),
            RelayError::Internal(err) => {
                tracing::error!(error = %err, "unhandled error in webhook pipeline");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal_error"}))
            }
        };
        (status, Json(json_sanitize(body))).into_response()
    }
}

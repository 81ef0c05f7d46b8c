// =============================================================================
// Market Adapter — venue capability interface + the signed REST client
// =============================================================================
//
// Wraps a derivatives venue (modeled on Phemex's contract API) behind a small
// trait so the order engine, sizer, and risk gate never depend on a concrete
// HTTP client. Signing follows the teacher's `binance/client.rs` shape
// (HMAC-SHA256 over a canonical query/body string, sent as a header), but the
// canonicalization and the set of endpoints are the venue's own — Phemex (and
// most derivatives venues) sign `path + query + body + expiry`, not a
// Binance-style `timestamp&recvWindow` query suffix.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Per-symbol venue constraints, fetched on demand and cached for the life
/// of the process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketInfo {
    pub price_step: f64,
    pub amount_step: f64,
    pub min_cost: f64,
    pub min_qty: f64,
}

/// Venue position snapshot. The venue is the source of truth; the relay
/// never tracks position state locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub side: Option<String>, // "long" | "short" | None (flat)
    pub qty: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

impl PositionInfo {
    pub fn flat() -> Self {
        Self {
            side: None,
            qty: 0.0,
            entry_price: 0.0,
            unrealized_pnl: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub mark_price: Option<f64>,
}

/// Normalized order record returned by `create_order`/`fetch_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub status: String, // "open" | "closed" | "canceled" | ...
    pub average: Option<f64>,
    pub price: Option<f64>,
    pub filled: Option<f64>,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "Long",
            Self::Short => "Short",
        }
    }
}

/// Parameters for placing an order. `reduce_only` and `pos_side` are
/// optional because one-way-mode accounts never set `pos_side`.
#[derive(Debug, Clone)]
pub struct CreateOrderParams {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: String, // "buy" | "sell"
    pub qty: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub pos_side: Option<PosSide>,
}

#[async_trait]
pub trait MarketAdapter: Send + Sync {
    /// Multi-probe equity discovery. Returns 0.0 (never an error) when
    /// every probe comes up empty — the caller treats 0 equity as a
    /// sizing-constraint rejection, not a transport failure.
    async fn fetch_equity(&self, equity_code: &str, equity_source: &str) -> f64;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn fetch_position(&self, symbol: &str) -> Result<PositionInfo>;

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64>;

    /// Closing 4h candles, oldest first.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<f64>>;

    async fn market_info(&self, symbol: &str) -> Result<MarketInfo>;

    async fn create_order(&self, params: CreateOrderParams) -> Result<OrderRecord>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<OrderRecord>;

    async fn set_leverage(&self, leverage: f64, symbol: &str) -> Result<()>;

    async fn set_position_mode(&self, hedged: bool) -> Result<()>;
}

/// Rounds `v` down to the nearest multiple of `step`. A non-positive step
/// is a no-op.
pub fn round_step(v: f64, step: f64) -> f64 {
    if step > 0.0 {
        (v / step).floor() * step
    } else {
        v
    }
}

/// Selects the price to use for decisions: mark price when requested and
/// present, else last trade price.
pub fn get_price(ticker: &Ticker, use_mark: bool) -> f64 {
    if use_mark {
        if let Some(mark) = ticker.mark_price {
            if mark > 0.0 {
                return mark;
            }
        }
    }
    ticker.last
}

/// Balance-bucket probe variants tried, in order, by `fetch_equity`.
fn balance_probe_variants(equity_code: &str) -> Vec<Value> {
    vec![
        json!({}),
        json!({"type": "swap"}),
        json!({"type": "future"}),
        json!({"type": "contract"}),
        json!({"code": equity_code}),
    ]
}

/// The raw venue-blob scaled fields scanned as a last resort when every
/// structured probe comes up empty.
const SCALED_INFO_FIELDS: &[&str] = &[
    "availableBalanceEv",
    "totalBalanceEv",
    "accountBalanceEv",
    "cashBal",
    "totalWalletBalance",
];

/// Extract an amount for `code` from a single balance-probe response, trying
/// `EQUITY_SOURCE` first, then the remaining fields in the documented
/// fallback order, and `CODE` / `CODE:USDT` / `CODE:USD` / nested `balances`
/// lookups in that order.
fn extract_amount(resp: &Value, code: &str, source: &str) -> f64 {
    let fields: Vec<&str> = {
        let mut v = vec![source];
        for f in ["free", "available", "total", "cash", "used"] {
            if f != source {
                v.push(f);
            }
        }
        v
    };

    let keys = [
        code.to_string(),
        format!("{code}:USDT"),
        format!("{code}:USD"),
    ];

    for key in &keys {
        if let Some(bucket) = resp.get(key) {
            for field in &fields {
                if let Some(f) = bucket.get(field).and_then(|v| v.as_f64()) {
                    if f > 0.0 {
                        return f;
                    }
                }
            }
        }
    }

    if let Some(balances) = resp.get("balances") {
        for key in &keys {
            if let Some(bucket) = balances.get(key) {
                for field in &fields {
                    if let Some(f) = bucket.get(field).and_then(|v| v.as_f64()) {
                        if f > 0.0 {
                            return f;
                        }
                    }
                }
            }
        }
    }

    0.0
}

/// Scan `info` (and the one level of nesting under
/// `info.data.accounts[]`/`info.accounts[]`/`info.account`) for a known
/// fixed-point-scaled field, dividing by 1e8 when the raw value looks scaled
/// (> 1e6).
fn scan_raw_info(info: &Value) -> f64 {
    fn try_fields(obj: &Value) -> Option<f64> {
        for field in SCALED_INFO_FIELDS {
            if let Some(raw) = obj.get(field).and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))) {
                if raw > 0.0 {
                    return Some(if raw > 1e6 { raw / 1e8 } else { raw });
                }
            }
        }
        None
    }

    if let Some(v) = try_fields(info) {
        return v;
    }

    let nested_arrays = [
        info.pointer("/data/accounts"),
        info.pointer("/accounts"),
    ];
    for arr in nested_arrays.into_iter().flatten() {
        if let Some(items) = arr.as_array() {
            for item in items {
                if let Some(v) = try_fields(item) {
                    return v;
                }
            }
        }
    }
    if let Some(account) = info.get("account") {
        if let Some(v) = try_fields(account) {
            return v;
        }
    }

    0.0
}

/// Signed REST client for the trade venue, modeled on Phemex's contract API.
#[derive(Clone)]
pub struct PhemexAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    market_info_cache: Arc<RwLock<HashMap<String, MarketInfo>>>,
}

impl PhemexAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let base_url = if testnet {
            "https://testnet-api.phemex.com".to_string()
        } else {
            "https://api.phemex.com".to_string()
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url,
            client,
            market_info_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn expiry_ts() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs()
            + 60
    }

    /// HMAC-SHA256 over `path + query + expiry + body`, the Phemex signing
    /// canonicalization.
    fn sign(&self, path: &str, query: &str, expiry: u64, body: &str) -> String {
        let payload = format!("{path}{query}{expiry}{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value> {
        let expiry = Self::expiry_ts();
        let sig = self.sign(path, query, expiry, "");
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .get(&url)
            .header("x-phemex-access-token", &self.api_key)
            .header("x-phemex-request-expiry", expiry.to_string())
            .header("x-phemex-request-signature", sig)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("venue GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn signed_post(&self, path: &str, body_json: &Value) -> Result<Value> {
        let expiry = Self::expiry_ts();
        let body = body_json.to_string();
        let sig = self.sign(path, "", expiry, &body);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("x-phemex-access-token", &self.api_key)
            .header("x-phemex-request-expiry", expiry.to_string())
            .header("x-phemex-request-signature", sig)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("venue POST {path} returned {status}: {body}");
        }
        Ok(body)
    }

    /// A single balance probe (one of the five parameter variants).
    #[instrument(skip(self), name = "market::probe_balance")]
    async fn probe_balance(&self, params: &Value) -> Result<Value> {
        let query = params
            .as_object()
            .map(|o| {
                o.iter()
                    .map(|(k, v)| format!("{k}={}", v.as_str().unwrap_or_default()))
                    .collect::<Vec<_>>()
                    .join("&")
            })
            .unwrap_or_default();
        self.signed_get("/accounts/accountPositions", &query).await
    }
}

#[async_trait]
impl MarketAdapter for PhemexAdapter {
    #[instrument(skip(self), name = "market::fetch_equity")]
    async fn fetch_equity(&self, equity_code: &str, equity_source: &str) -> f64 {
        for params in balance_probe_variants(equity_code) {
            match self.probe_balance(&params).await {
                Ok(resp) => {
                    let amount = extract_amount(&resp, equity_code, equity_source);
                    if amount > 0.0 {
                        info!(equity_code, amount, params = %params, "balance_ok");
                        return amount;
                    }
                    if let Some(info) = resp.get("info") {
                        let scanned = scan_raw_info(info);
                        if scanned > 0.0 {
                            info!(equity_code, amount = scanned, "balance_info_parsed");
                            return scanned;
                        }
                    }
                }
                Err(e) => {
                    warn!(params = %params, error = %e, "balance_fetch_error");
                }
            }
        }
        warn!(equity_code, "balance_zero — all probes exhausted, returning 0");
        0.0
    }

    #[instrument(skip(self), name = "market::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let body = self
            .signed_get("/md/ticker/24hr", &format!("symbol={symbol}"))
            .await?;
        let last = body
            .pointer("/result/last")
            .or_else(|| body.pointer("/result/lastPrice"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let mark_price = body
            .pointer("/result/markPrice")
            .and_then(|v| v.as_f64());
        Ok(Ticker { last, mark_price })
    }

    #[instrument(skip(self), name = "market::fetch_position")]
    async fn fetch_position(&self, symbol: &str) -> Result<PositionInfo> {
        let body = self
            .signed_get("/accounts/accountPositions", &format!("symbol={symbol}"))
            .await?;
        let positions = body
            .pointer("/result/positions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for p in &positions {
            if p.get("symbol").and_then(|v| v.as_str()) != Some(symbol) {
                continue;
            }
            let qty = p.get("size").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if qty <= 0.0 {
                return Ok(PositionInfo::flat());
            }
            let side = p
                .get("side")
                .and_then(|v| v.as_str())
                .map(|s| s.to_ascii_lowercase());
            let entry_price = p.get("avgEntryPrice").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let unrealized_pnl = p.get("unRealisedPnl").and_then(|v| v.as_f64()).unwrap_or(0.0);
            return Ok(PositionInfo {
                side,
                qty,
                entry_price,
                unrealized_pnl,
            });
        }
        Ok(PositionInfo::flat())
    }

    #[instrument(skip(self), name = "market::fetch_funding_rate")]
    async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64> {
        let body = self
            .signed_get("/md/fundingRate", &format!("symbol={symbol}"))
            .await?;
        let rate = body
            .pointer("/result/fundingRate")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Ok(rate)
    }

    #[instrument(skip(self), name = "market::fetch_ohlcv")]
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<f64>> {
        let query = format!("symbol={symbol}&resolution={timeframe}&limit={limit}");
        let body = self.signed_get("/md/kline", &query).await?;
        let rows = body
            .pointer("/result/rows")
            .and_then(|v| v.as_array())
            .context("kline response missing rows")?;

        let mut closes = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = row.as_array().context("kline row is not an array")?;
            // [timestamp, interval, last_close, open, high, low, close, volume, turnover]
            if let Some(close) = arr.get(6).and_then(|v| v.as_f64()) {
                closes.push(close);
            }
        }
        debug!(symbol, timeframe, count = closes.len(), "ohlcv fetched");
        Ok(closes)
    }

    #[instrument(skip(self), name = "market::market_info")]
    async fn market_info(&self, symbol: &str) -> Result<MarketInfo> {
        if let Some(cached) = self.market_info_cache.read().get(symbol).copied() {
            return Ok(cached);
        }

        let body = self.signed_get("/public/products", "").await?;
        let products = body
            .pointer("/data/products")
            .or_else(|| body.pointer("/result/products"))
            .and_then(|v| v.as_array())
            .context("products response missing array")?;

        let product = products
            .iter()
            .find(|p| p.get("symbol").and_then(|v| v.as_str()) == Some(symbol))
            .with_context(|| format!("symbol {symbol} not found in products"))?;

        let info = MarketInfo {
            price_step: product
                .get("tickSize")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.01),
            amount_step: product
                .get("lotSize")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.001),
            min_cost: product
                .get("minOrderValue")
                .and_then(|v| v.as_f64())
                .unwrap_or(5.0),
            min_qty: product
                .get("minOrderSize")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.001),
        };

        self.market_info_cache
            .write()
            .insert(symbol.to_string(), info);
        Ok(info)
    }

    #[instrument(skip(self), name = "market::create_order")]
    async fn create_order(&self, params: CreateOrderParams) -> Result<OrderRecord> {
        let mut body = json!({
            "symbol": params.symbol,
            "side": if params.side == "buy" { "Buy" } else { "Sell" },
            "ordType": match params.order_type { OrderType::Market => "Market", OrderType::Limit => "Limit" },
            "orderQty": params.qty,
            "reduceOnly": params.reduce_only,
            "timeInForce": match params.order_type { OrderType::Market => "ImmediateOrCancel", OrderType::Limit => "ImmediateOrCancel" },
        });
        if let Some(price) = params.price {
            body["priceEp"] = json!(price);
        }
        if let Some(pos_side) = params.pos_side {
            body["posSide"] = json!(pos_side.as_str());
        }

        let resp = self.signed_post("/orders", &body).await?;
        order_from_response(&resp)
    }

    #[instrument(skip(self), name = "market::fetch_order")]
    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<OrderRecord> {
        let query = format!("symbol={symbol}&orderID={order_id}");
        let resp = self.signed_get("/orders/active", &query).await?;
        order_from_response(&resp)
    }

    #[instrument(skip(self), name = "market::set_leverage")]
    async fn set_leverage(&self, leverage: f64, symbol: &str) -> Result<()> {
        let body = json!({"symbol": symbol, "leverage": leverage, "marginMode": "cross"});
        self.signed_post("/positions/leverage", &body).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "market::set_position_mode")]
    async fn set_position_mode(&self, hedged: bool) -> Result<()> {
        let body = json!({"positionMode": if hedged { "Hedged" } else { "OneWay" }});
        self.signed_post("/positions/switch-pos-mode-sync", &body).await?;
        Ok(())
    }
}

fn order_from_response(resp: &Value) -> Result<OrderRecord> {
    let result = resp.get("result").or(Some(resp)).unwrap();
    Ok(OrderRecord {
        id: result
            .get("orderID")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        status: result
            .get("ordStatus")
            .and_then(|v| v.as_str())
            .unwrap_or("open")
            .to_ascii_lowercase(),
        average: result.get("avgPriceEp").and_then(|v| v.as_f64()),
        price: result.get("priceEp").and_then(|v| v.as_f64()),
        filled: result.get("cumQty").and_then(|v| v.as_f64()),
        raw: result.clone(),
    })
}

impl std::fmt::Debug for PhemexAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhemexAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

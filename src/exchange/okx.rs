//! # exchange::okx — OKX v5 REST adapter
//!
//! ## Signing
//! ```text
//! prehash   = timestamp + METHOD + requestPath(+?query) + body
//! signature = base64( HMAC-SHA256(secret, prehash) )
//! headers   = OK-ACCESS-KEY / -SIGN / -TIMESTAMP / -PASSPHRASE
//! ```
//! GET params are part of `requestPath` (sorted by key), body is `""`.
//! POST body is the exact compact JSON string that is sent.
//!
//! Account is assumed to be in net position mode (one position per instrument,
//! sign of `pos` = side), which is what the order calls rely on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::ExchangeError;
use crate::exchange::{
    Balance, Exchange, ExchangeConfig, ExchangeMode, InstrumentSpec, OrderAck, OrderRequest,
};
use crate::models::{BookLevel, Candle, MarginMode, OrderBook, Position, Side};

type HmacSha256 = Hmac<Sha256>;

/// OKX allows ~10 req/s per endpoint group; stay under it globally.
const MIN_REQUEST_GAP: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Signing ──────────────────────────────────────────────────────────────────

pub fn sign(
    secret:       &str,
    timestamp:    &str,
    method:       &str,
    request_path: &str,
    body:         &str,
) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("invalid secret: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// ISO-8601 with milliseconds and a `Z` suffix, the only format OKX accepts.
pub fn okx_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// `/api/v5/x?a=1&b=2` with params sorted by key and empty values dropped.
pub fn request_path(endpoint: &str, params: &[(&str, String)]) -> String {
    let mut pairs: Vec<&(&str, String)> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    if pairs.is_empty() {
        return endpoint.to_string();
    }
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{endpoint}?{query}")
}

/// Map an OKX business error code to the typed taxonomy.
pub fn classify(code: &str, msg: &str) -> ExchangeError {
    let lower = msg.to_ascii_lowercase();
    if code == "51008" || lower.contains("insufficient") {
        return ExchangeError::InsufficientFunds(format!("{code}: {msg}"));
    }
    match code {
        "50011" | "50061" => ExchangeError::RateLimited(format!("{code}: {msg}")),
        "50001" | "50013" => ExchangeError::Network(format!("{code}: {msg}")),
        c if c.starts_with("501") => ExchangeError::Auth(format!("{code}: {msg}")),
        _ => ExchangeError::Rejected { code: code.to_string(), msg: msg.to_string() },
    }
}

// ─── Wire Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg:  String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceData {
    #[serde(default)]
    total_eq: String,
    #[serde(default)]
    details:  Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy:       String,
    #[serde(default)]
    eq:        String,
    #[serde(default)]
    avail_bal: String,
    #[serde(default)]
    upl:       String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionData {
    inst_id:  String,
    #[serde(default)]
    pos_side: String,
    #[serde(default)]
    pos:      String,
    #[serde(default)]
    avg_px:   String,
    #[serde(default)]
    lever:    String,
    #[serde(default)]
    mgn_mode: String,
    #[serde(default)]
    upl:      String,
    #[serde(default)]
    mark_px:  String,
    #[serde(default)]
    c_time:   String,
}

#[derive(Debug, Deserialize)]
struct BookData {
    asks: Vec<Vec<String>>,
    bids: Vec<Vec<String>>,
    ts:   String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentData {
    ct_val: String,
    lot_sz: String,
    min_sz: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    #[serde(default)]
    ord_id:    String,
    #[serde(default)]
    cl_ord_id: String,
    #[serde(default)]
    s_code:    String,
    #[serde(default)]
    s_msg:     String,
}

fn num(raw: &str, field: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("{field}: '{raw}' is not a number")))
}

/// Numeric field that OKX may send as "" when not applicable.
fn opt_num(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok()
}

fn ms_to_utc(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn first<T: for<'de> Deserialize<'de>>(data: Value, what: &str) -> Result<T, ExchangeError> {
    let mut items: Vec<T> = serde_json::from_value(data)
        .map_err(|e| ExchangeError::Decode(format!("{what}: {e}")))?;
    if items.is_empty() {
        return Err(ExchangeError::Decode(format!("{what}: empty data")));
    }
    Ok(items.swap_remove(0))
}

// ─── Client ───────────────────────────────────────────────────────────────────

pub struct OkxClient {
    http:         reqwest::Client,
    base_url:     String,
    api_key:      String,
    api_secret:   String,
    passphrase:   String,
    simulated:    bool,
    last_request: Mutex<Option<Instant>>,
    instruments:  RwLock<HashMap<String, InstrumentSpec>>,
}

impl OkxClient {
    pub fn new(http: reqwest::Client, config: &ExchangeConfig) -> Self {
        Self {
            http,
            base_url:     config.base_url.trim_end_matches('/').to_string(),
            api_key:      config.api_key.clone(),
            api_secret:   config.api_secret.clone(),
            passphrase:   config.passphrase.clone(),
            simulated:    config.mode == ExchangeMode::Demo,
            last_request: Mutex::new(None),
            instruments:  RwLock::new(HashMap::new()),
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_GAP {
                tokio::time::sleep(MIN_REQUEST_GAP - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn auth_headers(
        &self,
        builder: reqwest::RequestBuilder,
        method:  &str,
        path:    &str,
        body:    &str,
    ) -> Result<reqwest::RequestBuilder, ExchangeError> {
        if self.api_key.is_empty() {
            return Err(ExchangeError::Auth("OKX credentials not configured".into()));
        }
        let ts  = okx_timestamp(Utc::now());
        let sig = sign(&self.api_secret, &ts, method, path, body)?;
        Ok(builder
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase))
    }

    async fn get(
        &self,
        endpoint: &str,
        params:   &[(&str, String)],
        private:  bool,
    ) -> Result<Value, ExchangeError> {
        let path = request_path(endpoint, params);
        let mut req = self.http.get(format!("{}{}", self.base_url, path));
        if private {
            req = self.auth_headers(req, "GET", &path, "")?;
        }
        self.send(req, &path).await
    }

    async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, ExchangeError> {
        let body_str = body.to_string();
        let req = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .header("Content-Type", "application/json")
            .body(body_str.clone());
        let req = self.auth_headers(req, "POST", endpoint, &body_str)?;
        self.send(req, endpoint).await
    }

    async fn send(&self, mut req: reqwest::RequestBuilder, path: &str) -> Result<Value, ExchangeError> {
        self.throttle().await;
        if self.simulated {
            req = req.header("x-simulated-trading", "1");
        }

        let resp   = req.timeout(REQUEST_TIMEOUT).send().await?;
        let status = resp.status();
        let text   = resp.text().await?;

        // Business errors come back with a JSON envelope even on 4xx
        match serde_json::from_str::<Envelope>(&text) {
            Ok(env) if env.code == "0" => Ok(env.data),
            Ok(env) => {
                warn!(path, code = %env.code, msg = %env.msg, "OKX request failed");
                Err(classify(&env.code, &env.msg))
            }
            Err(_) if status.as_u16() == 429 => Err(ExchangeError::RateLimited(format!("HTTP 429 on {path}"))),
            Err(_) if status.as_u16() == 401 || status.as_u16() == 403 => {
                Err(ExchangeError::Auth(format!("HTTP {status} on {path}")))
            }
            Err(_) if status.is_server_error() => Err(ExchangeError::Network(format!("HTTP {status} on {path}"))),
            Err(e) => Err(ExchangeError::Decode(format!("{path}: {e}"))),
        }
    }
}

// ─── Exchange impl ────────────────────────────────────────────────────────────

#[async_trait]
impl Exchange for OkxClient {
    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let data = self.get("/api/v5/account/balance", &[("ccy", "USDT".into())], true).await?;
        let account: BalanceData = first(data, "balance")?;

        let usdt = account.details.iter().find(|d| d.ccy == "USDT");
        let total_equity = usdt
            .and_then(|d| opt_num(&d.eq))
            .or_else(|| opt_num(&account.total_eq))
            .unwrap_or(0.0);

        Ok(Balance {
            total_equity,
            available:      usdt.and_then(|d| opt_num(&d.avail_bal)).unwrap_or(0.0),
            unrealized_pnl: usdt.and_then(|d| opt_num(&d.upl)).unwrap_or(0.0),
        })
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let data = self
            .get("/api/v5/account/positions", &[("instId", symbol.to_string())], true)
            .await?;
        let rows: Vec<PositionData> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Decode(format!("positions: {e}")))?;

        for row in rows.into_iter().filter(|r| r.inst_id == symbol) {
            let pos = opt_num(&row.pos).unwrap_or(0.0);
            if pos.abs() < 1e-9 {
                continue;
            }
            let side = match row.pos_side.as_str() {
                "long"  => Side::Long,
                "short" => Side::Short,
                _ if pos > 0.0 => Side::Long,
                _ => Side::Short,
            };
            return Ok(Some(Position {
                symbol:         row.inst_id,
                side,
                contracts:      pos.abs(),
                entry_price:    num(&row.avg_px, "avgPx")?,
                leverage:       opt_num(&row.lever).map(|l| l.round() as u32).unwrap_or(1),
                margin_mode:    if row.mgn_mode == "isolated" { MarginMode::Isolated } else { MarginMode::Cross },
                opened_at:      ms_to_utc(&row.c_time).unwrap_or_else(Utc::now),
                mark_price:     opt_num(&row.mark_px),
                unrealized_pnl: opt_num(&row.upl),
            }));
        }
        Ok(None)
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        let data = self
            .get(
                "/api/v5/market/books",
                &[("instId", symbol.to_string()), ("sz", depth.to_string())],
                false,
            )
            .await?;
        let book: BookData = first(data, "books")?;

        let levels = |rows: &[Vec<String>]| -> Result<Vec<BookLevel>, ExchangeError> {
            rows.iter()
                .map(|r| match (r.first(), r.get(1)) {
                    (Some(px), Some(sz)) => Ok(BookLevel { price: num(px, "book px")?, size: num(sz, "book sz")? }),
                    _ => Err(ExchangeError::Decode("book level too short".into())),
                })
                .collect()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids:   levels(&book.bids)?,
            asks:   levels(&book.asks)?,
            ts:     ms_to_utc(&book.ts).unwrap_or_else(Utc::now),
        })
    }

    async fn get_candles(&self, symbol: &str, timeframe: &str, count: usize) -> Result<Vec<Candle>, ExchangeError> {
        let data = self
            .get(
                "/api/v5/market/candles",
                &[
                    ("instId", symbol.to_string()),
                    ("bar", timeframe.to_string()),
                    ("limit", count.min(300).to_string()),
                ],
                false,
            )
            .await?;
        let rows: Vec<Vec<String>> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::Decode(format!("candles: {e}")))?;

        let mut candles = rows
            .iter()
            .map(|r| {
                if r.len() < 6 {
                    return Err(ExchangeError::Decode("candle row too short".into()));
                }
                Ok(Candle {
                    ts:     ms_to_utc(&r[0]).ok_or_else(|| ExchangeError::Decode("candle ts".into()))?,
                    open:   num(&r[1], "open")?,
                    high:   num(&r[2], "high")?,
                    low:    num(&r[3], "low")?,
                    close:  num(&r[4], "close")?,
                    volume: num(&r[5], "vol")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // OKX returns newest first
        candles.reverse();
        debug!(symbol, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut body = json!({
            "instId":  order.symbol,
            "tdMode":  order.margin_mode.as_str(),
            "side":    order.side.as_str(),
            "ordType": "market",
            "sz":      format_size(order.contracts),
            "clOrdId": order.client_order_id,
        });
        if order.reduce_only {
            body["reduceOnly"] = json!(true);
        }

        let data = self.post("/api/v5/trade/order", &body).await?;
        let ack: OrderData = first(data, "order")?;
        if !ack.s_code.is_empty() && ack.s_code != "0" {
            return Err(classify(&ack.s_code, &ack.s_msg));
        }

        Ok(OrderAck {
            order_id:        ack.ord_id,
            client_order_id: if ack.cl_ord_id.is_empty() { order.client_order_id.clone() } else { ack.cl_ord_id },
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> Result<(), ExchangeError> {
        let body = json!({
            "instId":  symbol,
            "lever":   leverage.to_string(),
            "mgnMode": margin_mode.as_str(),
        });
        self.post("/api/v5/account/set-leverage", &body).await?;
        Ok(())
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError> {
        if let Some(spec) = self.instruments.read().await.get(symbol) {
            return Ok(*spec);
        }

        let data = self
            .get(
                "/api/v5/public/instruments",
                &[("instType", "SWAP".into()), ("instId", symbol.to_string())],
                false,
            )
            .await?;
        let raw: InstrumentData = first(data, "instruments")?;
        let spec = InstrumentSpec {
            contract_value: num(&raw.ct_val, "ctVal")?,
            lot_size:       num(&raw.lot_sz, "lotSz")?,
            min_size:       num(&raw.min_sz, "minSz")?,
        };

        self.instruments.write().await.insert(symbol.to_string(), spec);
        Ok(spec)
    }
}

/// Contracts as a plain decimal string without float noise (`0.30000000000000004` → `0.3`).
pub fn format_size(contracts: f64) -> String {
    let s = format!("{contracts:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() { "0".to_string() } else { s.to_string() }
}

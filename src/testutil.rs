//! Test doubles shared by the inline test modules.
//!
//! - [`MockFeed`]          — public market data only (candles / book / spec)
//! - [`FlakyExchange`]     — wraps any exchange, injects queued errors and slow
//!   order acks, records calls
//! - [`ScriptedInference`] — returns canned model replies in order

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::brain::ai::Inference;
use crate::error::{ExchangeError, InferenceError};
use crate::exchange::{Balance, Exchange, InstrumentSpec, OrderAck, OrderRequest};
use crate::models::{BookLevel, Candle, MarginMode, OrderBook, Position};

pub const CONTRACT_VALUE: f64 = 0.01;

/// 5-minute bars starting at a fixed instant. open = previous close, ±0.5 wicks.
pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    let start: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                ts:     start + chrono::Duration::minutes(5 * i as i64),
                open,
                high:   open.max(close) + 0.5,
                low:    open.min(close) - 0.5,
                close,
                volume: 10.0,
            }
        })
        .collect()
}

/// Five levels of 1 000 contracts each side, spread of 2 × 10⁻⁵ × mid.
pub fn book_around(symbol: &str, mid: f64) -> OrderBook {
    let half = mid * 1e-5;
    OrderBook {
        symbol: symbol.to_string(),
        bids:   (0..5).map(|i| BookLevel { price: mid - half - i as f64 * half, size: 1_000.0 }).collect(),
        asks:   (0..5).map(|i| BookLevel { price: mid + half + i as f64 * half, size: 1_000.0 }).collect(),
        ts:     Utc::now(),
    }
}

// ─── MockFeed ─────────────────────────────────────────────────────────────────

struct FeedState {
    mid:     f64,
    candles: Option<Vec<Candle>>,
    book:    Option<OrderBook>,
}

pub struct MockFeed {
    symbol: String,
    state:  Mutex<FeedState>,
}

impl MockFeed {
    pub fn new(symbol: &str, mid: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            state:  Mutex::new(FeedState { mid, candles: None, book: None }),
        }
    }

    pub fn set_mid(&self, mid: f64) {
        let mut s = self.state.lock().unwrap();
        s.mid  = mid;
        s.book = None;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.state.lock().unwrap().candles = Some(candles);
    }

    /// Fixed book; cleared again by the next `set_mid`.
    pub fn set_book(&self, book: OrderBook) {
        self.state.lock().unwrap().book = Some(book);
    }
}

#[async_trait]
impl Exchange for MockFeed {
    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        Err(ExchangeError::Auth("market feed has no account".into()))
    }

    async fn get_open_position(&self, _symbol: &str) -> Result<Option<Position>, ExchangeError> {
        Err(ExchangeError::Auth("market feed has no account".into()))
    }

    async fn get_orderbook(&self, symbol: &str, _depth: usize) -> Result<OrderBook, ExchangeError> {
        let s = self.state.lock().unwrap();
        Ok(s.book.clone().unwrap_or_else(|| book_around(symbol, s.mid)))
    }

    async fn get_candles(&self, _symbol: &str, _timeframe: &str, count: usize) -> Result<Vec<Candle>, ExchangeError> {
        let s = self.state.lock().unwrap();
        Ok(match &s.candles {
            Some(c) => c.iter().rev().take(count).rev().cloned().collect(),
            None => {
                let closes: Vec<f64> = (0..count)
                    .map(|i| s.mid + ((i as f64) / 3.0).sin() * s.mid * 0.001)
                    .collect();
                candles_from_closes(&closes)
            }
        })
    }

    async fn place_order(&self, _order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        Err(ExchangeError::Auth("market feed cannot trade".into()))
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32, _margin_mode: MarginMode) -> Result<(), ExchangeError> {
        Err(ExchangeError::Auth("market feed cannot trade".into()))
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError> {
        if symbol != self.symbol {
            return Err(ExchangeError::Rejected { code: "51001".into(), msg: format!("unknown instrument {symbol}") });
        }
        Ok(InstrumentSpec { contract_value: CONTRACT_VALUE, lot_size: 0.01, min_size: 0.01 })
    }
}

// ─── FlakyExchange ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Faults {
    orders:    VecDeque<ExchangeError>,
    candles:   VecDeque<ExchangeError>,
    leverage:  VecDeque<ExchangeError>,
    positions: VecDeque<ExchangeError>,
    /// Position reads that pass through before `positions` apply
    positions_after: usize,
    /// Delay after the inner order filled, before the ack is returned
    ack_delay: VecDeque<Duration>,
}

/// Pass-through wrapper. Each queued error is returned once, in order,
/// instead of calling the inner exchange.
pub struct FlakyExchange {
    inner:          Arc<dyn Exchange>,
    faults:         Mutex<Faults>,
    pub orders:     Mutex<Vec<OrderRequest>>,
    pub leverages:  Mutex<Vec<u32>>,
}

impl FlakyExchange {
    pub fn new(inner: Arc<dyn Exchange>) -> Self {
        Self {
            inner,
            faults:    Mutex::new(Faults::default()),
            orders:    Mutex::new(Vec::new()),
            leverages: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_orders(&self, errs: impl IntoIterator<Item = ExchangeError>) {
        self.faults.lock().unwrap().orders.extend(errs);
    }

    pub fn fail_candles(&self, errs: impl IntoIterator<Item = ExchangeError>) {
        self.faults.lock().unwrap().candles.extend(errs);
    }

    pub fn fail_leverage(&self, errs: impl IntoIterator<Item = ExchangeError>) {
        self.faults.lock().unwrap().leverage.extend(errs);
    }

    pub fn fail_positions(&self, errs: impl IntoIterator<Item = ExchangeError>) {
        self.faults.lock().unwrap().positions.extend(errs);
    }

    /// Like `fail_positions`, but the next `calls` reads succeed first.
    pub fn fail_positions_after(&self, calls: usize, errs: impl IntoIterator<Item = ExchangeError>) {
        let mut f = self.faults.lock().unwrap();
        f.positions_after = calls;
        f.positions.extend(errs);
    }

    /// The n-th order fills on the inner exchange, then its ack waits the
    /// n-th delay.
    pub fn slow_acks(&self, delays: impl IntoIterator<Item = Duration>) {
        self.faults.lock().unwrap().ack_delay.extend(delays);
    }

    pub fn order_log(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    pub fn leverage_log(&self) -> Vec<u32> {
        self.leverages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exchange for FlakyExchange {
    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        self.inner.get_balance().await
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let fault = {
            let mut f = self.faults.lock().unwrap();
            if f.positions_after > 0 {
                f.positions_after -= 1;
                None
            } else {
                f.positions.pop_front()
            }
        };
        if let Some(e) = fault {
            return Err(e);
        }
        self.inner.get_open_position(symbol).await
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        self.inner.get_orderbook(symbol, depth).await
    }

    async fn get_candles(&self, symbol: &str, timeframe: &str, count: usize) -> Result<Vec<Candle>, ExchangeError> {
        if let Some(e) = self.faults.lock().unwrap().candles.pop_front() {
            return Err(e);
        }
        self.inner.get_candles(symbol, timeframe, count).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.orders.lock().unwrap().push(order.clone());
        if let Some(e) = self.faults.lock().unwrap().orders.pop_front() {
            return Err(e);
        }
        let ack   = self.inner.place_order(order).await;
        let delay = self.faults.lock().unwrap().ack_delay.pop_front();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        ack
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> Result<(), ExchangeError> {
        self.leverages.lock().unwrap().push(leverage);
        if let Some(e) = self.faults.lock().unwrap().leverage.pop_front() {
            return Err(e);
        }
        self.inner.set_leverage(symbol, leverage, margin_mode).await
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError> {
        self.inner.get_instrument(symbol).await
    }
}

// ─── ScriptedInference ────────────────────────────────────────────────────────

pub struct ScriptedInference {
    replies:     Mutex<VecDeque<Result<String, InferenceError>>>,
    delay:       Option<Duration>,
    timeout:     Duration,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedInference {
    pub fn new(replies: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            delay:   None,
            timeout: Duration::from_secs(5),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: Result<String, InferenceError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Every call sleeps `delay` before answering; `timeout` is what callers see.
    pub fn slow(mut self, delay: Duration, timeout: Duration) -> Self {
        self.delay   = Some(delay);
        self.timeout = timeout;
        self
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, InferenceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.replies.lock().unwrap().pop_front().unwrap_or(Err(InferenceError::Empty))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

//! # exchange — account / market / order seam
//!
//! ```text
//!                ┌──────────────────┐
//!  pipeline ───▶ │  dyn Exchange    │──▶ OkxClient   (live / demo, signed REST)
//!                │                  │──▶ PaperExchange (simulated fills over a
//!                └──────────────────┘                 real public market feed)
//! ```
//!
//! Every call returns a typed [`ExchangeError`] so the cycle can tell
//! "retry later" (network / rate limit) from "stop now" (auth / rejected).

pub mod okx;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Env;
use crate::error::ExchangeError;
use crate::models::{Candle, MarginMode, OrderBook, Position, Side};

// ─── Request / Response Types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Order side that grows a position on `side`.
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long  => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that shrinks a position on `side`.
    pub fn closing(side: Side) -> Self {
        Self::opening(side.opposite())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy  => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol:          String,
    pub side:            OrderSide,
    /// Contracts, already floored to the lot step
    pub contracts:       f64,
    pub reduce_only:     bool,
    pub margin_mode:     MarginMode,
    /// Idempotency key; a retry re-sends the same id
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id:        String,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Balance {
    pub total_equity:   f64,
    pub available:      f64,
    pub unrealized_pnl: f64,
}

/// Contract specification for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InstrumentSpec {
    /// Base-asset units per contract (OKX `ctVal`)
    pub contract_value: f64,
    /// Contract step (OKX `lotSz`)
    pub lot_size:       f64,
    /// Minimum order in contracts (OKX `minSz`)
    pub min_size:       f64,
}

// ─── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    /// `None` = flat
    async fn get_open_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError>;

    /// Oldest → newest
    async fn get_candles(&self, symbol: &str, timeframe: &str, count: usize) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> Result<(), ExchangeError>;

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError>;
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Real money
    Live,
    /// OKX demo trading (`x-simulated-trading: 1`)
    Demo,
    /// Local simulated fills, public market data only
    Paper,
}

impl ExchangeMode {
    pub fn is_paper(self) -> bool {
        matches!(self, ExchangeMode::Paper)
    }
}

#[derive(Clone)]
pub struct ExchangeConfig {
    pub mode:          ExchangeMode,
    pub base_url:      String,
    pub api_key:       String,
    pub api_secret:    String,
    pub passphrase:    String,
    /// Starting USDT balance of the paper account
    pub paper_balance: f64,
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("paper_balance", &self.paper_balance)
            .finish()
    }
}

impl ExchangeConfig {
    pub fn from_env(env: &Env) -> anyhow::Result<Self> {
        let mode = match env.string_or("EXCHANGE_MODE", "paper").to_ascii_lowercase().as_str() {
            "live" => ExchangeMode::Live,
            "demo" => ExchangeMode::Demo,
            "paper" => ExchangeMode::Paper,
            other => anyhow::bail!("Unknown EXCHANGE_MODE: '{other}'. Use 'live', 'demo' or 'paper'"),
        };

        let (api_key, api_secret, passphrase) = if mode.is_paper() {
            (
                env.string_or("OKX_API_KEY", ""),
                env.string_or("OKX_API_SECRET", ""),
                env.string_or("OKX_PASSPHRASE", ""),
            )
        } else {
            (
                env.required("OKX_API_KEY")?,
                env.required("OKX_API_SECRET")?,
                env.required("OKX_PASSPHRASE")?,
            )
        };

        Ok(Self {
            mode,
            base_url: env.string_or("OKX_BASE_URL", "https://www.okx.com"),
            api_key,
            api_secret,
            passphrase,
            paper_balance: env.parse_or("PAPER_BALANCE_USDT", 10_000.0)?,
        })
    }
}

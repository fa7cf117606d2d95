//! # models::market
//!
//! Market data as the collector hands it to the rest of the pipeline:
//! raw candles and orderbook from the exchange, plus the derived
//! [`MarketSnapshot`] (indicators, trend, support/resistance levels).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Candle ───────────────────────────────────────────────────────────────────

/// One OHLCV bar. Candle lists are always ordered oldest → newest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts:     DateTime<Utc>,
    pub open:   f64,
    pub high:   f64,
    pub low:    f64,
    pub close:  f64,
    pub volume: f64,
}

// ─── Orderbook ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    /// Size in contracts (exchange units), not base asset
    pub size:  f64,
}

/// Depth snapshot. `bids` best-first (descending), `asks` best-first (ascending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids:   Vec<BookLevel>,
    pub asks:   Vec<BookLevel>,
    pub ts:     DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((a + b) / 2.0),
            _ => None,
        }
    }
}

// ─── Derived ──────────────────────────────────────────────────────────────────

/// Trend classification from moving-average ordering and slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    StrongUp,
    StrongDown,
    Ranging,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::StrongUp   => write!(f, "strong uptrend"),
            Trend::StrongDown => write!(f, "strong downtrend"),
            Trend::Ranging    => write!(f, "ranging"),
        }
    }
}

/// Latest value of every indicator the signal context carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSummary {
    pub sma_fast:       f64,
    pub sma_medium:     f64,
    pub sma_slow:       f64,
    pub ema_12:         f64,
    pub ema_26:         f64,
    pub macd:           f64,
    pub macd_signal:    f64,
    pub macd_histogram: f64,
    pub rsi:            f64,
    pub bb_upper:       f64,
    pub bb_middle:      f64,
    pub bb_lower:       f64,
    /// 0.0 = lower band, 1.0 = upper band
    pub bb_position:    f64,
    pub atr:            f64,
    pub volume_ratio:   f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Levels {
    pub static_support:     f64,
    pub static_resistance:  f64,
    pub dynamic_support:    f64,
    pub dynamic_resistance: f64,
}

/// Everything the Signal Generator needs about the market for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol:           String,
    pub timeframe:        String,
    pub price:            f64,
    /// Change of the last candle close vs the previous one, in percent
    pub price_change_pct: f64,
    pub candles:          Vec<Candle>,
    pub indicators:       IndicatorSummary,
    pub trend:            Trend,
    pub levels:           Levels,
    pub orderbook:        OrderBook,
    pub fetched_at:       DateTime<Utc>,
}

impl MarketSnapshot {
    /// Mark price used for profit math: book mid when available, else last close.
    pub fn mark_price(&self) -> f64 {
        self.orderbook.mid().unwrap_or(self.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bids: &[f64], asks: &[f64]) -> OrderBook {
        OrderBook {
            symbol: "BTC-USDT-SWAP".into(),
            bids:   bids.iter().map(|&p| BookLevel { price: p, size: 1.0 }).collect(),
            asks:   asks.iter().map(|&p| BookLevel { price: p, size: 1.0 }).collect(),
            ts:     Utc::now(),
        }
    }

    #[test]
    fn mid_requires_both_sides() {
        assert_eq!(book(&[99.0], &[101.0]).mid(), Some(100.0));
        assert_eq!(book(&[], &[101.0]).mid(), None);
    }
}

//! # engine::liquidity
//!
//! **Liquidity Gate** — ด่านสุดท้ายก่อนส่ง market order
//!
//! ```text
//! order ready
//!     │
//!     ├─ [1] Book present    → both sides must have a level
//!     ├─ [2] Spread check    → (ask − bid) / mid ≤ 0.1 %
//!     └─ [3] Depth check     → top-5 on the side we hit, in base units,
//!                              ≥ configured minimum
//! ```
//!
//! Failing any check defers the action to the next scheduled cycle; the
//! gate never retries on its own.

use serde::Serialize;
use tracing::debug;

use crate::config::Env;
use crate::exchange::OrderSide;
use crate::models::{OrderBook, ReasonCode};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidityConfig {
    /// Max (ask − bid) / mid, as a fraction (0.001 = 0.1 %)
    pub max_spread_ratio: f64,
    /// Levels summed on the execution side
    pub depth_levels:     usize,
    /// Minimum summed depth in base-asset units
    pub min_depth_base:   f64,
}

impl LiquidityConfig {
    /// `MIN_BOOK_DEPTH` is required (per symbol or global).
    pub fn from_env(env: &Env, symbol: &str) -> anyhow::Result<Self> {
        let depth_raw = env
            .for_symbol("MIN_BOOK_DEPTH", symbol)
            .ok_or_else(|| anyhow::anyhow!("MIN_BOOK_DEPTH is required (missing for {symbol})"))?;
        let min_depth_base: f64 = depth_raw
            .parse()
            .map_err(|e| anyhow::anyhow!("MIN_BOOK_DEPTH for {symbol} = {depth_raw:?} is invalid: {e}"))?;
        let max_spread_pct: f64 = match env.for_symbol("MAX_SPREAD_PCT", symbol) {
            Some(raw) => raw.parse().map_err(|e| anyhow::anyhow!("MAX_SPREAD_PCT = {raw:?} is invalid: {e}"))?,
            None => 0.1,
        };

        Ok(Self {
            max_spread_ratio: max_spread_pct / 100.0,
            depth_levels:     env.parse_or("BOOK_DEPTH_LEVELS", 5)?,
            min_depth_base,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidityVerdict {
    Pass {
        spread_ratio: f64,
        depth_base:   f64,
    },
    Deferred {
        reason:       LiquidityReason,
        spread_ratio: f64,
        depth_base:   f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityReason {
    EmptyBook,
    SpreadTooWide,
    InsufficientDepth,
}

impl LiquidityReason {
    pub fn reason_code(self) -> ReasonCode {
        match self {
            LiquidityReason::EmptyBook         => ReasonCode::DeferredEmptyBook,
            LiquidityReason::SpreadTooWide     => ReasonCode::DeferredSpread,
            LiquidityReason::InsufficientDepth => ReasonCode::DeferredDepth,
        }
    }
}

/// Check the book for an order on `side`. Buys consume asks, sells consume bids.
pub fn check_liquidity(
    book:           &OrderBook,
    side:           OrderSide,
    contract_value: f64,
    config:         &LiquidityConfig,
) -> LiquidityVerdict {
    // ── [1] Book present ──────────────────────────────────────────────────────
    let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) else {
        debug!(symbol = %book.symbol, "❌ Liquidity DEFERRED: empty book");
        return LiquidityVerdict::Deferred {
            reason:       LiquidityReason::EmptyBook,
            spread_ratio: f64::NAN,
            depth_base:   0.0,
        };
    };

    let mid = (bid + ask) / 2.0;
    let spread_ratio = if mid > 0.0 { (ask - bid) / mid } else { f64::INFINITY };

    let levels = match side {
        OrderSide::Buy  => &book.asks,
        OrderSide::Sell => &book.bids,
    };
    let depth_base: f64 = levels
        .iter()
        .take(config.depth_levels)
        .map(|l| l.size * contract_value)
        .sum();

    // ── [2] Spread ────────────────────────────────────────────────────────────
    if spread_ratio > config.max_spread_ratio {
        debug!(
            symbol       = %book.symbol,
            spread_ratio,
            max          = config.max_spread_ratio,
            "❌ Liquidity DEFERRED: spread too wide"
        );
        return LiquidityVerdict::Deferred { reason: LiquidityReason::SpreadTooWide, spread_ratio, depth_base };
    }

    // ── [3] Depth ─────────────────────────────────────────────────────────────
    if depth_base < config.min_depth_base {
        debug!(
            symbol     = %book.symbol,
            side       = side.as_str(),
            depth_base,
            min        = config.min_depth_base,
            "❌ Liquidity DEFERRED: insufficient depth"
        );
        return LiquidityVerdict::Deferred { reason: LiquidityReason::InsufficientDepth, spread_ratio, depth_base };
    }

    debug!(symbol = %book.symbol, spread_ratio, depth_base, "✅ Liquidity OK");
    LiquidityVerdict::Pass { spread_ratio, depth_base }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookLevel;
    use chrono::Utc;

    fn make_config() -> LiquidityConfig {
        LiquidityConfig { max_spread_ratio: 0.001, depth_levels: 5, min_depth_base: 1.0 }
    }

    fn make_book(bid: f64, ask: f64, bid_size: f64, ask_size: f64) -> OrderBook {
        OrderBook {
            symbol: "BTC-USDT-SWAP".into(),
            bids:   (0..5).map(|i| BookLevel { price: bid - i as f64, size: bid_size }).collect(),
            asks:   (0..5).map(|i| BookLevel { price: ask + i as f64, size: ask_size }).collect(),
            ts:     Utc::now(),
        }
    }

    #[test]
    fn spread_too_wide() {
        // spread 100 on mid ~50 000 = 0.2 %
        let book = make_book(49_950.0, 50_050.0, 100.0, 100.0);
        let v = check_liquidity(&book, OrderSide::Buy, 0.01, &make_config());
        assert!(matches!(v, LiquidityVerdict::Deferred { reason: LiquidityReason::SpreadTooWide, .. }));
    }

    #[test]
    fn depth_checked_on_execution_side() {
        // asks thin (5 × 10 × 0.01 = 0.5 BTC), bids deep (5 BTC)
        let book = make_book(49_999.0, 50_001.0, 100.0, 10.0);
        let buy  = check_liquidity(&book, OrderSide::Buy, 0.01, &make_config());
        let sell = check_liquidity(&book, OrderSide::Sell, 0.01, &make_config());
        assert!(matches!(buy, LiquidityVerdict::Deferred { reason: LiquidityReason::InsufficientDepth, .. }));
        assert!(matches!(sell, LiquidityVerdict::Pass { .. }));
    }

    #[test]
    fn empty_book_defers() {
        let mut book = make_book(100.0, 100.1, 1.0, 1.0);
        book.asks.clear();
        let v = check_liquidity(&book, OrderSide::Sell, 1.0, &make_config());
        assert!(matches!(v, LiquidityVerdict::Deferred { reason: LiquidityReason::EmptyBook, .. }));
    }

    #[test]
    fn healthy_book_passes() {
        let book = make_book(49_999.5, 50_000.5, 50.0, 50.0);
        match check_liquidity(&book, OrderSide::Buy, 0.01, &make_config()) {
            LiquidityVerdict::Pass { depth_base, .. } => assert!((depth_base - 2.5).abs() < 1e-9),
            other => panic!("expected pass, got {other:?}"),
        }
    }
}

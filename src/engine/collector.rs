//! # engine::collector — Market Data & Indicator Collector
//!
//! ```text
//! get_candles(count) ─┐   retry w/ backoff      ┌─ indicators::summarize
//!                     ├─────────────────────────┼─ indicators::classify_trend
//! get_orderbook(5)  ──┘   (network / 429 only)  └─ indicators::levels
//! ```
//!
//! No stale data: if either fetch still fails after the retries the cycle
//! is abandoned for this symbol.

use chrono::Utc;
use tracing::{debug, warn};

use crate::engine::indicators::{self, SMA_SLOW};
use crate::error::{CycleError, ExchangeError};
use crate::exchange::Exchange;
use crate::models::MarketSnapshot;
use crate::retry::{retry_async, RetryPolicy};

pub const BOOK_DEPTH: usize = 5;

pub struct CollectRequest<'a> {
    pub symbol:       &'a str,
    pub timeframe:    &'a str,
    pub candle_count: usize,
    pub book_depth:   usize,
}

/// Map a failed read to the cycle outcome: transient failures abandon,
/// auth / rejected abort.
pub fn read_failure(what: &str, err: ExchangeError) -> CycleError {
    if err.is_retryable() || matches!(err, ExchangeError::Decode(_)) {
        CycleError::Abandoned(format!("{what}: {err}"))
    } else {
        CycleError::Aborted(err)
    }
}

pub async fn collect(
    exchange: &dyn Exchange,
    req:      &CollectRequest<'_>,
    policy:   &RetryPolicy,
) -> Result<MarketSnapshot, CycleError> {
    let candles = retry_async(policy, ExchangeError::is_retryable, |_| {
        exchange.get_candles(req.symbol, req.timeframe, req.candle_count)
    })
    .await
    .map_err(|e| {
        warn!(symbol = req.symbol, error = %e, "⚠️ Candle fetch failed");
        read_failure("candles", e)
    })?;

    if candles.len() < SMA_SLOW {
        return Err(CycleError::Abandoned(format!(
            "only {} candles for {} (need {SMA_SLOW})",
            candles.len(), req.symbol
        )));
    }

    let orderbook = retry_async(policy, ExchangeError::is_retryable, |_| {
        exchange.get_orderbook(req.symbol, req.book_depth)
    })
    .await
    .map_err(|e| {
        warn!(symbol = req.symbol, error = %e, "⚠️ Orderbook fetch failed");
        read_failure("orderbook", e)
    })?;

    let indicators = indicators::summarize(&candles);
    let trend      = indicators::classify_trend(&candles);
    let levels     = indicators::levels(&candles, &indicators);

    let price = candles.last().map(|c| c.close).unwrap_or(0.0);
    let prev  = candles.len().checked_sub(2).and_then(|i| candles.get(i)).map(|c| c.close);
    let price_change_pct = match prev {
        Some(p) if p > 0.0 => (price - p) / p * 100.0,
        _ => 0.0,
    };

    debug!(
        symbol = req.symbol,
        price,
        rsi    = indicators.rsi,
        trend  = %trend,
        bars   = candles.len(),
        "📊 Market snapshot"
    );

    Ok(MarketSnapshot {
        symbol:    req.symbol.to_string(),
        timeframe: req.timeframe.to_string(),
        price,
        price_change_pct,
        candles,
        indicators,
        trend,
        levels,
        orderbook,
        fetched_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{candles_from_closes, FlakyExchange, MockFeed};
    use std::sync::Arc;
    use std::time::Duration;

    const SYM: &str = "ETH-USDT-SWAP";

    fn req() -> CollectRequest<'static> {
        CollectRequest { symbol: SYM, timeframe: "5m", candle_count: 96, book_depth: BOOK_DEPTH }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2) }
    }

    #[tokio::test]
    async fn builds_snapshot() {
        let feed = MockFeed::new(SYM, 2_000.0);
        let snap = collect(&feed, &req(), &fast()).await.unwrap();
        assert_eq!(snap.candles.len(), 96);
        assert!(snap.indicators.rsi.is_finite());
        assert!((snap.mark_price() - 2_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let feed  = Arc::new(MockFeed::new(SYM, 2_000.0));
        let flaky = FlakyExchange::new(feed);
        flaky.fail_candles([ExchangeError::Network("reset".into()), ExchangeError::RateLimited("50011".into())]);
        assert!(collect(&flaky, &req(), &fast()).await.is_ok());
    }

    #[tokio::test]
    async fn persistent_failure_abandons() {
        let feed  = Arc::new(MockFeed::new(SYM, 2_000.0));
        let flaky = FlakyExchange::new(feed);
        flaky.fail_candles((0..3).map(|_| ExchangeError::Network("down".into())));
        assert!(matches!(collect(&flaky, &req(), &fast()).await, Err(CycleError::Abandoned(_))));
    }

    #[tokio::test]
    async fn short_history_abandons() {
        let feed = MockFeed::new(SYM, 100.0);
        feed.set_candles(candles_from_closes(&[100.0; 30]));
        assert!(matches!(collect(&feed, &req(), &fast()).await, Err(CycleError::Abandoned(_))));
    }
}

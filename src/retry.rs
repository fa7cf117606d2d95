//! # retry — bounded exponential backoff with jitter
//!
//! Used for exchange reads (candles, orderbook, balance, position) where a
//! transient network blip should not cost the whole cycle.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::config::Env;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub attempts:   usize,
    pub base_delay: Duration,
    pub max_delay:  Duration,
}

impl RetryPolicy {
    pub fn from_env(env: &Env) -> anyhow::Result<Self> {
        let attempts: usize = env.parse_or("NET_RETRY_ATTEMPTS", 3)?;
        Ok(Self {
            attempts:   attempts.max(1),
            base_delay: Duration::from_millis(env.parse_or("NET_RETRY_BASE_MS", 500)?),
            max_delay:  Duration::from_millis(env.parse_or("NET_RETRY_MAX_MS", 8_000)?),
        })
    }

    /// Delay before attempt `attempt + 1` (1-based), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts:   3,
            base_delay: Duration::from_millis(500),
            max_delay:  Duration::from_secs(8),
        }
    }
}

/// Retry `op` while `retryable(&err)` holds, up to `policy.attempts` calls.
///
/// Each wait is the exponential backoff plus up to 25 % random jitter,
/// never exceeding `max_delay`.
pub async fn retry_async<F, Fut, T, E, P>(
    policy:    &RetryPolicy,
    retryable: P,
    mut op:    F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.attempts && retryable(&e) => {
                let base   = policy.backoff(attempt);
                let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
                let delay  = (base + Duration::from_millis(jitter)).min(policy.max_delay);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

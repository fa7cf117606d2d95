//! # brain::filter — Signal Filter
//!
//! กรอง signal ก่อนถึง sizing, ดูเฉพาะ N signal ก่อนหน้า (ไม่รวมตัวเอง)
//!
//! ```text
//! new BUY/SELL
//!     │
//!     ├─ [1] Choppy    last N hold ≥ 3 distinct actions
//!     │                 → suppress unless confidence == HIGH
//!     ├─ [2] Cooldown  previous signal had the same action and is
//!     │                 younger than the cooldown → suppress
//!     └─ [3] pass unchanged
//! ```
//!
//! HOLD never reaches the filter; it is already a no-op.
//!
//! The cooldown has to outlast one scheduler interval, otherwise a repeat
//! at the previous cycle is always older than the window and rule 2 never
//! fires. Default = interval + [`COOLDOWN_SLACK`].

use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::config::Env;
use crate::models::{Confidence, ReasonCode, Signal};

/// Distinct actions among the prior window that count as "choppy"
const CHOPPY_DISTINCT: usize = 3;

/// Added to the cycle interval for the default cooldown (boundary jitter)
pub const COOLDOWN_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    /// How many prior signals the filter looks at
    pub window:   usize,
    /// Minimum gap between two signals with the same action
    pub cooldown: Duration,
}

impl FilterConfig {
    /// `interval` is the scheduler cadence the cooldown must cover.
    pub fn from_env(env: &Env, interval: Duration) -> anyhow::Result<Self> {
        let window: usize = env.parse_or("SIGNAL_FILTER_WINDOW", 3)?;
        if window == 0 {
            anyhow::bail!("SIGNAL_FILTER_WINDOW must be >= 1");
        }
        let default = (interval + COOLDOWN_SLACK).as_secs();
        let cooldown = env.secs_or("SIGNAL_COOLDOWN_SECS", default)?;
        if cooldown <= interval {
            anyhow::bail!(
                "SIGNAL_COOLDOWN_SECS ({}s) must be longer than CYCLE_INTERVAL_SECS ({}s)",
                cooldown.as_secs(), interval.as_secs()
            );
        }
        Ok(Self { window, cooldown })
    }

    pub fn for_interval(interval: Duration) -> Self {
        Self { window: 3, cooldown: interval + COOLDOWN_SLACK }
    }
}

impl Default for FilterConfig {
    /// Matches the default 300 s scheduler interval
    fn default() -> Self {
        Self::for_interval(Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Pass,
    Suppressed { reason: ReasonCode, detail: String },
}

/// `prior` is oldest → newest and must not contain `signal` itself.
pub fn apply_filter(signal: &Signal, prior: &[&Signal], cfg: &FilterConfig) -> FilterDecision {
    let window = &prior[prior.len().saturating_sub(cfg.window)..];

    // ── 1. Choppy market ──────────────────────────────────────────────────────
    let distinct: HashSet<_> = window.iter().map(|s| s.action).collect();
    if distinct.len() >= CHOPPY_DISTINCT && signal.confidence < Confidence::High {
        debug!(action = %signal.action, confidence = %signal.confidence, "🔇 Filter: choppy history");
        return FilterDecision::Suppressed {
            reason: ReasonCode::SuppressedChoppy,
            detail: format!(
                "{} distinct actions in last {} signals; {} needs HIGH confidence",
                distinct.len(), window.len(), signal.confidence
            ),
        };
    }

    // ── 2. Cooldown ───────────────────────────────────────────────────────────
    if let Some(prev) = window.last() {
        let age = signal.timestamp.signed_duration_since(prev.timestamp);
        let within = age.to_std().map(|a| a < cfg.cooldown).unwrap_or(true);
        if prev.action == signal.action && within {
            debug!(action = %signal.action, age_secs = age.num_seconds(), "🔇 Filter: cooldown");
            return FilterDecision::Suppressed {
                reason: ReasonCode::SuppressedCooldown,
                detail: format!(
                    "same action {} repeated after {}s (cooldown {}s)",
                    signal.action, age.num_seconds(), cfg.cooldown.as_secs()
                ),
            };
        }
    }

    FilterDecision::Pass
}

//! # engine::trailing
//!
//! **Tiered trailing stop / take-profit** — ประเมินก่อน signal ทุกครั้ง
//!
//! ```text
//! profit% (unlevered, signed by side)
//!     │
//!     ├─ [0] peak = max(peak, current)
//!     │
//!     ├─ [1] HARD STOP   current ≤ −2.0 %              → CLOSE (always wins)
//!     │
//!     ├─ [2] advance tier from peak (never goes down)
//!     │      peak ≥ 3.0 → TIER2 │ ≥ 1.0 → TIER1 │ ≥ 0.3 → LOW
//!     │
//!     └─ [3] tier exit
//!            LOW   current ≤ 0.2 %          (fixed floor)
//!            TIER1 current ≤ peak × 0.80    (give back 20 %)
//!            TIER2 current ≤ peak × 0.75    (give back 25 %)
//! ```
//!
//! CLOSE resets the state to `{peak 0, NONE}`. A flip or a flat position
//! observed on the exchange also resets it (see [`sync_with_position`]).

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Env;
use crate::models::{Position, ReasonCode, Tier, TrailingState};

// ─── Config ───────────────────────────────────────────────────────────────────

/// All thresholds in percent of entry price, retraces as fractions of peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingConfig {
    pub hard_stop_pct:   f64,
    pub low_enter_pct:   f64,
    pub low_floor_pct:   f64,
    pub tier1_enter_pct: f64,
    pub tier1_retrace:   f64,
    pub tier2_enter_pct: f64,
    pub tier2_retrace:   f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            hard_stop_pct:   2.0,
            low_enter_pct:   0.3,
            low_floor_pct:   0.2,
            tier1_enter_pct: 1.0,
            tier1_retrace:   0.20,
            tier2_enter_pct: 3.0,
            tier2_retrace:   0.25,
        }
    }
}

impl TrailingConfig {
    pub fn from_env(env: &Env) -> anyhow::Result<Self> {
        let d = Self::default();
        let cfg = Self {
            hard_stop_pct:   env.parse_or("TRAIL_HARD_STOP_PCT", d.hard_stop_pct)?,
            low_enter_pct:   env.parse_or("TRAIL_LOW_ENTER_PCT", d.low_enter_pct)?,
            low_floor_pct:   env.parse_or("TRAIL_LOW_FLOOR_PCT", d.low_floor_pct)?,
            tier1_enter_pct: env.parse_or("TRAIL_TIER1_ENTER_PCT", d.tier1_enter_pct)?,
            tier1_retrace:   env.parse_or("TRAIL_TIER1_RETRACE", d.tier1_retrace)?,
            tier2_enter_pct: env.parse_or("TRAIL_TIER2_ENTER_PCT", d.tier2_enter_pct)?,
            tier2_retrace:   env.parse_or("TRAIL_TIER2_RETRACE", d.tier2_retrace)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.hard_stop_pct > 0.0) {
            anyhow::bail!("TRAIL_HARD_STOP_PCT must be > 0");
        }
        if !(self.low_floor_pct < self.low_enter_pct
            && self.low_enter_pct < self.tier1_enter_pct
            && self.tier1_enter_pct < self.tier2_enter_pct)
        {
            anyhow::bail!("trailing thresholds must satisfy low_floor < low_enter < tier1_enter < tier2_enter");
        }
        for r in [self.tier1_retrace, self.tier2_retrace] {
            if !(r > 0.0 && r < 1.0) {
                anyhow::bail!("trailing retrace fractions must be in (0, 1)");
            }
        }
        Ok(())
    }

    /// Highest tier whose entry threshold `peak` has reached.
    pub fn tier_for_peak(&self, peak: f64) -> Tier {
        if peak >= self.tier2_enter_pct {
            Tier::Tier2
        } else if peak >= self.tier1_enter_pct {
            Tier::Tier1
        } else if peak >= self.low_enter_pct {
            Tier::Low
        } else {
            Tier::None
        }
    }
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitTrigger {
    HardStop,
    LowFloor,
    Tier1Retrace,
    Tier2Retrace,
}

impl ExitTrigger {
    pub fn reason(self) -> ReasonCode {
        match self {
            ExitTrigger::HardStop     => ReasonCode::ExitHardStop,
            ExitTrigger::LowFloor     => ReasonCode::ExitLowFloor,
            ExitTrigger::Tier1Retrace => ReasonCode::ExitTier1Retrace,
            ExitTrigger::Tier2Retrace => ReasonCode::ExitTier2Retrace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailingAction {
    Hold,
    Close(ExitTrigger),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingOutcome {
    pub action:      TrailingAction,
    /// `(from, to)` when the tier advanced during this evaluation
    pub advanced:    Option<(Tier, Tier)>,
    /// Peak / tier as seen when the decision was made (before any reset)
    pub peak_pct:    f64,
    pub tier:        Tier,
    pub current_pct: f64,
}

// ─── Evaluation ───────────────────────────────────────────────────────────────

/// Run one evaluation, mutating `state`. On CLOSE the state is reset.
pub fn evaluate(state: &mut TrailingState, current_pct: f64, cfg: &TrailingConfig) -> TrailingOutcome {
    // ── 0. Peak ───────────────────────────────────────────────────────────────
    if current_pct > state.peak_profit_pct {
        state.peak_profit_pct = current_pct;
    }

    // ── 1. Hard stop ──────────────────────────────────────────────────────────
    if current_pct <= -cfg.hard_stop_pct {
        let outcome = TrailingOutcome {
            action:   TrailingAction::Close(ExitTrigger::HardStop),
            advanced: None,
            peak_pct: state.peak_profit_pct,
            tier:     state.tier,
            current_pct,
        };
        info!(current_pct, peak = state.peak_profit_pct, "🛑 Hard stop hit");
        state.reset();
        return outcome;
    }

    // ── 2. Tier advance ───────────────────────────────────────────────────────
    let target = cfg.tier_for_peak(state.peak_profit_pct);
    let advanced = if target > state.tier {
        let from = state.tier;
        state.tier = target;
        info!(from = %from, to = %target, peak = state.peak_profit_pct, "📈 Trailing tier advanced");
        Some((from, target))
    } else {
        None
    };

    // ── 3. Tier exit ──────────────────────────────────────────────────────────
    let peak = state.peak_profit_pct;
    let trigger = match state.tier {
        Tier::None  => None,
        Tier::Low   => (current_pct <= cfg.low_floor_pct).then_some(ExitTrigger::LowFloor),
        Tier::Tier1 => (current_pct <= peak * (1.0 - cfg.tier1_retrace)).then_some(ExitTrigger::Tier1Retrace),
        Tier::Tier2 => (current_pct <= peak * (1.0 - cfg.tier2_retrace)).then_some(ExitTrigger::Tier2Retrace),
    };

    let outcome = TrailingOutcome {
        action: trigger.map(TrailingAction::Close).unwrap_or(TrailingAction::Hold),
        advanced,
        peak_pct: peak,
        tier: state.tier,
        current_pct,
    };

    match trigger {
        Some(t) => {
            info!(trigger = ?t, current_pct, peak, tier = %state.tier, "🔒 Profit lock triggered");
            state.reset();
        }
        None => debug!(current_pct, peak, tier = %state.tier, "trailing hold"),
    }
    outcome
}

/// Align the trailing state with what the exchange says is open.
///
/// Returns `true` when the state had to be reset (position closed
/// externally, or its side flipped since the state was recorded).
pub fn sync_with_position(state: &mut TrailingState, position: Option<&Position>) -> bool {
    match position {
        None => {
            let dirty = !state.is_reset() || state.side.is_some();
            state.reset();
            dirty
        }
        Some(pos) => match state.side {
            Some(side) if side == pos.side => false,
            Some(_) => {
                state.reset();
                state.side = Some(pos.side);
                true
            }
            None => {
                // first sighting of this position; keep any peak restored from storage
                state.side = Some(pos.side);
                false
            }
        },
    }
}

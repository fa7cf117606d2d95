//! # engine::sizing — Position Sizing Engine
//!
//! ชั้นกั้นขนาด position ก่อนยิง Order — pure function, no I/O
//!
//! ## ขั้นตอน
//! 1. **Multipliers**  — confidence × trend × RSI on top of the base notional
//! 2. **Risk cap**     — notional × stop distance ≤ 2 % of balance
//! 3. **Notional cap** — notional ≤ 10 % of balance
//! 4. **Contracts**    — notional ÷ (price × ctVal), floored to the lot step
//!
//! Caps only ever scale down, to the tightest one.

use serde::Serialize;
use tracing::info;

use crate::config::Env;
use crate::models::{Action, Confidence, Signal, Trend};

pub const CONF_MULT_HIGH:   f64 = 1.5;
pub const CONF_MULT_MEDIUM: f64 = 1.0;
pub const CONF_MULT_LOW:    f64 = 0.5;
pub const TREND_MULT_ALIGNED: f64 = 1.2;
pub const RSI_MULT_EXTREME:   f64 = 0.7;
pub const RSI_OVERBOUGHT: f64 = 75.0;
pub const RSI_OVERSOLD:   f64 = 25.0;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingConfig {
    /// Max loss at the stop, percent of balance
    pub max_risk_pct:     f64,
    /// Max notional, percent of balance
    pub max_notional_pct: f64,
    pub leverage_min:     u32,
    pub leverage_max:     u32,
    /// Stop distance (percent) assumed when a signal carries no stop price
    pub fallback_stop_pct: f64,
}

impl SizingConfig {
    pub fn from_env(env: &Env, hard_stop_pct: f64) -> anyhow::Result<Self> {
        let cfg = Self {
            max_risk_pct:      env.parse_or("MAX_RISK_PCT", 2.0)?,
            max_notional_pct:  env.parse_or("MAX_NOTIONAL_PCT", 10.0)?,
            leverage_min:      env.parse_or("LEVERAGE_MIN", 3)?,
            leverage_max:      env.parse_or("LEVERAGE_MAX", 20)?,
            fallback_stop_pct: hard_stop_pct,
        };
        if cfg.leverage_min == 0 || cfg.leverage_min > cfg.leverage_max {
            anyhow::bail!("LEVERAGE_MIN/LEVERAGE_MAX must satisfy 1 <= min <= max");
        }
        if !(cfg.max_risk_pct > 0.0 && cfg.max_notional_pct > 0.0) {
            anyhow::bail!("MAX_RISK_PCT and MAX_NOTIONAL_PCT must be > 0");
        }
        Ok(cfg)
    }

    pub fn clamp_leverage(&self, leverage: u32) -> u32 {
        leverage.clamp(self.leverage_min, self.leverage_max)
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_risk_pct:      2.0,
            max_notional_pct:  10.0,
            leverage_min:      3,
            leverage_max:      20,
            fallback_stop_pct: 2.0,
        }
    }
}

// ─── Input / Result ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SizingInput<'a> {
    pub signal:           &'a Signal,
    pub trend:            Trend,
    pub rsi:              f64,
    /// Account equity in USDT
    pub balance:          f64,
    pub mark_price:       f64,
    pub base_notional:    f64,
    /// Base units per contract
    pub contract_value:   f64,
    /// Lot step in contracts
    pub min_increment:    f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapKind {
    Risk,
    Notional,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizingAdjustment {
    pub cap:    CapKind,
    pub before: f64,
    pub after:  f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizingResult {
    /// Target notional after multipliers and caps
    pub notional:    f64,
    /// Floored to `min_increment`; 0 means "too small to trade"
    pub contracts:   f64,
    /// AI-suggested leverage clamped into bounds; `None` keeps whatever
    /// the account already runs with
    pub leverage:    Option<u32>,
    pub multiplier:  f64,
    pub adjustments: Vec<SizingAdjustment>,
}

// ─── Multipliers ──────────────────────────────────────────────────────────────

pub fn confidence_multiplier(c: Confidence) -> f64 {
    match c {
        Confidence::High   => CONF_MULT_HIGH,
        Confidence::Medium => CONF_MULT_MEDIUM,
        Confidence::Low    => CONF_MULT_LOW,
    }
}

/// Bonus only when a strong trend points the same way as the signal.
pub fn trend_multiplier(trend: Trend, action: Action) -> f64 {
    match (trend, action) {
        (Trend::StrongUp, Action::Buy) | (Trend::StrongDown, Action::Sell) => TREND_MULT_ALIGNED,
        _ => 1.0,
    }
}

pub fn rsi_multiplier(rsi: f64) -> f64 {
    if rsi > RSI_OVERBOUGHT || rsi < RSI_OVERSOLD { RSI_MULT_EXTREME } else { 1.0 }
}

/// Floor to a multiple of `step`, tolerant of float noise just under a step.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if !(step > 0.0) || !(value > 0.0) {
        return 0.0;
    }
    let steps = (value / step + 1e-9).floor();
    // round the product to the step's decimals so 3 × 0.1 prints as 0.3
    let decimals = (-step.log10()).ceil().max(0.0) as i32 + 2;
    let factor = 10f64.powi(decimals);
    ((steps * step) * factor).round() / factor
}

// ─── Sizing ───────────────────────────────────────────────────────────────────

pub fn size_position(input: &SizingInput<'_>, cfg: &SizingConfig) -> SizingResult {
    let signal = input.signal;
    let multiplier = confidence_multiplier(signal.confidence)
        * trend_multiplier(input.trend, signal.action)
        * rsi_multiplier(input.rsi);

    let mut notional = (input.base_notional * multiplier).max(0.0);
    let mut adjustments = Vec::new();
    let balance = input.balance.max(0.0);

    // ── Risk cap ──────────────────────────────────────────────────────────────
    let stop_distance = signal
        .suggested_stop_price
        .filter(|_| input.mark_price > 0.0)
        .map(|stop| (input.mark_price - stop).abs() / input.mark_price)
        .filter(|d| *d > 0.0)
        .unwrap_or(cfg.fallback_stop_pct / 100.0);
    let risk_cap = balance * cfg.max_risk_pct / 100.0 / stop_distance;

    // ── Notional cap ──────────────────────────────────────────────────────────
    let notional_cap = balance * cfg.max_notional_pct / 100.0;

    for (cap, limit) in [(CapKind::Risk, risk_cap), (CapKind::Notional, notional_cap)] {
        if notional > limit {
            adjustments.push(SizingAdjustment { cap, before: notional, after: limit });
            notional = limit;
        }
    }
    if !adjustments.is_empty() {
        info!(
            notional,
            risk_cap,
            notional_cap,
            caps = adjustments.len(),
            "✂️ Sizing capped"
        );
    }

    // ── Contracts ─────────────────────────────────────────────────────────────
    let per_contract = input.mark_price * input.contract_value;
    let contracts = if per_contract > 0.0 {
        floor_to_step(notional / per_contract, input.min_increment)
    } else {
        0.0
    };

    let leverage = signal.suggested_leverage.map(|l| cfg.clamp_leverage(l));

    SizingResult { notional, contracts, leverage, multiplier, adjustments }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn signal(action: Action, confidence: Confidence, stop: Option<f64>, lev: Option<u32>) -> Signal {
        Signal {
            timestamp:            Utc::now(),
            action,
            confidence,
            suggested_leverage:   lev,
            suggested_stop_price: stop,
            take_profit:          None,
            rationale:            String::new(),
            fail_safe:            false,
        }
    }

    fn input<'a>(s: &'a Signal, balance: f64) -> SizingInput<'a> {
        SizingInput {
            signal:           s,
            trend:            Trend::Ranging,
            rsi:              50.0,
            balance,
            mark_price:       100.0,
            base_notional:    100.0,
            contract_value:   0.01,
            min_increment:    0.01,
        }
    }

    #[test]
    fn multipliers_compose() {
        let s = signal(Action::Buy, Confidence::High, Some(98.0), None);
        let mut i = input(&s, 100_000.0);
        i.trend = Trend::StrongUp;
        i.rsi = 80.0;
        let r = size_position(&i, &SizingConfig::default());
        // 100 × 1.5 × 1.2 × 0.7 = 126
        assert!((r.notional - 126.0).abs() < 1e-9);
        assert!(r.adjustments.is_empty());
    }

    #[test]
    fn counter_trend_gets_no_bonus() {
        assert_eq!(trend_multiplier(Trend::StrongUp, Action::Sell), 1.0);
        assert_eq!(trend_multiplier(Trend::StrongDown, Action::Sell), TREND_MULT_ALIGNED);
    }

    #[test]
    fn notional_cap_binds() {
        // balance 500 → notional cap 50, risk cap 500×2%/2% = 500
        let s = signal(Action::Buy, Confidence::Medium, Some(98.0), None);
        let r = size_position(&input(&s, 500.0), &SizingConfig::default());
        assert!((r.notional - 50.0).abs() < 1e-9);
        assert_eq!(r.adjustments.len(), 1);
        assert_eq!(r.adjustments[0].cap, CapKind::Notional);
        // 50 USDT ÷ (100 × 0.01) = 50 contracts
        assert!((r.contracts - 50.0).abs() < 1e-9);
    }

    #[test]
    fn wide_stop_makes_risk_cap_bind() {
        // High → 150; stop 20 % away: risk cap = 600 × 2% / 0.2 = 60, notional cap = 60
        let s = signal(Action::Sell, Confidence::High, Some(120.0), None);
        let r = size_position(&input(&s, 600.0), &SizingConfig::default());
        assert!((r.notional - 60.0).abs() < 1e-9);
        assert_eq!(r.adjustments[0].cap, CapKind::Risk);
    }

    #[test]
    fn leverage_clamped_into_bounds() {
        let s = signal(Action::Buy, Confidence::Low, None, Some(50));
        assert_eq!(size_position(&input(&s, 1_000.0), &SizingConfig::default()).leverage, Some(20));
        let s = signal(Action::Buy, Confidence::Low, None, Some(1));
        assert_eq!(size_position(&input(&s, 1_000.0), &SizingConfig::default()).leverage, Some(3));
        let s = signal(Action::Buy, Confidence::Low, None, None);
        assert_eq!(size_position(&input(&s, 1_000.0), &SizingConfig::default()).leverage, None);
    }

    #[test]
    fn tiny_balance_floors_to_zero_contracts() {
        let s = signal(Action::Buy, Confidence::Low, None, None);
        let mut i = input(&s, 0.5);
        i.min_increment = 1.0;
        assert_eq!(size_position(&i, &SizingConfig::default()).contracts, 0.0);
    }

    #[test]
    fn floor_to_step_handles_float_noise() {
        assert_eq!(floor_to_step(0.30000000000000004, 0.1), 0.3);
        assert_eq!(floor_to_step(0.29999999999, 0.1), 0.3);
        assert_eq!(floor_to_step(0.35, 0.1), 0.3);
        assert_eq!(floor_to_step(7.0, 1.0), 7.0);
        assert_eq!(floor_to_step(-1.0, 1.0), 0.0);
    }

    fn trend_from(i: usize) -> Trend {
        [Trend::StrongUp, Trend::StrongDown, Trend::Ranging][i]
    }

    proptest! {
        #[test]
        fn caps_always_hold_and_sizing_is_idempotent(
            balance in 1.0f64..1_000_000.0,
            base in 1.0f64..100_000.0,
            mark in 0.01f64..100_000.0,
            stop_frac in 0.001f64..0.5,
            conf in 0usize..3,
            trend in 0usize..3,
            sell in any::<bool>(),
            rsi in 0.0f64..100.0,
        ) {
            let confidence = [Confidence::Low, Confidence::Medium, Confidence::High][conf];
            // protective side of the mark for either direction
            let (action, stop) = if sell {
                (Action::Sell, mark * (1.0 + stop_frac))
            } else {
                (Action::Buy, mark * (1.0 - stop_frac))
            };
            let s = signal(action, confidence, Some(stop), Some(10));
            let i = SizingInput {
                signal: &s,
                trend: trend_from(trend),
                rsi,
                balance,
                mark_price: mark,
                base_notional: base,
                contract_value: 0.01,
                min_increment: 0.01,
            };
            let cfg = SizingConfig::default();
            let r = size_position(&i, &cfg);

            let tol = 1e-9 * balance.max(1.0);
            prop_assert!(r.notional <= balance * 0.10 + tol);
            let stop_distance = (mark - stop).abs() / mark;
            prop_assert!(r.notional * stop_distance <= balance * 0.02 + tol);
            // never above the uncapped product of the multipliers
            prop_assert!(r.notional <= base * r.multiplier * (1.0 + 1e-12));
            // floored quantity never exceeds the capped notional
            prop_assert!(r.contracts * mark * 0.01 <= r.notional * (1.0 + 1e-9) + 1e-9);

            let again = size_position(&i, &cfg);
            prop_assert_eq!(r, again);
        }
    }
}

//! # brain::parse — AI text → [`InferenceOutcome`]
//!
//! The raw reply never reaches the pipeline directly:
//!
//! 1. strip ```` ```json ```` fences
//! 2. take the outermost `{ … }`
//! 3. deserialize loosely (numbers may arrive as strings)
//! 4. validate against the current price and leverage bounds
//!
//! Anything that fails → `Invalid(reason)`; the caller collapses that into
//! the HOLD / LOW fail-safe.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{Action, Confidence, InferenceOutcome, Signal};

/// Longest rationale kept from a reply
const MAX_RATIONALE_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(alias = "action")]
    signal:      Option<String>,
    #[serde(alias = "rationale")]
    reason:      Option<String>,
    stop_loss:   Option<Value>,
    take_profit: Option<Value>,
    confidence:  Option<String>,
    leverage:    Option<Value>,
}

/// Remove markdown code fences (```json … ```), keep the inner text.
pub fn strip_markdown(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Outermost `{ … }` slice, if any.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end   = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Numbers or numeric strings ("42000.5", "42,000") → f64.
fn number(v: &Value) -> Option<f64> {
    let n: Option<f64> = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    };
    n.filter(|x| x.is_finite())
}

fn parse_action(s: &str) -> Option<Action> {
    match s.trim().to_ascii_uppercase().as_str() {
        "BUY"  => Some(Action::Buy),
        "SELL" => Some(Action::Sell),
        "HOLD" => Some(Action::Hold),
        _ => None,
    }
}

fn parse_confidence(s: &str) -> Option<Confidence> {
    match s.trim().to_ascii_uppercase().as_str() {
        "HIGH"   => Some(Confidence::High),
        "MEDIUM" => Some(Confidence::Medium),
        "LOW"    => Some(Confidence::Low),
        _ => None,
    }
}

/// Parse and validate one reply.
///
/// `price` is the reference price the stop must sit on the protective side
/// of; `leverage_bounds` is `(min, max)` and suggested leverage is clamped.
pub fn parse_signal(
    text:            &str,
    price:           f64,
    leverage_bounds: (u32, u32),
    at:              DateTime<Utc>,
) -> InferenceOutcome {
    let cleaned = strip_markdown(text);
    let Some(json) = extract_json(&cleaned) else {
        warn!(reply_len = text.len(), "AI reply has no JSON object");
        return InferenceOutcome::Invalid("no JSON object in reply".into());
    };

    let raw: RawSignal = match serde_json::from_str(json) {
        Ok(r) => r,
        Err(e) => return InferenceOutcome::Invalid(format!("malformed JSON: {e}")),
    };

    // ── action / confidence ───────────────────────────────────────────────────
    let Some(action) = raw.signal.as_deref().and_then(parse_action) else {
        return InferenceOutcome::Invalid(format!("unknown action {:?}", raw.signal));
    };
    let Some(confidence) = raw.confidence.as_deref().and_then(parse_confidence) else {
        return InferenceOutcome::Invalid(format!("unknown confidence {:?}", raw.confidence));
    };

    // ── stop ──────────────────────────────────────────────────────────────────
    let stop = raw.stop_loss.as_ref().and_then(number).filter(|s| *s > 0.0);
    match (action, stop) {
        (Action::Buy | Action::Sell, None) => {
            return InferenceOutcome::Invalid(format!("{action} without a usable stop_loss"));
        }
        (Action::Buy, Some(s)) if s >= price => {
            return InferenceOutcome::Invalid(format!("BUY stop {s} not below price {price}"));
        }
        (Action::Sell, Some(s)) if s <= price => {
            return InferenceOutcome::Invalid(format!("SELL stop {s} not above price {price}"));
        }
        _ => {}
    }

    // ── take profit: dropped (not fatal) when on the wrong side ───────────────
    let take_profit = raw.take_profit.as_ref().and_then(number).filter(|tp| match action {
        Action::Buy  => *tp > price,
        Action::Sell => *tp < price,
        Action::Hold => *tp > 0.0,
    });
    if raw.take_profit.is_some() && take_profit.is_none() {
        debug!(%action, "take_profit ignored (missing, non-numeric or wrong side)");
    }

    // ── leverage: clamp, never reject ─────────────────────────────────────────
    let (lo, hi) = leverage_bounds;
    let suggested_leverage = raw
        .leverage
        .as_ref()
        .and_then(number)
        .filter(|l| *l >= 1.0)
        .map(|l| (l.round() as u32).clamp(lo, hi));

    let rationale: String = raw.reason.unwrap_or_default().chars().take(MAX_RATIONALE_CHARS).collect();

    InferenceOutcome::Valid(Signal {
        timestamp: at,
        action,
        confidence,
        suggested_leverage,
        suggested_stop_price: stop,
        take_profit,
        rationale,
        fail_safe: false,
    })
}

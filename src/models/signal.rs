//! # models::signal
//!
//! [`Signal`] คือผลลัพธ์จาก AI หนึ่งครั้งต่อ cycle ต่อ symbol
//! Once built it is never mutated; it goes into the rolling history
//! (see `brain::history`) whether it passes the filter or not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Action / Confidence ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// BUY / SELL lead to orders, HOLD never does.
    pub fn is_actionable(self) -> bool {
        !matches!(self, Action::Hold)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy  => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered LOW < MEDIUM < HIGH so the filter can compare against a floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High   => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low    => "LOW",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Signal ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp:            DateTime<Utc>,
    pub action:               Action,
    pub confidence:           Confidence,
    pub suggested_leverage:   Option<u32>,
    pub suggested_stop_price: Option<f64>,
    pub take_profit:          Option<f64>,
    pub rationale:            String,
    /// true = inference failed and this HOLD/LOW was substituted
    #[serde(default)]
    pub fail_safe:            bool,
}

impl Signal {
    /// HOLD / LOW substitute used whenever inference cannot be trusted.
    pub fn fail_safe(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            timestamp:            at,
            action:               Action::Hold,
            confidence:           Confidence::Low,
            suggested_leverage:   None,
            suggested_stop_price: None,
            take_profit:          None,
            rationale:            reason.into(),
            fail_safe:            true,
        }
    }
}

// ─── Inference Outcome ────────────────────────────────────────────────────────

/// Tagged result of one inference round-trip, before the fail-safe collapse.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    Valid(Signal),
    Invalid(String),
    Timeout,
}

impl InferenceOutcome {
    /// Collapse into the Signal that enters the pipeline.
    pub fn into_signal(self, at: DateTime<Utc>) -> Signal {
        match self {
            InferenceOutcome::Valid(signal)   => signal,
            InferenceOutcome::Invalid(reason) => Signal::fail_safe(format!("invalid inference: {reason}"), at),
            InferenceOutcome::Timeout         => Signal::fail_safe("inference timed out", at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }

    #[test]
    fn invalid_and_timeout_collapse_to_hold_low() {
        let now = Utc::now();
        for outcome in [InferenceOutcome::Invalid("bad json".into()), InferenceOutcome::Timeout] {
            let s = outcome.into_signal(now);
            assert_eq!(s.action, Action::Hold);
            assert_eq!(s.confidence, Confidence::Low);
            assert!(s.fail_safe);
        }
    }

    #[test]
    fn action_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Action::Buy).unwrap(), "\"BUY\"");
    }
}

//! # models::position
//!
//! `Position`      = สถานะจริงบน exchange (ground truth, re-read every cycle)
//! `TrailingState` = peak / tier ที่ระบบจำไว้เอง ต่อ symbol ต่อ position
//!
//! Flat is modelled as `Option<Position>::None`, never as a zero-size Position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Action;

// ─── Side / Margin ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long  => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Direction a signal asks for; HOLD has none.
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Buy  => Some(Side::Long),
            Action::Sell => Some(Side::Short),
            Action::Hold => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long  => "long",
            Side::Short => "short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginMode::Cross    => "cross",
            MarginMode::Isolated => "isolated",
        }
    }
}

impl std::str::FromStr for MarginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cross"    => Ok(MarginMode::Cross),
            "isolated" => Ok(MarginMode::Isolated),
            other      => Err(format!("unknown margin mode '{other}'")),
        }
    }
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol:         String,
    pub side:           Side,
    /// Always > 0; direction lives in `side`
    pub contracts:      f64,
    pub entry_price:    f64,
    pub leverage:       u32,
    pub margin_mode:    MarginMode,
    pub opened_at:      DateTime<Utc>,
    /// Exchange-reported mark, if the venue gives one
    #[serde(default)]
    pub mark_price:     Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: Option<f64>,
}

impl Position {
    /// Unlevered price move relative to entry, in percent, signed so that
    /// positive always means the position is in profit.
    pub fn profit_pct(&self, mark: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = (mark - self.entry_price) / self.entry_price * 100.0;
        match self.side {
            Side::Long  => raw,
            Side::Short => -raw,
        }
    }
}

// ─── Trailing ─────────────────────────────────────────────────────────────────

/// Profit-lock tier. Ordered so that "advance" is a plain `>` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    None,
    Low,
    Tier1,
    Tier2,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::None  => "NONE",
            Tier::Low   => "LOW",
            Tier::Tier1 => "TIER1",
            Tier::Tier2 => "TIER2",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-position trailing memory. Reset to default on close or flip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub peak_profit_pct: f64,
    pub tier:            Tier,
    /// Side of the position this state belongs to (None while flat)
    #[serde(default)]
    pub side:            Option<Side>,
}

impl Default for TrailingState {
    fn default() -> Self {
        Self { peak_profit_pct: 0.0, tier: Tier::None, side: None }
    }
}

impl TrailingState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_reset(&self) -> bool {
        self.tier == Tier::None && self.peak_profit_pct == 0.0
    }
}

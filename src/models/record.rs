//! # models::record
//!
//! Append-only records: [`TradeRecord`], [`AuditRecord`], [`EquitySnapshot`].
//!
//! ทุก decision ของ pipeline (แม้แต่ no-op) ต้องมี AuditRecord พร้อม
//! [`ReasonCode`] เสมอ เพื่อให้ย้อนดูได้ว่าทำไมถึงทำ / ไม่ทำ

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Confidence, Side, Tier};

// ─── Reason Codes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // protective exits
    ExitHardStop,
    ExitLowFloor,
    ExitTier1Retrace,
    ExitTier2Retrace,
    // trailing bookkeeping
    TierAdvanced,
    TrailingReset,
    // signal-side no-ops
    SignalHold,
    SuppressedChoppy,
    SuppressedCooldown,
    SizeBelowIncrement,
    DeltaBelowIncrement,
    // liquidity
    DeferredSpread,
    DeferredDepth,
    DeferredEmptyBook,
    // executed
    Opened,
    Added,
    Reduced,
    Flipped,
    LeverageUpdated,
    LeverageUpdateFailed,
    // failures
    ExecutionFailed,
    ExecutionRejected,
    CycleAbandoned,
    // state
    Reconciled,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::ExitHardStop         => "exit_hard_stop",
            ReasonCode::ExitLowFloor         => "exit_low_floor",
            ReasonCode::ExitTier1Retrace     => "exit_tier1_retrace",
            ReasonCode::ExitTier2Retrace     => "exit_tier2_retrace",
            ReasonCode::TierAdvanced         => "tier_advanced",
            ReasonCode::TrailingReset        => "trailing_reset",
            ReasonCode::SignalHold           => "signal_hold",
            ReasonCode::SuppressedChoppy     => "suppressed_choppy",
            ReasonCode::SuppressedCooldown   => "suppressed_cooldown",
            ReasonCode::SizeBelowIncrement   => "size_below_increment",
            ReasonCode::DeltaBelowIncrement  => "delta_below_increment",
            ReasonCode::DeferredSpread       => "deferred_spread",
            ReasonCode::DeferredDepth        => "deferred_depth",
            ReasonCode::DeferredEmptyBook    => "deferred_empty_book",
            ReasonCode::Opened               => "opened",
            ReasonCode::Added                => "added",
            ReasonCode::Reduced              => "reduced",
            ReasonCode::Flipped              => "flipped",
            ReasonCode::LeverageUpdated      => "leverage_updated",
            ReasonCode::LeverageUpdateFailed => "leverage_update_failed",
            ReasonCode::ExecutionFailed      => "execution_failed",
            ReasonCode::ExecutionRejected    => "execution_rejected",
            ReasonCode::CycleAbandoned       => "cycle_abandoned",
            ReasonCode::Reconciled           => "reconciled",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Audit ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    /// Trailing CLOSE (hard stop or tier retrace)
    ProtectiveExit,
    /// Signal-driven OPEN / ADD / REDUCE / FLIP went through
    Executed,
    NoOp,
    Suppressed,
    Deferred,
    TierTransition,
    Leverage,
    Failure,
    Reconcile,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::ProtectiveExit => "PROTECTIVE_EXIT",
            AuditKind::Executed       => "EXECUTED",
            AuditKind::NoOp           => "NO_OP",
            AuditKind::Suppressed     => "SUPPRESSED",
            AuditKind::Deferred       => "DEFERRED",
            AuditKind::TierTransition => "TIER_TRANSITION",
            AuditKind::Leverage       => "LEVERAGE",
            AuditKind::Failure        => "FAILURE",
            AuditKind::Reconcile      => "RECONCILE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id:     Uuid,
    /// Model lane that produced the record (`ENABLED_MODELS` entry)
    #[serde(default)]
    pub model:  String,
    pub symbol: String,
    pub at:     DateTime<Utc>,
    pub kind:   AuditKind,
    pub reason: ReasonCode,
    pub detail: String,
    /// Set on failures that an operator should look at
    pub alert:  bool,
    #[serde(default)]
    pub tier_from: Option<Tier>,
    #[serde(default)]
    pub tier_to:   Option<Tier>,
}

impl AuditRecord {
    pub fn new(symbol: &str, kind: AuditKind, reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            id:        Uuid::new_v4(),
            model:     String::new(),
            symbol:    symbol.to_string(),
            at:        Utc::now(),
            kind,
            reason,
            detail:    detail.into(),
            alert:     false,
            tier_from: None,
            tier_to:   None,
        }
    }

    pub fn alerting(mut self) -> Self {
        self.alert = true;
        self
    }

    pub fn with_tiers(mut self, from: Tier, to: Tier) -> Self {
        self.tier_from = Some(from);
        self.tier_to   = Some(to);
        self
    }
}

// ─── Trade ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeKind {
    Open,
    Add,
    Reduce,
    Close,
}

impl TradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeKind::Open   => "OPEN",
            TradeKind::Add    => "ADD",
            TradeKind::Reduce => "REDUCE",
            TradeKind::Close  => "CLOSE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeTrigger {
    Signal,
    ProtectiveExit,
    /// Fill found on the exchange that no acknowledged order explains
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id:        Uuid,
    #[serde(default)]
    pub model:           String,
    pub symbol:          String,
    pub kind:            TradeKind,
    /// Side of the position being opened / added / reduced / closed
    pub side:            Side,
    pub contracts:       f64,
    /// Reference price at decision time (book mid)
    pub price:           f64,
    pub leverage:        u32,
    pub confidence:      Option<Confidence>,
    pub trigger:         TradeTrigger,
    /// Empty for reconcile records
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub at:              DateTime<Utc>,
}

// ─── Equity ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub at:             DateTime<Utc>,
    pub total_equity:   f64,
    pub available:      f64,
    pub unrealized_pnl: f64,
    pub currency:       String,
}

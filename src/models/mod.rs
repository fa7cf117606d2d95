//! Domain models shared across the whole trading core.

pub mod market;
pub mod position;
pub mod record;
pub mod signal;

pub use market::{BookLevel, Candle, IndicatorSummary, Levels, MarketSnapshot, OrderBook, Trend};
pub use position::{MarginMode, Position, Side, Tier, TrailingState};
pub use record::{AuditKind, AuditRecord, EquitySnapshot, ReasonCode, TradeKind, TradeRecord, TradeTrigger};
pub use signal::{Action, Confidence, InferenceOutcome, Signal};

//! # engine — per-symbol decision and risk pipeline
//!
//! ```text
//! scheduler ──▶ cycle ──┬─ collector ── indicators
//!                       ├─ trailing
//!                       ├─ sizing
//!                       ├─ liquidity
//!                       └─ executor ── journal
//! ```

pub mod collector;
pub mod cycle;
pub mod executor;
pub mod indicators;
pub mod journal;
pub mod liquidity;
pub mod scheduler;
pub mod sizing;
pub mod trailing;

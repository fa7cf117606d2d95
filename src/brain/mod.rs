//! # brain — AI signal side of the cycle
//!
//! ```text
//!                   sentiment
//!                     │
//!                     ▼
//! MarketSnapshot ─▶ prompt ─▶ ai (DeepSeek / OpenAI / Claude)
//!                                   │
//!                                   ▼
//!                 parse ─▶ InferenceOutcome ─▶ Signal ─▶ filter
//!                                                 │
//!                                                 └─▶ history (graded next cycle)
//! ```

pub mod ai;
pub mod filter;
pub mod generator;
pub mod history;
pub mod parse;
pub mod prompt;
pub mod sentiment;

pub use ai::{AiClient, Inference};

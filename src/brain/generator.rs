//! # brain::generator — Signal Generator
//!
//! prompt → `Inference::complete` (outer timeout) → `parse_signal`
//!
//! ไม่ว่าจะ error แบบไหน ผลลัพธ์คือ [`InferenceOutcome`] เสมอ; ไม่มี raw
//! reply ตัวไหนหลุดออกไปเป็น action โดยไม่ผ่าน validation

use chrono::Utc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::brain::ai::Inference;
use crate::brain::parse::parse_signal;
use crate::brain::prompt::{build_prompt, system_prompt, PromptContext};
use crate::error::InferenceError;
use crate::models::InferenceOutcome;

pub async fn generate(inference: &dyn Inference, ctx: &PromptContext<'_>) -> InferenceOutcome {
    let symbol = &ctx.snapshot.symbol;
    let system = system_prompt(&ctx.snapshot.timeframe);
    let prompt = build_prompt(ctx);

    let reply = match timeout(inference.timeout(), inference.complete(&system, &prompt)).await {
        Err(_) | Ok(Err(InferenceError::Timeout)) => {
            warn!(%symbol, "⏱️ Inference timed out → HOLD");
            return InferenceOutcome::Timeout;
        }
        Ok(Err(e)) => {
            warn!(%symbol, error = %e, "⚠️ Inference failed → HOLD");
            return InferenceOutcome::Invalid(e.to_string());
        }
        Ok(Ok(text)) => text,
    };

    let outcome = parse_signal(
        &reply,
        ctx.snapshot.price,
        (ctx.leverage_min, ctx.leverage_max),
        Utc::now(),
    );

    match &outcome {
        InferenceOutcome::Valid(s) => info!(
            %symbol,
            action     = %s.action,
            confidence = %s.confidence,
            stop       = ?s.suggested_stop_price,
            leverage   = ?s.suggested_leverage,
            "🧠 Signal received"
        ),
        InferenceOutcome::Invalid(reason) => warn!(%symbol, %reason, "❌ Invalid AI reply → HOLD"),
        InferenceOutcome::Timeout => {}
    }
    outcome
}

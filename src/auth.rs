//! # auth — API Key Middleware
//!
//! ป้องกัน status surface ด้วย `X-API-Key` header
//!
//! ## Mode
//! - `API_KEY` ไม่ได้ตั้ง (หรือ empty) → **Allow All** (Dev Mode)
//! - `API_KEY` ตั้งค่า → ต้องส่ง `X-API-Key: <key>` ทุก Request
//!
//! ## ยกเว้น
//! `/health` ไม่ต้อง Auth (process supervisor เรียกเช็คสถานะ)
//!
//! ```bash
//! curl -H "X-API-Key: super-secret-key-here" http://localhost:3000/api/status
//! ```

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::state::SharedState;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Axum middleware, wired with `from_fn_with_state`. The key is read once
/// at start-up into [`AppState::api_key`](crate::state::AppState).
pub async fn require_api_key(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    // ── Dev Mode: ไม่มี API_KEY → ยอมให้ผ่านหมด ─────────────────────────────
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    // ── ยกเว้น Health Check ───────────────────────────────────────────────────
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    // ── ตรวจสอบ Header ────────────────────────────────────────────────────────
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected {
        next.run(request).await
    } else {
        warn!(path = request.uri().path(), "❌ Unauthorized request — invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
                "hint":  "Set X-API-Key header with your API key"
            })),
        )
            .into_response()
    }
}

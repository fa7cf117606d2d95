//! # routes
//!
//! Read-only HTTP surface over the status board and the store.

pub mod monitor;
pub mod status;

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth::require_api_key, state::SharedState};

pub fn router(state: SharedState) -> Router {
    // ── CORS: อนุญาต Dashboard ทุก origin ─────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health (ไม่ต้อง Auth) ──
        .route("/health",               get(status::health))
        // ── Status ──
        .route("/api/status",           get(status::get_status))
        .route("/api/symbols/:symbol",  get(status::get_symbol))
        .route("/api/history",          get(status::get_history))
        // ── Live stream ──
        .route("/ws/monitor",           get(monitor::ws_monitor))
        // ── Middleware ──
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

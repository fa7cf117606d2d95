//! # routes::status
//!
//! Read-only status endpoints. ทุก handler อ่านจาก `StatusBoard` หรือ
//! `Store::query_range` เท่านั้น ไม่มี handler ไหนแก้ core state
//!
//! | Method | Path                   | Description                                  |
//! |--------|------------------------|----------------------------------------------|
//! | GET    | `/health`              | liveness + run state (ไม่ต้อง Auth)          |
//! | GET    | `/api/status`          | snapshot ทุก lane `(model, symbol)`          |
//! | GET    | `/api/symbols/:symbol` | position / signal / tier ต่อ model           |
//! | GET    | `/api/history`         | trades / audits / equity ในช่วงเวลา          |
//!
//! `/api/symbols/:symbol` and `/api/history` take an optional `model`
//! query parameter to narrow the answer to one lane.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{error::AppError, state::SharedState, store::RecordKind};

const DEFAULT_HISTORY_LIMIT: usize = 200;
const MAX_HISTORY_LIMIT:     usize = 2_000;

fn uptime_secs(state: &SharedState) -> i64 {
    (Utc::now() - state.started_at).num_seconds()
}

// ─── GET /health ──────────────────────────────────────────────────────────────

pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":            true,
        "uptime_secs":   uptime_secs(&state),
        "running_state": state.board.get_running_state(),
    }))
}

// ─── GET /api/status ──────────────────────────────────────────────────────────

pub async fn get_status(State(state): State<SharedState>) -> impl IntoResponse {
    let symbols = state.board.snapshot().await;
    Json(json!({
        "ok":            true,
        "running_state": state.board.get_running_state(),
        "uptime_secs":   uptime_secs(&state),
        "symbols":       symbols,
    }))
}

// ─── GET /api/symbols/:symbol ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct LaneQuery {
    pub model: Option<String>,
}

pub async fn get_symbol(
    State(state): State<SharedState>,
    Path(symbol): Path<String>,
    Query(q): Query<LaneQuery>,
) -> Result<impl IntoResponse, AppError> {
    let board  = &state.board;
    let models = match q.model {
        Some(model) => vec![model],
        None        => board.models_for(&symbol).await,
    };

    let mut lanes = Vec::with_capacity(models.len());
    for model in models {
        let Some(tier) = board.get_trailing_tier(&model, &symbol).await else { continue };
        lanes.push(json!({
            "model":         model,
            "position":      board.get_current_position(&model, &symbol).await,
            "last_signal":   board.get_last_signal(&model, &symbol).await,
            "trailing_tier": tier,
        }));
    }

    if lanes.is_empty() {
        return Err(AppError::NotFound(format!("symbol '{symbol}' is not traded by this instance")));
    }
    Ok(Json(json!({ "ok": true, "symbol": symbol, "lanes": lanes })))
}

// ─── GET /api/history ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// trade | audit | equity (default trade)
    pub kind:   Option<String>,
    pub model:  Option<String>,
    pub symbol: Option<String>,
    /// RFC 3339 or unix millis
    pub from:   Option<String>,
    pub to:     Option<String>,
    pub limit:  Option<usize>,
}

/// Accepts `2024-05-01T12:00:00Z` or `1714564800000`.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, AppError> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| AppError::BadRequest(format!("timestamp out of range: {raw}")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AppError::BadRequest(format!("invalid timestamp '{raw}': {e}")))
}

pub async fn get_history(
    State(state): State<SharedState>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, AppError> {
    let kind: RecordKind = q
        .kind
        .as_deref()
        .unwrap_or("trade")
        .parse()
        .map_err(AppError::BadRequest)?;

    let to = match q.to.as_deref() {
        Some(raw) => parse_instant(raw)?,
        None      => Utc::now(),
    };
    let from = match q.from.as_deref() {
        Some(raw) => parse_instant(raw)?,
        None      => to - Duration::hours(24),
    };
    if from >= to {
        return Err(AppError::BadRequest("'from' must be earlier than 'to'".into()));
    }
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);

    let records = state
        .store
        .query_range(kind, q.model.as_deref(), q.symbol.as_deref(), from, to, limit)
        .await?;

    Ok(Json(json!({
        "ok":      true,
        "kind":    kind,
        "from":    from,
        "to":      to,
        "count":   records.len(),
        "records": records,
    })))
}

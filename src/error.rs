//! # error
//!
//! Centralised error types.
//!
//! - [`ExchangeError`]  — typed failures from the exchange adapter
//! - [`InferenceError`] — failures talking to the AI provider
//! - [`SentimentError`] — failures reading the market-sentiment feed
//! - [`StoreError`]     — persistence failures
//! - [`CycleError`]     — why one symbol's cycle ended early
//! - [`AppError`]       — HTTP status surface; `IntoResponse` turns it into
//!   a JSON body so the dashboard always gets something machine-readable

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// ─── Exchange ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Transport problem: connect / timeout / 5xx. Safe to retry.
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The venue understood the request and refused it
    #[error("rejected by exchange ({code}): {msg}")]
    Rejected { code: String, msg: String },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Response arrived but did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Network and rate-limit errors are transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimited(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

// ─── Inference ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference timed out")]
    Timeout,

    #[error("inference transport error: {0}")]
    Transport(String),

    #[error("inference API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("inference returned empty content")]
    Empty,

    #[error("inference not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout
        } else {
            InferenceError::Transport(err.to_string())
        }
    }
}

// ─── Sentiment ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SentimentError {
    #[error("sentiment transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sentiment API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("sentiment feed answered code {0}")]
    Feed(i64),
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

// ─── Cycle ────────────────────────────────────────────────────────────────────

/// Why a cycle stopped before completing. None of these stop the scheduler.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Market data / account data unavailable after retries; nothing was done
    #[error("cycle abandoned: {0}")]
    Abandoned(String),

    /// Exchange refused (auth / rejected / funds); no retry this cycle
    #[error("cycle aborted: {0}")]
    Aborted(ExchangeError),

    /// Order outcome unknown after retry; next cycle must reconcile
    #[error("fatal execution failure: {0}")]
    Fatal(ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// Query parameters were syntactically fine but make no sense
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown symbol / nothing recorded yet
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg)   => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Storage(err)    => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            AppError::Internal(err)   => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimited("50011".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::Rejected { code: "51000".into(), msg: "param".into() }.is_retryable());
        assert!(!ExchangeError::InsufficientFunds("51008".into()).is_retryable());
    }

    #[test]
    fn not_found_maps_to_404() {
        let resp = AppError::NotFound("SOL-USDT-SWAP".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

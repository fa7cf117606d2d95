//! # routes::monitor
//!
//! **Live event stream** สำหรับ Dashboard
//!
//! | Method    | Path          | Description                          |
//! |-----------|---------------|--------------------------------------|
//! | GET (WS)  | `/ws/monitor` | WebSocket real-time event stream     |
//!
//! ทุก [`WsEvent`](crate::events::WsEvent) ที่ cycle broadcast ออกมาจะถูกส่ง
//! ต่อเป็น JSON text frame. Client ส่งอะไรมาก็ไม่มีผลกับ core state.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::state::SharedState;

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Upgrade HTTP → WebSocket แล้ว subscribe broadcast channel ของ board
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// First frame the client sees on connect.
pub async fn snapshot_frame(state: &SharedState) -> String {
    let symbols = state.board.snapshot().await;
    json!({
        "event":         "SNAPSHOT",
        "running_state": state.board.get_running_state(),
        "symbols":       symbols,
    })
    .to_string()
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    // subscribe ก่อนสร้าง snapshot เพื่อไม่ให้ event ระหว่างนั้นหลุด
    let mut rx = state.board.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── ส่ง Snapshot ปัจจุบันทันทีที่ต่อ ─────────────────────────────────────
    let snapshot = snapshot_frame(&state).await;
    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    // ── Event Loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WS receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

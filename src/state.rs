//! # state
//!
//! [`StatusBoard`] — read-only snapshot ของแต่ละ lane `(model, symbol)` ที่ cycle เขียนทับ
//! ทุกครั้งที่จบ cycle; HTTP routes และ WebSocket อ่านจากที่นี่เท่านั้น
//! (ไม่มีทางแก้ core state จากฝั่ง HTTP)
//!
//! ```text
//! SymbolPipeline ──publish──▶ StatusBoard ◀──read── routes::status
//!                                  │
//!                                  └── broadcast_tx ──▶ /ws/monitor
//! ```
//!
//! Run state (Running / Paused / Stopped) lives in a `watch` channel so the
//! scheduler tasks can wait on changes. The process starts Paused with
//! `START_PAUSED=true`; on unix SIGUSR1 pauses and SIGUSR2 resumes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::info;

use crate::engine::cycle::{CycleReport, SymbolState};
use crate::events::WsEvent;
use crate::models::{Position, Signal, Tier, TrailingState};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    /// Tasks alive, cycles skipped until resumed
    Paused,
    /// Tasks exit at their next wake-up
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatus {
    pub model:            String,
    pub symbol:           String,
    pub position:         Option<Position>,
    pub last_signal:      Option<Signal>,
    pub trailing:         TrailingState,
    pub current_leverage: Option<u32>,
    pub needs_reconcile:  bool,
    pub last_cycle:       Option<CycleReport>,
    pub updated_at:       Option<DateTime<Utc>>,
}

impl SymbolStatus {
    fn empty(model: &str, symbol: &str) -> Self {
        Self {
            model:            model.to_string(),
            symbol:           symbol.to_string(),
            position:         None,
            last_signal:      None,
            trailing:         TrailingState::default(),
            current_leverage: None,
            needs_reconcile:  false,
            last_cycle:       None,
            updated_at:       None,
        }
    }
}

// ─── StatusBoard ──────────────────────────────────────────────────────────────

/// `(model, symbol)`
type Lane = (String, String);

fn lane(model: &str, symbol: &str) -> Lane {
    (model.to_string(), symbol.to_string())
}

pub struct StatusBoard {
    lanes:     RwLock<HashMap<Lane, SymbolStatus>>,
    run_state: watch::Sender<RunState>,
    /// Broadcast channel สำหรับส่ง Event ไปยัง WebSocket clients
    pub broadcast_tx: broadcast::Sender<String>,
}

impl StatusBoard {
    pub fn new<I, M, S>(lanes: I) -> Self
    where
        I: IntoIterator<Item = (M, S)>,
        M: AsRef<str>,
        S: AsRef<str>,
    {
        let (broadcast_tx, _) = broadcast::channel(256);
        let (run_state, _)    = watch::channel(RunState::Running);
        Self {
            lanes: RwLock::new(
                lanes
                    .into_iter()
                    .map(|(m, s)| (lane(m.as_ref(), s.as_ref()), SymbolStatus::empty(m.as_ref(), s.as_ref())))
                    .collect(),
            ),
            run_state,
            broadcast_tx,
        }
    }

    /// ไม่ panic ถ้าไม่มี listener
    pub fn broadcast(&self, event: &WsEvent) {
        let _ = self.broadcast_tx.send(event.to_json());
    }

    // ── Writers (cycle side) ──────────────────────────────────────────────────

    /// Replace the lane's snapshot with the committed cycle state.
    pub async fn publish(&self, state: &SymbolState, report: Option<&CycleReport>) {
        let mut map = self.lanes.write().await;
        let entry = map
            .entry(lane(&state.model, &state.symbol))
            .or_insert_with(|| SymbolStatus::empty(&state.model, &state.symbol));
        entry.position         = state.position.clone();
        entry.trailing         = state.trailing;
        entry.current_leverage = state.current_leverage;
        entry.needs_reconcile  = state.needs_reconcile;
        entry.last_signal      = state.history.last().map(|e| e.signal.clone());
        if let Some(r) = report {
            entry.last_cycle = Some(r.clone());
        }
        entry.updated_at = Some(Utc::now());
    }

    pub fn set_running_state(&self, next: RunState) {
        let prev = self.run_state.send_replace(next);
        if prev != next {
            info!(from = ?prev, to = ?next, "🎛️ Run state changed");
            self.broadcast(&WsEvent::RunStateChanged { state: next });
        }
    }

    pub fn subscribe_run_state(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub async fn get_current_position(&self, model: &str, symbol: &str) -> Option<Position> {
        self.lanes.read().await.get(&lane(model, symbol)).and_then(|s| s.position.clone())
    }

    pub async fn get_last_signal(&self, model: &str, symbol: &str) -> Option<Signal> {
        self.lanes.read().await.get(&lane(model, symbol)).and_then(|s| s.last_signal.clone())
    }

    /// `None` for a lane the board does not track.
    pub async fn get_trailing_tier(&self, model: &str, symbol: &str) -> Option<Tier> {
        self.lanes.read().await.get(&lane(model, symbol)).map(|s| s.trailing.tier)
    }

    pub fn get_running_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    /// Models trading `symbol`, sorted.
    pub async fn models_for(&self, symbol: &str) -> Vec<String> {
        let mut models: Vec<String> = self
            .lanes
            .read()
            .await
            .keys()
            .filter(|(_, s)| s == symbol)
            .map(|(m, _)| m.clone())
            .collect();
        models.sort();
        models
    }

    /// All lanes, sorted by model then symbol.
    pub async fn snapshot(&self) -> Vec<SymbolStatus> {
        let mut all: Vec<SymbolStatus> = self.lanes.read().await.values().cloned().collect();
        all.sort_by(|a, b| (&a.model, &a.symbol).cmp(&(&b.model, &b.symbol)));
        all
    }
}

// ─── AppState ─────────────────────────────────────────────────────────────────

/// Injected into every Axum handler.
pub struct AppState {
    pub board:      Arc<StatusBoard>,
    pub store:      Arc<dyn Store>,
    /// `None` = dev mode, every request allowed
    pub api_key:    Option<String>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

pub fn build_state(board: Arc<StatusBoard>, store: Arc<dyn Store>, api_key: Option<String>) -> SharedState {
    Arc::new(AppState { board, store, api_key, started_at: Utc::now() })
}

// ─── Operator signals ─────────────────────────────────────────────────────────

/// SIGUSR1 pauses every lane, SIGUSR2 resumes. A cycle already running
/// finishes; boundaries are skipped while paused. Stopped is final.
#[cfg(unix)]
pub fn listen_for_run_signals(board: Arc<StatusBoard>) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut pause  = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;
    Ok(tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                Some(()) = pause.recv()  => RunState::Paused,
                Some(()) = resume.recv() => RunState::Running,
                else => break,
            };
            if board.get_running_state() == RunState::Stopped {
                break;
            }
            info!(?next, "📶 Operator signal");
            board.set_running_state(next);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarginMode, Side};

    #[tokio::test]
    async fn accessors_reflect_published_state() {
        let board = StatusBoard::new([("deepseek", "BTC-USDT-SWAP"), ("qwen", "BTC-USDT-SWAP")]);
        assert_eq!(board.get_trailing_tier("deepseek", "BTC-USDT-SWAP").await, Some(Tier::None));
        assert!(board.get_trailing_tier("deepseek", "DOGE-USDT-SWAP").await.is_none());

        let mut st = SymbolState::new("BTC-USDT-SWAP", 10).for_model("deepseek");
        st.position = Some(Position {
            symbol:         "BTC-USDT-SWAP".into(),
            side:           Side::Short,
            contracts:      3.0,
            entry_price:    50_000.0,
            leverage:       5,
            margin_mode:    MarginMode::Isolated,
            opened_at:      Utc::now(),
            mark_price:     None,
            unrealized_pnl: None,
        });
        st.trailing.tier = Tier::Tier1;
        st.history.push(Signal::fail_safe("timeout", Utc::now()), 50_000.0, false);
        board.publish(&st, None).await;

        assert_eq!(board.get_current_position("deepseek", "BTC-USDT-SWAP").await.unwrap().side, Side::Short);
        assert_eq!(board.get_trailing_tier("deepseek", "BTC-USDT-SWAP").await, Some(Tier::Tier1));
        assert!(board.get_last_signal("deepseek", "BTC-USDT-SWAP").await.unwrap().fail_safe);

        // the other model's lane on the same symbol is untouched
        assert!(board.get_current_position("qwen", "BTC-USDT-SWAP").await.is_none());
        assert_eq!(board.get_trailing_tier("qwen", "BTC-USDT-SWAP").await, Some(Tier::None));
        assert_eq!(board.models_for("BTC-USDT-SWAP").await, vec!["deepseek", "qwen"]);
    }

    #[test]
    fn run_state_changes_are_observable() {
        let board = StatusBoard::new(Vec::<(String, String)>::new());
        let rx = board.subscribe_run_state();
        assert_eq!(board.get_running_state(), RunState::Running);
        board.set_running_state(RunState::Paused);
        assert_eq!(*rx.borrow(), RunState::Paused);
        assert_eq!(board.get_running_state(), RunState::Paused);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn user_signals_pause_and_resume() {
        let board = Arc::new(StatusBoard::new(Vec::<(String, String)>::new()));
        let mut rx = board.subscribe_run_state();
        let _listener = listen_for_run_signals(board.clone()).unwrap();

        let raise = |sig: &str| {
            let ok = std::process::Command::new("kill")
                .args([sig, &std::process::id().to_string()])
                .status()
                .unwrap()
                .success();
            assert!(ok);
        };

        raise("-USR1");
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
        assert_eq!(board.get_running_state(), RunState::Paused);

        raise("-USR2");
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
        assert_eq!(board.get_running_state(), RunState::Running);
    }
}

//! # Perpguard — Automated Perpetual-Futures Trading Core
//!
//! ## Architecture Overview
//!
//! ```text
//!              ┌──────────── one tokio task per lane (model, symbol) ──────────┐
//!              │                                                               │
//!  wall-clock ─▶ reconcile → collect → trailing → signal → filter → size      │
//!  boundary    │      → plan → liquidity gate → execute → commit batch         │
//!              └───────┬──────────────────┬────────────────────┬───────────────┘
//!                      │                  │                    │
//!           OKX REST / Paper (per model)  Inference (per model)  SQLite / Memory
//!                      │
//!                      ▼
//!                StatusBoard ──▶ GET /api/status · /api/history · WS /ws/monitor
//! ```
//!
//! ## Environment Variables (ที่ใช้บ่อย)
//!
//! | Variable              | Default                  | Description                          |
//! |-----------------------|--------------------------|--------------------------------------|
//! | `SYMBOLS`             | `BTC-USDT-SWAP`          | Comma-separated OKX instrument ids   |
//! | `ENABLED_MODELS`      | `deepseek`               | Comma-separated model lanes          |
//! | `MIN_TRADE_INCREMENT` | *(required)*             | Contract step, per symbol override   |
//! | `MIN_BOOK_DEPTH`      | *(required)*             | Liquidity gate minimum depth         |
//! | `EXCHANGE_MODE`       | `paper`                  | `live` · `demo` · `paper`, per model |
//! | `SENTIMENT_API_URL`   | *(unset = no sentiment)* | Market-sentiment feed                |
//! | `START_PAUSED`        | `false`                  | Boot paused; SIGUSR2 resumes         |
//! | `DATABASE_URL`        | `sqlite://perpguard.db`  | `memory` = in-process store          |
//! | `BIND_ADDR`           | `0.0.0.0:3000`           | Status surface listen address        |
//! | `API_KEY`             | *(unset = open)*         | `X-API-Key` for the status surface   |
//! | `RUST_LOG`            | `perpguard=debug`        | Tracing filter                       |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod auth;
mod brain;
mod config;
mod engine;
mod error;
mod events;
mod exchange;
mod models;
mod retry;
mod routes;
mod state;
mod store;

#[cfg(test)]
mod testutil;

use brain::sentiment::{HttpSentiment, Sentiment};
use brain::{AiClient, Inference};
use config::Config;
use engine::cycle::{SymbolPipeline, SymbolState};
use engine::scheduler;
use exchange::{okx::OkxClient, paper::PaperExchange, Exchange, ExchangeMode};
use state::{build_state, RunState, StatusBoard};
use store::{MemoryStore, SqliteStore, Store};

/// Slack on top of the cycle timeout when waiting for tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional; CI/prod can use real env vars) ───────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("perpguard=debug".parse()?)
            .add_directive("tower_http=info".parse()?)
            .add_directive("sqlx=warn".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        PERPGUARD — Perpetual Futures Core     ║
  ║        Rust + Axum  ·  OKX  ·  AI Signals     ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Configuration (fail fast on anything missing) ─────────────────────
    let cfg = Arc::new(Config::from_env()?);
    info!(
        symbols   = ?cfg.symbols.iter().map(|s| s.symbol.as_str()).collect::<Vec<_>>(),
        models    = ?cfg.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        interval  = cfg.scheduler.interval.as_secs(),
        sentiment = cfg.sentiment.is_some(),
        "⚙️ Configuration loaded"
    );
    for model in &cfg.models {
        info!(model = %model.name, mode = ?model.exchange.mode, provider = %model.ai.provider, ai_model = %model.ai.model, "🤖 Model lane");
        if model.exchange.mode == ExchangeMode::Live {
            warn!(model = %model.name, "💰 LIVE mode — orders use real funds");
        }
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("perpguard/", env!("CARGO_PKG_VERSION")))
        .build()?;

    // ── 4. Store ─────────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = if cfg.database_url == "memory" {
        warn!("🧪 DATABASE_URL=memory — nothing survives a restart");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::connect(&cfg.database_url).await?)
    };

    // ── 5. Sentiment feed (optional, shared by every lane) ───────────────────
    let sentiment: Option<Arc<dyn Sentiment>> = cfg
        .sentiment
        .clone()
        .map(|c| Arc::new(HttpSentiment::new(http.clone(), c)) as Arc<dyn Sentiment>);

    // ── 6. Status board + per-lane state (reload from store) ─────────────────
    let board = Arc::new(StatusBoard::new(
        cfg.models
            .iter()
            .flat_map(|m| cfg.symbols.iter().map(move |s| (m.name.as_str(), s.symbol.as_str()))),
    ));
    if cfg.start_paused {
        warn!("⏸️ START_PAUSED — no cycles run until SIGUSR2");
        board.set_running_state(RunState::Paused);
    }

    let mut pipelines = Vec::with_capacity(cfg.models.len() * cfg.symbols.len());
    for model in &cfg.models {
        // each model trades its own account
        let okx = Arc::new(OkxClient::new(http.clone(), &model.exchange));
        let exchange: Arc<dyn Exchange> = match model.exchange.mode {
            ExchangeMode::Paper => Arc::new(PaperExchange::new(okx, model.exchange.paper_balance)),
            ExchangeMode::Live | ExchangeMode::Demo => okx,
        };
        let inference: Arc<dyn Inference> = Arc::new(AiClient::new(http.clone(), model.ai.clone()));

        for (i, sym) in cfg.symbols.iter().enumerate() {
            let mut st = match store.load_symbol_state(&model.name, &sym.symbol).await? {
                Some(st) => {
                    info!(
                        model        = %model.name,
                        symbol       = %sym.symbol,
                        has_position = st.position.is_some(),
                        tier         = %st.trailing.tier.as_str(),
                        "♻️ Restored lane state"
                    );
                    st
                }
                None => SymbolState::new(&sym.symbol, cfg.history_cap),
            };
            st.model = model.name.clone();
            st.history.set_cap(cfg.history_cap);
            board.publish(&st, None).await;

            pipelines.push((
                SymbolPipeline {
                    model:        model.name.clone(),
                    symbol:       sym.clone(),
                    config:       cfg.clone(),
                    exchange:     exchange.clone(),
                    inference:    inference.clone(),
                    sentiment:    sentiment.clone(),
                    store:        store.clone(),
                    board:        board.clone(),
                    equity_owner: i == 0,
                },
                st,
            ));
        }
    }

    // ── 7. Operator pause / resume ───────────────────────────────────────────
    #[cfg(unix)]
    state::listen_for_run_signals(board.clone())?;

    // ── 8. Spawn lane tasks ──────────────────────────────────────────────────
    let tasks = scheduler::spawn_all(pipelines, cfg.scheduler);

    // ── 9. Status surface ────────────────────────────────────────────────────
    if cfg.api_key.is_none() {
        warn!("🔓 API_KEY not set — status surface is open (dev mode)");
    }
    let app = routes::router(build_state(board.clone(), store, cfg.api_key.clone()));

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(?addr, "🚀 Perpguard server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_board = board.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("🛑 Shutdown requested — stopping lane tasks");
            shutdown_board.set_running_state(RunState::Stopped);
        })
        .await?;

    // ── 10. Let in-flight cycles finish their commit ─────────────────────────
    let wait = cfg.scheduler.cycle_timeout + SHUTDOWN_GRACE;
    if tokio::time::timeout(wait, futures_util::future::join_all(tasks)).await.is_err() {
        warn!(wait_s = wait.as_secs(), "⚠️ Lane tasks did not stop in time");
    }

    info!("👋 Perpguard stopped");
    Ok(())
}

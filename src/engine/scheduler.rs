//! # engine::scheduler
//!
//! One tokio task per lane `(model, symbol)`. แต่ละ task วน:
//!
//! ```text
//! loop {
//!     sleep → next wall-clock boundary (+ stagger offset)
//!     RunState?  Stopped → exit │ Paused → skip │ Running ↓
//!     timeout(cycle_timeout, pipeline.run_cycle_with(&mut state, &mut journal))
//!         └─ elapsed → pipeline.salvage(journal)
//! }
//! ```
//!
//! A lane's cycles never overlap because the task awaits each cycle
//! before sleeping again. Run state comes from the board's `watch`
//! channel, so a pause or stop wakes sleeping tasks immediately.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::config::Env;
use crate::engine::cycle::{CycleReport, SymbolPipeline, SymbolState};
use crate::engine::journal::Journal;
use crate::state::RunState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub interval:      Duration,
    /// Hard ceiling on one cycle
    pub cycle_timeout: Duration,
    /// A boundary closer than this is skipped
    pub min_lead:      Duration,
    /// Offset between consecutive lanes
    pub stagger:       Duration,
}

impl SchedulerConfig {
    pub fn from_env(env: &Env) -> anyhow::Result<Self> {
        let cfg = Self {
            interval:      env.secs_or("CYCLE_INTERVAL_SECS", 300)?,
            cycle_timeout: env.secs_or("CYCLE_TIMEOUT_SECS", 180)?,
            min_lead:      env.secs_or("CYCLE_MIN_LEAD_SECS", 10)?,
            stagger:       Duration::from_millis(env.parse_or("SYMBOL_STAGGER_MS", 2_000)?),
        };
        if cfg.interval.is_zero() {
            anyhow::bail!("CYCLE_INTERVAL_SECS must be > 0");
        }
        if cfg.cycle_timeout >= cfg.interval {
            anyhow::bail!(
                "CYCLE_TIMEOUT_SECS ({}) must be shorter than CYCLE_INTERVAL_SECS ({})",
                cfg.cycle_timeout.as_secs(), cfg.interval.as_secs()
            );
        }
        Ok(cfg)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval:      Duration::from_secs(300),
            cycle_timeout: Duration::from_secs(180),
            min_lead:      Duration::from_secs(10),
            stagger:       Duration::from_secs(2),
        }
    }
}

/// First multiple of `interval` (since the epoch) strictly after `now`
/// that is at least `min_lead` away.
pub fn next_boundary(now: DateTime<Utc>, interval: Duration, min_lead: Duration) -> DateTime<Utc> {
    let step = (interval.as_millis() as i64).max(1);
    let lead = min_lead.as_millis() as i64;
    let ms   = now.timestamp_millis();

    let mut next = (ms.div_euclid(step) + 1) * step;
    if next - ms < lead {
        next += step;
    }
    Utc.timestamp_millis_opt(next).single().unwrap_or(now)
}

/// Spawn one loop per pipeline, staggered by position in the list.
pub fn spawn_all(pipelines: Vec<(SymbolPipeline, SymbolState)>, cfg: SchedulerConfig) -> Vec<JoinHandle<()>> {
    pipelines
        .into_iter()
        .enumerate()
        .map(|(i, (pipeline, state))| {
            let offset = cfg.stagger.saturating_mul(i as u32);
            tokio::spawn(symbol_loop(pipeline, state, cfg, offset))
        })
        .collect()
}

pub async fn symbol_loop(pipeline: SymbolPipeline, mut state: SymbolState, cfg: SchedulerConfig, offset: Duration) {
    let symbol     = pipeline.symbol.symbol.clone();
    let model      = pipeline.model.clone();
    let mut run_rx = pipeline.board.subscribe_run_state();
    info!(%model, %symbol, interval_s = cfg.interval.as_secs(), offset_ms = offset.as_millis() as u64, "🕒 Symbol task started");

    loop {
        if *run_rx.borrow() == RunState::Stopped {
            break;
        }

        let boundary = next_boundary(Utc::now(), cfg.interval, cfg.min_lead);
        let wait     = (boundary - Utc::now()).to_std().unwrap_or_default() + offset;
        debug!(%model, %symbol, next = %boundary, "💤 Sleeping until boundary");

        tokio::select! {
            _ = sleep(wait) => {}
            changed = run_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // state changed mid-sleep: re-check before the next boundary
                continue;
            }
        }

        let run = *run_rx.borrow();
        match run {
            RunState::Stopped => break,
            RunState::Paused => {
                debug!(%model, %symbol, "⏸️ Paused, skipping cycle");
                continue;
            }
            RunState::Running => {}
        }

        run_guarded(&pipeline, &mut state, cfg.cycle_timeout).await;
    }

    info!(%model, %symbol, "👋 Lane task stopped");
}

/// One cycle under the slot timeout. The journal outlives the cycle
/// future, so fills acknowledged before the timeout are still committed and
/// the next cycle reconciles the rest.
pub async fn run_guarded(
    pipeline: &SymbolPipeline,
    state:    &mut SymbolState,
    limit:    Duration,
) -> Option<CycleReport> {
    let mut journal = Journal::new(&pipeline.model, &pipeline.symbol.symbol);
    let outcome = timeout(limit, pipeline.run_cycle_with(state, &mut journal)).await;
    match outcome {
        Ok(report) => Some(report),
        Err(_) => {
            pipeline.salvage(state, journal, limit).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::ReasonCode;
    use crate::exchange::paper::PaperExchange;
    use crate::state::StatusBoard;
    use crate::store::MemoryStore;
    use crate::testutil::{MockFeed, ScriptedInference};
    use std::sync::Arc;

    const SYM: &str = "ETH-USDT-SWAP";
    const MODEL: &str = "deepseek";

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn boundary_is_next_multiple_of_interval() {
        let five = Duration::from_secs(300);
        let lead = Duration::from_secs(10);
        assert_eq!(next_boundary(at(12, 3, 20), five, lead), at(12, 5, 0));
        // exactly on a boundary → the following one
        assert_eq!(next_boundary(at(12, 5, 0), five, lead), at(12, 10, 0));
    }

    #[test]
    fn boundary_too_close_is_skipped() {
        let five = Duration::from_secs(300);
        assert_eq!(next_boundary(at(12, 4, 55), five, Duration::from_secs(10)), at(12, 10, 0));
        assert_eq!(next_boundary(at(12, 4, 49), five, Duration::from_secs(10)), at(12, 5, 0));
    }

    #[test]
    fn timeout_must_fit_in_interval() {
        let env = Env::from_pairs(&[("CYCLE_INTERVAL_SECS", "60"), ("CYCLE_TIMEOUT_SECS", "90")]);
        assert!(SchedulerConfig::from_env(&env).is_err());
        let cfg = SchedulerConfig::from_env(&Env::from_pairs(&[])).unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
    }

    struct Rig {
        inference: Arc<ScriptedInference>,
        store:     Arc<MemoryStore>,
        board:     Arc<StatusBoard>,
        pipeline:  SymbolPipeline,
    }

    fn rig(inference: ScriptedInference) -> Rig {
        let env = Env::from_pairs(&[
            ("SYMBOLS", SYM),
            ("MIN_TRADE_INCREMENT", "0.01"),
            ("MIN_BOOK_DEPTH", "1"),
            ("EXCHANGE_MODE", "paper"),
            ("NET_RETRY_BASE_MS", "1"),
        ]);
        let config    = Arc::new(Config::from_lookup(&env).unwrap());
        let feed      = Arc::new(MockFeed::new(SYM, 3_000.0));
        let inference = Arc::new(inference);
        let store     = Arc::new(MemoryStore::new());
        let board     = Arc::new(StatusBoard::new([(MODEL, SYM)]));
        let pipeline  = SymbolPipeline {
            model:        MODEL.into(),
            symbol:       config.symbol(SYM).unwrap().clone(),
            config:       config.clone(),
            exchange:     Arc::new(PaperExchange::new(feed, 10_000.0)),
            inference:    inference.clone(),
            sentiment:    None,
            store:        store.clone(),
            board:        board.clone(),
            equity_owner: true,
        };
        Rig { inference, store, board, pipeline }
    }

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            interval:      Duration::from_secs(1),
            cycle_timeout: Duration::from_millis(900),
            min_lead:      Duration::ZERO,
            stagger:       Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn timed_out_cycle_is_abandoned_and_flagged() {
        let slow = ScriptedInference::new(Vec::<&'static str>::new())
            .slow(Duration::from_secs(2), Duration::from_secs(5));
        let r = rig(slow);
        let mut state = SymbolState::new(SYM, 50).for_model(MODEL);

        let report = run_guarded(&r.pipeline, &mut state, Duration::from_millis(200)).await;
        assert!(report.is_none());
        assert!(state.needs_reconcile);

        let audits = r.store.audits(SYM);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].reason, ReasonCode::CycleAbandoned);
        assert_eq!(audits[0].model, MODEL);
        assert!(audits[0].alert);
        assert!(r.store.trades(SYM).is_empty());
    }

    #[tokio::test]
    async fn paused_task_skips_cycles_and_stops_on_request() {
        let r = rig(ScriptedInference::new(["{}"]));
        r.board.set_running_state(RunState::Paused);
        let state  = SymbolState::new(SYM, 50).for_model(MODEL);
        let handle = tokio::spawn(symbol_loop(r.pipeline, state, fast(), Duration::ZERO));

        sleep(Duration::from_millis(1_300)).await;
        assert!(r.inference.prompts.lock().unwrap().is_empty());

        r.board.set_running_state(RunState::Stopped);
        assert!(timeout(Duration::from_secs(2), handle).await.is_ok());
    }

    #[tokio::test]
    async fn running_task_cycles_on_boundaries() {
        let hold = r#"{"signal":"HOLD","confidence":"LOW","reason":"wait"}"#;
        let r = rig(ScriptedInference::new([hold, hold, hold, hold]));
        let state  = SymbolState::new(SYM, 50).for_model(MODEL);
        let handle = tokio::spawn(symbol_loop(r.pipeline, state, fast(), Duration::ZERO));

        sleep(Duration::from_millis(2_300)).await;
        r.board.set_running_state(RunState::Stopped);
        assert!(timeout(Duration::from_secs(2), handle).await.is_ok());

        assert!(!r.inference.prompts.lock().unwrap().is_empty());
        assert!(r.board.get_last_signal(MODEL, SYM).await.is_some());
    }
}

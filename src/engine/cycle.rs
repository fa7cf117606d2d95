//! # engine::cycle — one lane, one cycle
//!
//! A lane is one `(model, symbol)` pair. ลำดับขั้นตอนต่อ cycle (ห้ามสลับ):
//!
//! ```text
//!  ── 1. Reconcile ────  live position (ground truth) vs stored
//!  ── 2. Collect ──────  candles + book → indicators; grade past signals
//!  ── 3. Trailing ─────  CLOSE here ends the cycle (no inference)
//!  ── 4. Generate ─────  sentiment + inference → Signal (fail-safe HOLD)
//!  ── 5. Filter ───────  choppy / cooldown → suppressed
//!  ── 6. Sizing ───────  balance + contract spec → SizingResult
//!  ── 7. Plan ─────────  OPEN / ADD / REDUCE / FLIP / no-op
//!  ── 8. Liquidity ────  spread + depth on the execution side
//!  ── 9. Execute ──────  leverage sync, market order(s), re-read position
//!  ── 10. Commit ──────  one WriteBatch: state + trades + audits + equity
//! ```
//!
//! The cycle works on a copy of [`SymbolState`] and swaps it in at the end,
//! so a half-finished cycle never leaves the in-memory state half-updated.
//! The [`Journal`] belongs to the caller: when the slot timeout drops the
//! cycle, [`SymbolPipeline::salvage`] still commits the fills it saw.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::brain::filter::{apply_filter, FilterDecision};
use crate::brain::generator::generate;
use crate::brain::history::SignalHistory;
use crate::brain::prompt::PromptContext;
use crate::brain::sentiment::{self, Sentiment};
use crate::brain::Inference;
use crate::config::{Config, SymbolConfig};
use crate::engine::collector::{collect, read_failure, CollectRequest, BOOK_DEPTH};
use crate::engine::executor::{self, ExecContext, ExecutionPlan};
use crate::engine::journal::Journal;
use crate::engine::liquidity::{check_liquidity, LiquidityVerdict};
use crate::engine::sizing::{size_position, SizingInput, SizingResult};
use crate::engine::trailing::{self, ExitTrigger, TrailingAction};
use crate::error::{CycleError, ExchangeError};
use crate::events::WsEvent;
use crate::exchange::Exchange;
use crate::models::{
    AuditKind, AuditRecord, EquitySnapshot, MarginMode, Position, ReasonCode, Side, Signal, Tier,
    TradeRecord, TradeTrigger, TrailingState,
};
use crate::retry::retry_async;
use crate::state::StatusBoard;
use crate::store::{Store, WriteBatch};

// ─── Per-Lane State ───────────────────────────────────────────────────────────

/// Everything the pipeline remembers about one lane between cycles.
/// Persisted as a whole; reloaded at start-up and then re-derived from
/// the exchange by the first reconcile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    #[serde(default)]
    pub model:            String,
    pub symbol:           String,
    pub position:         Option<Position>,
    pub trailing:         TrailingState,
    pub history:          SignalHistory,
    /// Leverage last confirmed on the exchange
    pub current_leverage: Option<u32>,
    /// Set when an order outcome is unknown or a commit failed
    pub needs_reconcile:  bool,
    #[serde(default)]
    pub last_cycle_at:    Option<DateTime<Utc>>,
}

impl SymbolState {
    pub fn new(symbol: &str, history_cap: usize) -> Self {
        Self {
            model:            String::new(),
            symbol:           symbol.to_string(),
            position:         None,
            trailing:         TrailingState::default(),
            history:          SignalHistory::new(history_cap),
            current_leverage: None,
            needs_reconcile:  false,
            last_cycle_at:    None,
        }
    }

    pub fn for_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Apply fills the exchange acknowledged but nobody re-read.
    fn absorb_fills(&mut self, fills: &[TradeRecord], margin_mode: MarginMode) {
        self.position = executor::project_fills(self.position.take(), fills, margin_mode);
        if let Some(p) = &self.position {
            self.current_leverage = Some(p.leverage);
        }
        trailing::sync_with_position(&mut self.trailing, self.position.as_ref());
        self.needs_reconcile = true;
    }
}

// ─── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOutcome {
    ProtectiveExit { trigger: ExitTrigger },
    Executed       { plan: ExecutionPlan },
    NoOp           { reason: ReasonCode },
    Suppressed     { reason: ReasonCode },
    Deferred       { reason: ReasonCode },
    Abandoned      { reason: String },
    Aborted        { error: String },
    Fatal          { error: String },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Abandoned { .. } | CycleOutcome::Aborted { .. } | CycleOutcome::Fatal { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::ProtectiveExit { .. } => "protective_exit",
            CycleOutcome::Executed { .. }       => "executed",
            CycleOutcome::NoOp { .. }           => "no_op",
            CycleOutcome::Suppressed { .. }     => "suppressed",
            CycleOutcome::Deferred { .. }       => "deferred",
            CycleOutcome::Abandoned { .. }      => "abandoned",
            CycleOutcome::Aborted { .. }        => "aborted",
            CycleOutcome::Fatal { .. }          => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub model:       String,
    pub symbol:      String,
    pub started_at:  DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome:     CycleOutcome,
    pub signal:      Option<Signal>,
    /// Mark price used for every decision in the cycle
    pub price:       Option<f64>,
    pub profit_pct:  Option<f64>,
    pub tier:        Tier,
    pub sizing:      Option<SizingResult>,
    pub liquidity:   Option<LiquidityVerdict>,
    pub trades:      usize,
    pub audits:      usize,
}

/// Report fields filled in as stages complete.
#[derive(Debug, Default)]
struct Draft {
    signal:      Option<Signal>,
    price:       Option<f64>,
    profit_pct:  Option<f64>,
    sizing:      Option<SizingResult>,
    liquidity:   Option<LiquidityVerdict>,
    /// Journal trades from this index on are order fills, not reconcile records
    fills_from:  usize,
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

pub struct SymbolPipeline {
    pub model:        String,
    pub symbol:       SymbolConfig,
    pub config:       Arc<Config>,
    pub exchange:     Arc<dyn Exchange>,
    pub inference:    Arc<dyn Inference>,
    pub sentiment:    Option<Arc<dyn Sentiment>>,
    pub store:        Arc<dyn Store>,
    pub board:        Arc<StatusBoard>,
    /// One lane per account writes the equity snapshot
    pub equity_owner: bool,
}

impl SymbolPipeline {
    fn sym(&self) -> &str {
        &self.symbol.symbol
    }

    /// Run one full cycle with a fresh journal.
    pub async fn run_cycle(&self, state: &mut SymbolState) -> CycleReport {
        let mut journal = Journal::new(&self.model, self.sym());
        self.run_cycle_with(state, &mut journal).await
    }

    /// Run one full cycle. Never fails: every error becomes an outcome, an
    /// audit record and (for failures) an alert. Records accumulate in
    /// `journal` as they happen.
    pub async fn run_cycle_with(&self, state: &mut SymbolState, journal: &mut Journal) -> CycleReport {
        let started_at = Utc::now();
        let mut work   = state.clone();
        let mut draft  = Draft::default();

        let outcome = match self.stages(&mut work, journal, &mut draft).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // half of a flip may have gone through
                if journal.trades.len() > draft.fills_from {
                    self.refresh_position(&mut work, &journal.trades[draft.fills_from..]).await;
                }
                failure_outcome(err, &mut work, journal)
            }
        };

        // ── 10. Commit ────────────────────────────────────────────────────────
        let equity = if outcome.is_failure() || !self.equity_owner {
            None
        } else {
            self.equity_snapshot().await
        };
        let finished_at = Utc::now();
        work.last_cycle_at = Some(finished_at);

        let batch = WriteBatch {
            model:  self.model.clone(),
            symbol: self.sym().to_string(),
            state:  Some(work.clone()),
            trades: journal.trades.clone(),
            audits: journal.audits.clone(),
            equity,
        };
        if let Err(e) = self.store.commit(&batch).await {
            error!(model = %self.model, symbol = self.sym(), error = %e, "❌ Commit failed; state kept in memory only");
            work.needs_reconcile = true;
        }
        *state = work;

        let report = CycleReport {
            model:       self.model.clone(),
            symbol:      self.sym().to_string(),
            started_at,
            finished_at,
            outcome,
            signal:      draft.signal,
            price:       draft.price,
            profit_pct:  draft.profit_pct,
            tier:        state.trailing.tier,
            sizing:      draft.sizing,
            liquidity:   draft.liquidity,
            trades:      journal.trades.len(),
            audits:      journal.audits.len(),
        };

        info!(
            model   = %self.model,
            symbol  = self.sym(),
            outcome = report.outcome.label(),
            tier    = %report.tier,
            trades  = report.trades,
            ms      = (finished_at - started_at).num_milliseconds(),
            "🔁 Cycle complete"
        );

        self.board.publish(state, Some(&report)).await;
        self.broadcast(journal);
        self.board.broadcast(&WsEvent::CycleCompleted { report: Box::new(report.clone()) });
        report
    }

    /// Commit what a cycle dropped by the slot timeout left in `journal`.
    ///
    /// ```text
    /// pending orders ─▶ ExecutionFailed alert each (outcome unknown)
    /// acked fills    ─▶ projected onto the stored position, trades kept
    /// state          ─▶ needs_reconcile; next reconcile records the rest
    /// ```
    ///
    /// Signal history from the dropped cycle is lost with its working copy.
    pub async fn salvage(&self, state: &mut SymbolState, mut journal: Journal, limit: Duration) {
        let sym = self.sym();
        warn!(
            model   = %self.model,
            symbol  = sym,
            limit_s = limit.as_secs(),
            fills   = journal.trades.len(),
            pending = journal.pending.len(),
            "⏱️ Cycle timed out → salvaging journal"
        );

        for order in std::mem::take(&mut journal.pending) {
            journal.alert(
                AuditKind::Failure,
                ReasonCode::ExecutionFailed,
                format!(
                    "{} {} {} sent as {}, no ack before timeout",
                    order.kind.as_str(), order.side, order.contracts, order.client_order_id
                ),
            );
        }
        journal.alert(
            AuditKind::Failure,
            ReasonCode::CycleAbandoned,
            format!("cycle exceeded {}s", limit.as_secs()),
        );

        state.absorb_fills(&journal.trades, self.symbol.margin_mode);

        let batch = WriteBatch {
            model:  self.model.clone(),
            symbol: sym.to_string(),
            state:  Some(state.clone()),
            trades: journal.trades.clone(),
            audits: journal.audits.clone(),
            equity: None,
        };
        if let Err(e) = self.store.commit(&batch).await {
            error!(model = %self.model, symbol = sym, error = %e, "❌ Could not record timed-out cycle");
        }

        self.board.publish(state, None).await;
        self.broadcast(&journal);
    }

    fn broadcast(&self, journal: &Journal) {
        for trade in &journal.trades {
            self.board.broadcast(&WsEvent::TradeExecuted { trade: Box::new(trade.clone()) });
        }
        for audit in &journal.audits {
            if let (Some(from), Some(to)) = (audit.tier_from, audit.tier_to) {
                if from != to {
                    self.board.broadcast(&WsEvent::TierChanged {
                        model:  audit.model.clone(),
                        symbol: audit.symbol.clone(),
                        from,
                        to,
                    });
                }
            }
            if audit.alert {
                self.board.broadcast(&WsEvent::Alert { record: Box::new(audit.clone()) });
            }
        }
    }

    async fn stages(
        &self,
        st:      &mut SymbolState,
        journal: &mut Journal,
        draft:   &mut Draft,
    ) -> Result<CycleOutcome, CycleError> {
        let sym = self.sym();
        let cfg = self.config.as_ref();
        let ex  = self.exchange.as_ref();

        // ── 1. Reconcile ──────────────────────────────────────────────────────
        let live = retry_async(&cfg.retry, ExchangeError::is_retryable, |_| ex.get_open_position(sym))
            .await
            .map_err(|e| read_failure("position", e))?;
        reconcile(st, live, journal);
        draft.fills_from = journal.trades.len();

        // ── 2. Collect ────────────────────────────────────────────────────────
        let req = CollectRequest {
            symbol:       sym,
            timeframe:    &cfg.timeframe,
            candle_count: cfg.candle_count,
            book_depth:   self.symbol.liquidity.depth_levels.max(BOOK_DEPTH),
        };
        let snapshot = collect(ex, &req, &cfg.retry).await?;
        let mark     = snapshot.mark_price();
        draft.price  = Some(mark);

        let graded = st.history.validate_pending(mark, snapshot.fetched_at);
        if graded > 0 {
            debug!(model = %self.model, symbol = sym, graded, "✔️ Past signals validated");
        }

        // ── 3. Trailing ───────────────────────────────────────────────────────
        if let Some(pos) = st.position.clone() {
            let pct = pos.profit_pct(mark);
            draft.profit_pct = Some(pct);

            let mut trailing = st.trailing;
            let out = trailing::evaluate(&mut trailing, pct, &cfg.trailing);
            if let Some((from, to)) = out.advanced {
                journal.record(
                    AuditRecord::new(
                        sym,
                        AuditKind::TierTransition,
                        ReasonCode::TierAdvanced,
                        format!("peak {:.2}%", out.peak_pct),
                    )
                    .with_tiers(from, to),
                );
            }

            match out.action {
                TrailingAction::Hold => st.trailing = trailing,
                TrailingAction::Close(trigger) => {
                    let ctx = ExecContext {
                        exchange:   ex,
                        symbol:     &self.symbol,
                        price:      mark,
                        confidence: None,
                        trigger:    TradeTrigger::ProtectiveExit,
                    };
                    // stored trailing memory stays until the close is confirmed
                    executor::close_position(&ctx, &pos, trigger, out.peak_pct, out.tier, journal).await?;
                    st.trailing = trailing;
                    self.refresh_position(st, &journal.trades[draft.fills_from..]).await;
                    return Ok(CycleOutcome::ProtectiveExit { trigger });
                }
            }
        }

        // ── 4. Generate ───────────────────────────────────────────────────────
        let sentiment = match &self.sentiment {
            Some(source) => sentiment::read_for(source.as_ref(), sym).await,
            None => None,
        };
        let prompt_ctx = PromptContext {
            snapshot:     &snapshot,
            history:      &st.history,
            position:     st.position.as_ref(),
            trailing:     &st.trailing,
            sentiment:    sentiment.as_ref(),
            leverage_min: cfg.sizing.leverage_min,
            leverage_max: cfg.sizing.leverage_max,
        };
        let signal = generate(self.inference.as_ref(), &prompt_ctx).await.into_signal(Utc::now());
        draft.signal = Some(signal.clone());

        // ── 5. Filter ─────────────────────────────────────────────────────────
        if !signal.action.is_actionable() {
            let detail = if signal.fail_safe {
                format!("fail-safe: {}", signal.rationale)
            } else {
                "HOLD".to_string()
            };
            st.history.push(signal, mark, false);
            journal.note(AuditKind::NoOp, ReasonCode::SignalHold, detail);
            return Ok(CycleOutcome::NoOp { reason: ReasonCode::SignalHold });
        }

        let decision = {
            let prior = st.history.recent_signals(cfg.filter.window);
            apply_filter(&signal, &prior, &cfg.filter)
        };
        if let FilterDecision::Suppressed { reason, detail } = decision {
            st.history.push(signal, mark, true);
            journal.note(AuditKind::Suppressed, reason, detail);
            return Ok(CycleOutcome::Suppressed { reason });
        }
        st.history.push(signal.clone(), mark, false);

        // ── 6. Sizing ─────────────────────────────────────────────────────────
        let spec = retry_async(&cfg.retry, ExchangeError::is_retryable, |_| ex.get_instrument(sym))
            .await
            .map_err(|e| read_failure("instrument", e))?;
        let balance = retry_async(&cfg.retry, ExchangeError::is_retryable, |_| ex.get_balance())
            .await
            .map_err(|e| read_failure("balance", e))?;

        let sizing = size_position(
            &SizingInput {
                signal:           &signal,
                trend:            snapshot.trend,
                rsi:              snapshot.indicators.rsi,
                balance:          balance.total_equity,
                mark_price:       mark,
                base_notional:    self.symbol.base_notional,
                contract_value:   spec.contract_value,
                min_increment:    self.symbol.min_increment,
            },
            &cfg.sizing,
        );
        draft.sizing = Some(sizing.clone());

        // ── 7. Plan ───────────────────────────────────────────────────────────
        let plan = executor::plan(
            st.position.as_ref(),
            Side::from_action(signal.action),
            sizing.contracts,
            self.symbol.min_increment,
        );
        if let ExecutionPlan::NoOp { reason, detail } = &plan {
            journal.note(AuditKind::NoOp, *reason, detail.clone());
            return Ok(CycleOutcome::NoOp { reason: *reason });
        }

        // ── 8. Liquidity ──────────────────────────────────────────────────────
        if let Some(side) = plan.execution_side() {
            let verdict = check_liquidity(&snapshot.orderbook, side, spec.contract_value, &self.symbol.liquidity);
            draft.liquidity = Some(verdict);
            if let LiquidityVerdict::Deferred { reason, spread_ratio, depth_base } = verdict {
                let code = reason.reason_code();
                journal.note(
                    AuditKind::Deferred,
                    code,
                    format!("{} spread {spread_ratio:.5} depth {depth_base:.4}", side.as_str()),
                );
                return Ok(CycleOutcome::Deferred { reason: code });
            }
        }

        // ── 9. Execute ────────────────────────────────────────────────────────
        let ctx = ExecContext {
            exchange:   ex,
            symbol:     &self.symbol,
            price:      mark,
            confidence: Some(signal.confidence),
            trigger:    TradeTrigger::Signal,
        };
        executor::execute(&ctx, &plan, sizing.leverage, &mut st.trailing, &mut st.current_leverage, journal).await?;
        self.refresh_position(st, &journal.trades[draft.fills_from..]).await;

        Ok(CycleOutcome::Executed { plan })
    }

    /// Re-read the position after orders went out. If the exchange cannot
    /// be read, `fills` are projected onto the stored position and the next
    /// cycle has to reconcile.
    async fn refresh_position(&self, st: &mut SymbolState, fills: &[TradeRecord]) {
        let sym = self.sym();
        let ex  = self.exchange.as_ref();
        match retry_async(&self.config.retry, ExchangeError::is_retryable, |_| ex.get_open_position(sym)).await {
            Ok(pos) => {
                if let Some(p) = &pos {
                    st.current_leverage = Some(p.leverage);
                }
                st.position = pos;
                trailing::sync_with_position(&mut st.trailing, st.position.as_ref());
            }
            Err(e) => {
                warn!(model = %self.model, symbol = sym, error = %e, "⚠️ Position re-read failed → projecting fills, reconcile next cycle");
                st.absorb_fills(fills, self.symbol.margin_mode);
            }
        }
    }

    async fn equity_snapshot(&self) -> Option<EquitySnapshot> {
        let ex = self.exchange.as_ref();
        match retry_async(&self.config.retry, ExchangeError::is_retryable, |_| ex.get_balance()).await {
            Ok(b) => Some(EquitySnapshot {
                at:             Utc::now(),
                total_equity:   b.total_equity,
                available:      b.available,
                unrealized_pnl: b.unrealized_pnl,
                currency:       "USDT".to_string(),
            }),
            Err(e) => {
                warn!(model = %self.model, symbol = self.sym(), error = %e, "⚠️ Balance unavailable, no equity snapshot");
                None
            }
        }
    }
}

// ─── Stage helpers ────────────────────────────────────────────────────────────

fn describe(pos: Option<&Position>) -> String {
    match pos {
        Some(p) => format!("{} {}", p.side, p.contracts),
        None    => "flat".to_string(),
    }
}

/// Adopt the exchange's view of the position, audit any divergence and
/// record the fills that explain it.
fn reconcile(st: &mut SymbolState, live: Option<Position>, journal: &mut Journal) {
    let fills = executor::reconcile_fills(journal.model(), st.position.as_ref(), live.as_ref());
    let diverged = !fills.is_empty();

    if diverged || st.needs_reconcile {
        journal.note(
            AuditKind::Reconcile,
            ReasonCode::Reconciled,
            format!(
                "stored {} → exchange {}{}",
                describe(st.position.as_ref()),
                describe(live.as_ref()),
                if st.needs_reconcile { " (flagged)" } else { "" }
            ),
        );
        st.needs_reconcile = false;
    }
    for fill in fills {
        journal.trade(fill);
    }

    if let Some(p) = &live {
        st.current_leverage = Some(p.leverage);
    }
    st.position = live;

    let before = st.trailing;
    if trailing::sync_with_position(&mut st.trailing, st.position.as_ref()) && before.tier != Tier::None {
        journal.record(
            AuditRecord::new(
                journal.symbol(),
                AuditKind::TierTransition,
                ReasonCode::TrailingReset,
                "position closed or flipped outside the pipeline",
            )
            .with_tiers(before.tier, Tier::None),
        );
    }
}

fn failure_outcome(err: CycleError, st: &mut SymbolState, journal: &mut Journal) -> CycleOutcome {
    match err {
        CycleError::Abandoned(reason) => {
            journal.note(AuditKind::Failure, ReasonCode::CycleAbandoned, reason.clone());
            CycleOutcome::Abandoned { reason }
        }
        CycleError::Aborted(e) => {
            journal.alert(AuditKind::Failure, ReasonCode::ExecutionRejected, e.to_string());
            CycleOutcome::Aborted { error: e.to_string() }
        }
        CycleError::Fatal(e) => {
            st.needs_reconcile = true;
            journal.alert(AuditKind::Failure, ReasonCode::ExecutionFailed, format!("order outcome unknown: {e}"));
            CycleOutcome::Fatal { error: e.to_string() }
        }
        CycleError::Store(e) => {
            journal.alert(AuditKind::Failure, ReasonCode::CycleAbandoned, e.to_string());
            CycleOutcome::Abandoned { reason: e.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Env;
    use crate::exchange::paper::PaperExchange;
    use crate::models::{Action, BookLevel, Confidence, MarginMode, OrderBook, TradeKind};
    use crate::store::MemoryStore;
    use crate::testutil::{FlakyExchange, MockFeed, ScriptedInference};

    const SYM: &str = "BTC-USDT-SWAP";
    const MODEL: &str = "deepseek";

    const BUY_HIGH: &str =
        r#"{"signal":"BUY","confidence":"HIGH","stop_loss":49000,"leverage":5,"reason":"breakout"}"#;
    const BUY_MEDIUM: &str =
        r#"{"signal":"BUY","confidence":"MEDIUM","stop_loss":49000,"leverage":5,"reason":"drift"}"#;
    const SELL_HIGH: &str =
        r#"{"signal":"SELL","confidence":"HIGH","stop_loss":51000,"leverage":5,"reason":"reversal"}"#;
    const HOLD: &str = r#"{"signal":"HOLD","confidence":"LOW","reason":"nothing to do"}"#;

    struct Harness {
        feed:      Arc<MockFeed>,
        exchange:  Arc<FlakyExchange>,
        inference: Arc<ScriptedInference>,
        store:     Arc<MemoryStore>,
        board:     Arc<StatusBoard>,
        pipeline:  SymbolPipeline,
        state:     SymbolState,
    }

    impl Harness {
        fn new(replies: impl IntoIterator<Item = &'static str>) -> Self {
            let env = Env::from_pairs(&[
                ("SYMBOLS", SYM),
                ("MIN_TRADE_INCREMENT", "0.01"),
                ("MIN_BOOK_DEPTH", "1"),
                ("EXCHANGE_MODE", "paper"),
                ("NET_RETRY_BASE_MS", "1"),
                ("NET_RETRY_MAX_MS", "2"),
            ]);
            let config = Arc::new(Config::from_lookup(&env).unwrap());

            let feed      = Arc::new(MockFeed::new(SYM, 50_000.0));
            let exchange  = Arc::new(FlakyExchange::new(Arc::new(PaperExchange::new(feed.clone(), 10_000.0))));
            let inference = Arc::new(ScriptedInference::new(replies));
            let store     = Arc::new(MemoryStore::new());
            let board     = Arc::new(StatusBoard::new([(MODEL, SYM)]));

            let pipeline = SymbolPipeline {
                model:        MODEL.into(),
                symbol:       config.symbol(SYM).unwrap().clone(),
                config:       config.clone(),
                exchange:     exchange.clone(),
                inference:    inference.clone(),
                sentiment:    None,
                store:        store.clone(),
                board:        board.clone(),
                equity_owner: true,
            };
            let state = SymbolState::new(SYM, config.history_cap).for_model(MODEL);
            Self { feed, exchange, inference, store, board, pipeline, state }
        }

        async fn cycle(&mut self) -> CycleReport {
            self.pipeline.run_cycle(&mut self.state).await
        }

        /// Cycle under a slot limit, salvaging the journal when it runs out.
        async fn cycle_within(&mut self, limit: Duration) -> Option<CycleReport> {
            let mut journal = Journal::new(MODEL, SYM);
            let run = tokio::time::timeout(limit, self.pipeline.run_cycle_with(&mut self.state, &mut journal)).await;
            match run {
                Ok(report) => Some(report),
                Err(_) => {
                    self.pipeline.salvage(&mut self.state, journal, limit).await;
                    None
                }
            }
        }

        fn reasons(&self) -> Vec<ReasonCode> {
            self.store.audits(SYM).iter().map(|a| a.reason).collect()
        }
    }

    fn sig(action: Action, confidence: Confidence, secs_ago: i64) -> Signal {
        Signal {
            timestamp:            Utc::now() - chrono::Duration::seconds(secs_ago),
            action,
            confidence,
            suggested_leverage:   None,
            suggested_stop_price: None,
            take_profit:          None,
            rationale:            String::new(),
            fail_safe:            false,
        }
    }

    #[tokio::test]
    async fn buy_opens_long_and_commits_everything() {
        let mut h  = Harness::new([BUY_HIGH]);
        let mut rx = h.board.broadcast_tx.subscribe();

        let report = h.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Executed { plan: ExecutionPlan::Open { side: Side::Long, .. } }));

        let pos = h.state.position.as_ref().unwrap();
        assert_eq!(pos.side, Side::Long);
        assert!(pos.contracts > 0.0);
        assert_eq!(h.state.current_leverage, Some(5));
        assert_eq!(h.state.trailing.side, Some(Side::Long));

        // committed together
        let stored = h.store.load_symbol_state(MODEL, SYM).await.unwrap().unwrap();
        assert_eq!(stored.position, h.state.position);
        assert_eq!(h.store.trades(SYM).len(), 1);
        assert!(h.reasons().contains(&ReasonCode::Opened));
        assert_eq!(h.store.equity_count(), 1);

        // published + broadcast
        assert_eq!(h.board.get_last_signal(MODEL, SYM).await.unwrap().action, Action::Buy);
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            events.push(msg);
        }
        assert!(events.iter().any(|e| e.contains("TRADE_EXECUTED")));
        assert!(events.iter().any(|e| e.contains("CYCLE_COMPLETED")));
    }

    #[tokio::test]
    async fn malformed_reply_is_a_hold_noop() {
        let mut h = Harness::new(["the market looks bullish to me"]);
        let report = h.cycle().await;

        assert_eq!(report.outcome, CycleOutcome::NoOp { reason: ReasonCode::SignalHold });
        assert!(report.signal.unwrap().fail_safe);
        assert!(h.exchange.order_log().is_empty());
        assert!(h.state.history.last().unwrap().signal.fail_safe);
        assert_eq!(h.store.equity_count(), 1);
    }

    #[tokio::test]
    async fn hard_stop_closes_without_asking_the_model() {
        let mut h = Harness::new([BUY_HIGH]);
        h.cycle().await;
        assert_eq!(h.inference.prompts.lock().unwrap().len(), 1);

        h.feed.set_mid(48_900.0); // -2.2 %
        let report = h.cycle().await;

        assert_eq!(report.outcome, CycleOutcome::ProtectiveExit { trigger: ExitTrigger::HardStop });
        assert_eq!(h.inference.prompts.lock().unwrap().len(), 1);
        assert!(h.state.position.is_none());
        assert!(h.state.trailing.is_reset());

        let trades = h.store.trades(SYM);
        assert_eq!(trades.last().unwrap().kind, TradeKind::Close);
        assert_eq!(trades.last().unwrap().trigger, TradeTrigger::ProtectiveExit);
        let exit = h.store.audits(SYM).into_iter().find(|a| a.kind == AuditKind::ProtectiveExit).unwrap();
        assert_eq!(exit.reason, ReasonCode::ExitHardStop);
    }

    #[tokio::test]
    async fn opposite_signal_flips() {
        let mut h = Harness::new([BUY_HIGH, SELL_HIGH]);
        h.cycle().await;
        let report = h.cycle().await;

        assert!(matches!(report.outcome, CycleOutcome::Executed { plan: ExecutionPlan::Flip { .. } }));
        assert_eq!(h.state.position.as_ref().unwrap().side, Side::Short);

        let log = h.exchange.order_log();
        assert_eq!(log.len(), 3);
        assert!(!log[0].reduce_only && log[1].reduce_only && !log[2].reduce_only);
        assert!(h.reasons().contains(&ReasonCode::Flipped));
        // leverage already 5x, no second update
        assert_eq!(h.exchange.leverage_log(), vec![5]);
    }

    #[tokio::test]
    async fn wide_spread_defers() {
        let mut h = Harness::new([BUY_HIGH]);
        h.feed.set_book(OrderBook {
            symbol: SYM.into(),
            bids:   vec![BookLevel { price: 49_000.0, size: 1_000.0 }],
            asks:   vec![BookLevel { price: 51_000.0, size: 1_000.0 }],
            ts:     Utc::now(),
        });

        let report = h.cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Deferred { reason: ReasonCode::DeferredSpread });
        assert!(h.exchange.order_log().is_empty());
        assert!(h.state.position.is_none());
        // the signal itself passed and is on record
        assert!(!h.state.history.last().unwrap().suppressed);
    }

    #[tokio::test]
    async fn repeated_network_failure_is_fatal_and_flags_reconcile() {
        let mut h = Harness::new([BUY_HIGH, HOLD]);
        h.exchange.fail_orders([ExchangeError::Network("reset".into()), ExchangeError::Network("reset".into())]);

        let report = h.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Fatal { .. }));
        assert!(h.state.needs_reconcile);
        assert_eq!(h.exchange.order_log().len(), 2);
        let failed = h.store.audits(SYM).into_iter().find(|a| a.reason == ReasonCode::ExecutionFailed).unwrap();
        assert!(failed.alert);
        assert_eq!(h.store.equity_count(), 0);

        // next cycle clears the flag through reconcile
        h.cycle().await;
        assert!(!h.state.needs_reconcile);
        assert!(h.reasons().contains(&ReasonCode::Reconciled));
    }

    #[tokio::test]
    async fn rejected_order_aborts_without_retry() {
        let mut h = Harness::new([BUY_HIGH]);
        h.exchange.fail_orders([ExchangeError::Rejected { code: "51000".into(), msg: "bad size".into() }]);

        let report = h.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Aborted { .. }));
        assert_eq!(h.exchange.order_log().len(), 1);
        assert!(!h.state.needs_reconcile);
        assert!(h.store.audits(SYM).iter().any(|a| a.reason == ReasonCode::ExecutionRejected && a.alert));
    }

    #[tokio::test]
    async fn leverage_failure_is_audited_and_trade_goes_ahead() {
        let mut h = Harness::new([BUY_HIGH]);
        h.exchange.fail_leverage([ExchangeError::Rejected { code: "59000".into(), msg: "pending orders".into() }]);

        let report = h.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Executed { .. }));
        assert!(h.reasons().contains(&ReasonCode::LeverageUpdateFailed));
        // paper account never left its default
        assert_eq!(h.store.trades(SYM)[0].leverage, 10);
        assert_eq!(h.state.current_leverage, Some(10));
    }

    #[tokio::test]
    async fn choppy_history_suppresses_medium_signal() {
        let mut h = Harness::new([BUY_MEDIUM]);
        for (action, ago) in [(Action::Buy, 900), (Action::Sell, 600), (Action::Hold, 300)] {
            h.state.history.push(sig(action, Confidence::Medium, ago), 50_000.0, false);
        }

        let report = h.cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Suppressed { reason: ReasonCode::SuppressedChoppy });
        assert!(h.state.history.last().unwrap().suppressed);
        assert!(h.exchange.order_log().is_empty());
    }

    #[tokio::test]
    async fn stored_position_missing_on_exchange_is_reconciled() {
        let mut h = Harness::new([HOLD]);
        h.state.position = Some(Position {
            symbol:         SYM.into(),
            side:           Side::Long,
            contracts:      1.0,
            entry_price:    50_000.0,
            leverage:       10,
            margin_mode:    MarginMode::Cross,
            opened_at:      Utc::now(),
            mark_price:     None,
            unrealized_pnl: None,
        });
        h.state.trailing = TrailingState { peak_profit_pct: 1.2, tier: Tier::Tier1, side: Some(Side::Long) };

        h.cycle().await;
        assert!(h.state.position.is_none());
        assert!(h.state.trailing.is_reset());
        let reasons = h.reasons();
        assert!(reasons.contains(&ReasonCode::Reconciled));
        assert!(reasons.contains(&ReasonCode::TrailingReset));

        // the external close is on the trade log
        let trades = h.store.trades(SYM);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, TradeKind::Close);
        assert_eq!(trades[0].trigger, TradeTrigger::Reconcile);
        assert_eq!(trades[0].model, MODEL);
        assert_eq!(trades[0].contracts, 1.0);
    }

    #[tokio::test]
    async fn candle_outage_abandons_quietly() {
        let mut h = Harness::new([BUY_HIGH]);
        h.exchange.fail_candles((0..3).map(|_| ExchangeError::Network("down".into())));

        let report = h.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Abandoned { .. }));
        let abandoned = h.store.audits(SYM).into_iter().find(|a| a.reason == ReasonCode::CycleAbandoned).unwrap();
        assert!(!abandoned.alert);
        assert!(h.inference.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fill_acked_after_the_timeout_is_recorded_by_next_reconcile() {
        let mut h = Harness::new([BUY_HIGH, HOLD]);
        h.exchange.slow_acks([Duration::from_millis(500)]);

        assert!(h.cycle_within(Duration::from_millis(300)).await.is_none());
        assert!(h.state.needs_reconcile);
        assert!(h.state.position.is_none());
        assert!(h.store.trades(SYM).is_empty());
        let unacked = h.store.audits(SYM).into_iter().find(|a| a.reason == ReasonCode::ExecutionFailed).unwrap();
        assert!(unacked.alert);
        assert!(unacked.detail.contains("no ack before timeout"));
        assert!(h.reasons().contains(&ReasonCode::CycleAbandoned));

        // the order did fill on the venue; reconcile puts it on the trade log
        h.cycle_within(Duration::from_secs(5)).await.unwrap();
        let trades = h.store.trades(SYM);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, TradeKind::Open);
        assert_eq!(trades[0].side, Side::Long);
        assert_eq!(trades[0].trigger, TradeTrigger::Reconcile);
        assert!(!h.state.needs_reconcile);
        assert_eq!(h.state.position.as_ref().unwrap().side, Side::Long);
    }

    #[tokio::test]
    async fn timed_out_flip_keeps_the_filled_leg() {
        let mut h = Harness::new([BUY_HIGH, SELL_HIGH, HOLD]);
        h.cycle().await;
        // the close leg of the flip acks at once, the new leg hangs
        h.exchange.slow_acks([Duration::ZERO, Duration::from_millis(500)]);

        assert!(h.cycle_within(Duration::from_millis(300)).await.is_none());
        let trades = h.store.trades(SYM);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].kind, TradeKind::Close);
        assert_eq!(trades[1].trigger, TradeTrigger::Signal);
        // close leg applied to the stored long
        assert!(h.state.position.is_none());
        assert!(h.state.needs_reconcile);
        let stored = h.store.load_symbol_state(MODEL, SYM).await.unwrap().unwrap();
        assert!(stored.position.is_none());

        h.cycle_within(Duration::from_secs(5)).await.unwrap();
        let trades = h.store.trades(SYM);
        assert_eq!(trades.len(), 3);
        assert_eq!((trades[2].kind, trades[2].side, trades[2].trigger), (TradeKind::Open, Side::Short, TradeTrigger::Reconcile));
        assert_eq!(h.state.position.as_ref().unwrap().side, Side::Short);
    }

    #[tokio::test]
    async fn failed_reread_projects_the_fill() {
        let mut h = Harness::new([BUY_HIGH]);
        // reconcile read passes, every attempt of the post-order re-read fails
        h.exchange.fail_positions_after(1, (0..3).map(|_| ExchangeError::Network("down".into())));

        let report = h.cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Executed { plan: ExecutionPlan::Open { .. } }));
        let trade = h.store.trades(SYM)[0].clone();
        let pos = h.state.position.as_ref().unwrap();
        assert_eq!((pos.side, pos.contracts), (Side::Long, trade.contracts));
        assert_eq!(h.state.trailing.side, Some(Side::Long));
        assert!(h.state.needs_reconcile);
    }

    #[tokio::test]
    async fn only_the_equity_owner_writes_snapshots() {
        let mut h = Harness::new([HOLD, HOLD]);
        h.cycle().await;
        assert_eq!(h.store.equity_count(), 1);

        h.pipeline.equity_owner = false;
        h.cycle().await;
        assert_eq!(h.store.equity_count(), 1);
    }

    #[tokio::test]
    async fn report_and_records_carry_the_model() {
        let mut h = Harness::new([BUY_HIGH]);
        let report = h.cycle().await;
        assert_eq!(report.model, MODEL);
        assert!(h.store.audits(SYM).iter().all(|a| a.model == MODEL));
        assert_eq!(h.store.trades(SYM)[0].model, MODEL);
        assert_eq!(h.state.model, MODEL);
    }
}

//! # engine::executor — Execution Coordinator
//!
//! แยกเป็นสองส่วน:
//!
//! 1. [`plan`] — pure function, ตัดสินว่าจะ OPEN / ADD / REDUCE / FLIP / no-op
//!    จาก position ปัจจุบันกับ target ที่ sizing ให้มา
//! 2. [`execute`] / [`close_position`] — ส่ง market order จริงผ่าน
//!    `dyn Exchange` พร้อม leverage sync และ retry ตามกติกา
//!
//! ```text
//! (position, desired side, target contracts)
//!        │ plan()
//!        ▼
//!  ExecutionPlan ──▶ ensure_leverage ──▶ place_with_retry ──▶ TradeRecord
//!                    (OPEN/ADD/FLIP)     (1 retry on network,   + audit
//!                                         same client id)
//! ```
//!
//! Order failures map onto the cycle error taxonomy:
//! network twice → [`CycleError::Fatal`]; auth / rejected / funds →
//! [`CycleError::Aborted`] without retry.
//!
//! 3. [`project_fills`] / [`reconcile_fills`] — position ⇄ fills
//!    bookkeeping, ใช้ตอน re-read ล้มเหลว, ตอน cycle โดน timeout ตัดกลางทาง
//!    และตอน reconcile เจอ fill ที่ไม่มี ack รองรับ

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SymbolConfig;
use crate::engine::sizing::floor_to_step;
use crate::engine::trailing::ExitTrigger;
use crate::error::{CycleError, ExchangeError};
use crate::exchange::{Exchange, OrderAck, OrderRequest, OrderSide};
use crate::models::{
    AuditKind, AuditRecord, Confidence, MarginMode, Position, ReasonCode, Side, Tier, TradeKind,
    TradeRecord, TradeTrigger, TrailingState,
};

use super::journal::{Journal, PendingOrder};

/// Pause before the single resubmission of a network-failed order
pub const ORDER_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Contract amounts closer than this are the same amount
const CONTRACT_EPS: f64 = 1e-9;

// ─── Plan ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "plan", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPlan {
    Open   { side: Side, contracts: f64 },
    Add    { side: Side, contracts: f64 },
    /// Reduce-only, `contracts` is the amount taken off
    Reduce { side: Side, contracts: f64 },
    /// Reduce-only close of the whole position, then a fresh open
    Flip   { from: Side, close_contracts: f64, to: Side, open_contracts: f64 },
    NoOp   { reason: ReasonCode, detail: String },
}

impl ExecutionPlan {
    /// Order side this plan sends to the book; `None` for a no-op.
    ///
    /// Both legs of a flip trade in the same direction, so one side covers it.
    pub fn execution_side(&self) -> Option<OrderSide> {
        match self {
            ExecutionPlan::Open { side, .. } | ExecutionPlan::Add { side, .. } => Some(OrderSide::opening(*side)),
            ExecutionPlan::Reduce { side, .. } => Some(OrderSide::closing(*side)),
            ExecutionPlan::Flip { to, .. } => Some(OrderSide::opening(*to)),
            ExecutionPlan::NoOp { .. } => None,
        }
    }

    fn grows_exposure(&self) -> bool {
        matches!(self, ExecutionPlan::Open { .. } | ExecutionPlan::Add { .. } | ExecutionPlan::Flip { .. })
    }
}

fn noop(reason: ReasonCode, detail: impl Into<String>) -> ExecutionPlan {
    ExecutionPlan::NoOp { reason, detail: detail.into() }
}

/// Decide what to do. `desired = None` means the signal was HOLD;
/// `target` is the sized contract count (already floored).
pub fn plan(
    position:      Option<&Position>,
    desired:       Option<Side>,
    target:        f64,
    min_increment: f64,
) -> ExecutionPlan {
    let Some(want) = desired else {
        return noop(ReasonCode::SignalHold, "HOLD");
    };
    if !(target >= min_increment) {
        return noop(
            ReasonCode::SizeBelowIncrement,
            format!("target {target} below increment {min_increment}"),
        );
    }

    match position {
        None => ExecutionPlan::Open { side: want, contracts: target },

        Some(pos) if pos.side == want => {
            let delta = target - pos.contracts;
            let step  = floor_to_step(delta.abs(), min_increment);
            if step < min_increment {
                noop(
                    ReasonCode::DeltaBelowIncrement,
                    format!("holding {} vs target {target}", pos.contracts),
                )
            } else if delta > 0.0 {
                ExecutionPlan::Add { side: want, contracts: step }
            } else {
                ExecutionPlan::Reduce { side: want, contracts: step }
            }
        }

        Some(pos) => ExecutionPlan::Flip {
            from:            pos.side,
            close_contracts: pos.contracts,
            to:              want,
            open_contracts:  target,
        },
    }
}

// ─── Execution ────────────────────────────────────────────────────────────────

pub struct ExecContext<'a> {
    pub exchange:   &'a dyn Exchange,
    pub symbol:     &'a SymbolConfig,
    /// Decision-time reference price recorded on trades
    pub price:      f64,
    pub confidence: Option<Confidence>,
    pub trigger:    TradeTrigger,
}

/// Bring exchange leverage in line with `wanted`. Returns the leverage the
/// account actually runs with afterwards.
pub async fn ensure_leverage(
    ctx:     &ExecContext<'_>,
    wanted:  u32,
    current: &mut Option<u32>,
    journal: &mut Journal,
) -> u32 {
    if *current == Some(wanted) {
        return wanted;
    }
    let sym = &ctx.symbol.symbol;
    match ctx.exchange.set_leverage(sym, wanted, ctx.symbol.margin_mode).await {
        Ok(()) => {
            journal.note(
                AuditKind::Leverage,
                ReasonCode::LeverageUpdated,
                format!("{} → {wanted}x", current.map_or("?".to_string(), |l| format!("{l}x"))),
            );
            *current = Some(wanted);
            wanted
        }
        Err(e) => {
            let kept = current.unwrap_or(ctx.symbol.default_leverage);
            journal.alert(
                AuditKind::Leverage,
                ReasonCode::LeverageUpdateFailed,
                format!("wanted {wanted}x, keeping {kept}x: {e}"),
            );
            kept
        }
    }
}

/// Submit once; on a transient failure wait and resubmit the same order
/// (same client id, so the venue can dedupe).
pub async fn place_with_retry(exchange: &dyn Exchange, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
    match exchange.place_order(order).await {
        Ok(ack) => Ok(ack),
        Err(e) if e.is_retryable() => {
            warn!(
                symbol    = %order.symbol,
                client_id = %order.client_order_id,
                error     = %e,
                "⚠️ Order failed, retrying once"
            );
            sleep(ORDER_RETRY_DELAY).await;
            exchange.place_order(order).await
        }
        Err(e) => Err(e),
    }
}

fn order_failure(err: ExchangeError) -> CycleError {
    if err.is_retryable() {
        CycleError::Fatal(err)
    } else {
        CycleError::Aborted(err)
    }
}

/// Send one market order for `side`'s position and journal the fill.
async fn submit(
    ctx:       &ExecContext<'_>,
    kind:      TradeKind,
    side:      Side,
    contracts: f64,
    leverage:  u32,
    journal:   &mut Journal,
) -> Result<TradeRecord, CycleError> {
    let (order_side, reduce_only) = match kind {
        TradeKind::Open | TradeKind::Add     => (OrderSide::opening(side), false),
        TradeKind::Reduce | TradeKind::Close => (OrderSide::closing(side), true),
    };
    let order = OrderRequest {
        symbol:          ctx.symbol.symbol.clone(),
        side:            order_side,
        contracts,
        reduce_only,
        margin_mode:     ctx.symbol.margin_mode,
        client_order_id: Uuid::new_v4().simple().to_string(),
    };

    journal.order_sent(PendingOrder {
        client_order_id: order.client_order_id.clone(),
        kind,
        side,
        contracts,
        sent_at: Utc::now(),
    });
    let result = place_with_retry(ctx.exchange, &order).await;
    journal.order_settled(&order.client_order_id);
    let ack = result.map_err(order_failure)?;

    info!(
        symbol    = %order.symbol,
        kind      = kind.as_str(),
        side      = %side,
        contracts,
        price     = ctx.price,
        order_id  = %ack.order_id,
        "⚡ Order filled"
    );

    let trade = TradeRecord {
        trade_id:          Uuid::new_v4(),
        model:             journal.model().to_string(),
        symbol:            order.symbol,
        kind,
        side,
        contracts,
        price:             ctx.price,
        leverage,
        confidence:        ctx.confidence,
        trigger:           ctx.trigger,
        client_order_id:   order.client_order_id,
        exchange_order_id: Some(ack.order_id),
        at:                Utc::now(),
    };
    journal.trade(trade.clone());
    Ok(trade)
}

/// Carry out a signal-driven plan. `leverage` is the clamped AI suggestion;
/// without one the exchange leverage is left alone. The trailing state is
/// reset on a flip.
pub async fn execute(
    ctx:              &ExecContext<'_>,
    plan:             &ExecutionPlan,
    leverage:         Option<u32>,
    trailing:         &mut TrailingState,
    current_leverage: &mut Option<u32>,
    journal:          &mut Journal,
) -> Result<(), CycleError> {
    let effective = match leverage {
        Some(wanted) if plan.grows_exposure() => ensure_leverage(ctx, wanted, current_leverage, journal).await,
        _ => current_leverage.unwrap_or(ctx.symbol.default_leverage),
    };

    match plan {
        ExecutionPlan::NoOp { reason, detail } => {
            journal.note(AuditKind::NoOp, *reason, detail.clone());
        }

        ExecutionPlan::Open { side, contracts } => {
            submit(ctx, TradeKind::Open, *side, *contracts, effective, journal).await?;
            trailing.reset();
            trailing.side = Some(*side);
            journal.note(AuditKind::Executed, ReasonCode::Opened, format!("{side} {contracts} @ {effective}x"));
        }

        ExecutionPlan::Add { side, contracts } => {
            submit(ctx, TradeKind::Add, *side, *contracts, effective, journal).await?;
            journal.note(AuditKind::Executed, ReasonCode::Added, format!("{side} +{contracts}"));
        }

        ExecutionPlan::Reduce { side, contracts } => {
            submit(ctx, TradeKind::Reduce, *side, *contracts, effective, journal).await?;
            journal.note(AuditKind::Executed, ReasonCode::Reduced, format!("{side} -{contracts}"));
        }

        ExecutionPlan::Flip { from, close_contracts, to, open_contracts } => {
            // ── 1. Close the whole position ──
            submit(ctx, TradeKind::Close, *from, *close_contracts, effective, journal).await?;

            // ── 2. Trailing memory belonged to the old side ──
            let before = *trailing;
            trailing.reset();
            trailing.side = Some(*to);
            journal.record(
                AuditRecord::new(
                    journal.symbol(),
                    AuditKind::TierTransition,
                    ReasonCode::TrailingReset,
                    format!("flip {from} → {to}, peak was {:.2}%", before.peak_profit_pct),
                )
                .with_tiers(before.tier, Tier::None),
            );

            // ── 3. Open the new side ──
            submit(ctx, TradeKind::Open, *to, *open_contracts, effective, journal).await?;
            journal.note(
                AuditKind::Executed,
                ReasonCode::Flipped,
                format!("{from} {close_contracts} → {to} {open_contracts} @ {effective}x"),
            );
        }
    }
    Ok(())
}

/// Protective close of the full position. Skips the liquidity gate.
pub async fn close_position(
    ctx:      &ExecContext<'_>,
    position: &Position,
    trigger:  ExitTrigger,
    peak_pct: f64,
    tier:     Tier,
    journal:  &mut Journal,
) -> Result<(), CycleError> {
    submit(ctx, TradeKind::Close, position.side, position.contracts, position.leverage, journal).await?;
    journal.record(
        AuditRecord::new(
            journal.symbol(),
            AuditKind::ProtectiveExit,
            trigger.reason(),
            format!("{} {} closed, peak {peak_pct:.2}%", position.side, position.contracts),
        )
        .with_tiers(tier, Tier::None),
    );
    Ok(())
}

// ─── Fill bookkeeping ─────────────────────────────────────────────────────────

/// Position implied by applying `fills` in order on top of `position`.
pub fn project_fills(position: Option<Position>, fills: &[TradeRecord], margin_mode: MarginMode) -> Option<Position> {
    fills.iter().fold(position, |pos, fill| apply_fill(pos, fill, margin_mode))
}

fn apply_fill(position: Option<Position>, fill: &TradeRecord, margin_mode: MarginMode) -> Option<Position> {
    match (fill.kind, position) {
        (TradeKind::Open | TradeKind::Add, Some(mut p)) if p.side == fill.side => {
            let total = p.contracts + fill.contracts;
            p.entry_price = (p.entry_price * p.contracts + fill.price * fill.contracts) / total;
            p.contracts   = total;
            Some(p)
        }
        (TradeKind::Open | TradeKind::Add, _) => Some(Position {
            symbol:         fill.symbol.clone(),
            side:           fill.side,
            contracts:      fill.contracts,
            entry_price:    fill.price,
            leverage:       fill.leverage,
            margin_mode,
            opened_at:      fill.at,
            mark_price:     None,
            unrealized_pnl: None,
        }),
        (TradeKind::Reduce, Some(mut p)) if p.side == fill.side => {
            p.contracts -= fill.contracts;
            (p.contracts > CONTRACT_EPS).then_some(p)
        }
        (TradeKind::Close, Some(p)) if p.side == fill.side => None,
        // nothing of that side is open
        (TradeKind::Reduce | TradeKind::Close, other) => other,
    }
}

/// Records that turn `stored` into `live`. Used when the exchange shows a
/// position change no acknowledged order accounts for.
pub fn reconcile_fills(model: &str, stored: Option<&Position>, live: Option<&Position>) -> Vec<TradeRecord> {
    let record = |kind: TradeKind, p: &Position, contracts: f64, price: f64| TradeRecord {
        trade_id:          Uuid::new_v4(),
        model:             model.to_string(),
        symbol:            p.symbol.clone(),
        kind,
        side:              p.side,
        contracts,
        price,
        leverage:          p.leverage,
        confidence:        None,
        trigger:           TradeTrigger::Reconcile,
        client_order_id:   String::new(),
        exchange_order_id: None,
        at:                Utc::now(),
    };
    let exit_price = |p: &Position| p.mark_price.unwrap_or(p.entry_price);

    match (stored, live) {
        (None, None) => Vec::new(),
        (None, Some(b)) => vec![record(TradeKind::Open, b, b.contracts, b.entry_price)],
        (Some(a), None) => vec![record(TradeKind::Close, a, a.contracts, exit_price(a))],
        (Some(a), Some(b)) if a.side == b.side => {
            let delta = b.contracts - a.contracts;
            if delta.abs() <= CONTRACT_EPS {
                Vec::new()
            } else if delta > 0.0 {
                vec![record(TradeKind::Add, b, delta, b.entry_price)]
            } else {
                vec![record(TradeKind::Reduce, b, -delta, exit_price(b))]
            }
        }
        (Some(a), Some(b)) => vec![
            record(TradeKind::Close, a, a.contracts, exit_price(a)),
            record(TradeKind::Open, b, b.contracts, b.entry_price),
        ],
    }
}

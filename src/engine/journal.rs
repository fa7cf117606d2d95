//! # engine::journal
//!
//! Per-cycle buffer of audit and trade records. Nothing here touches the
//! store; the cycle drains the journal into one `WriteBatch` at the end so
//! the records land together with the state they explain.
//!
//! The journal is owned by whoever runs the cycle, not by the cycle future.
//! When the slot timeout drops a cycle mid-flight the scheduler still holds
//! every fill acknowledged so far, plus the orders that went out without an
//! ack ([`PendingOrder`]).

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::models::{AuditKind, AuditRecord, ReasonCode, Side, TradeKind, TradeRecord};

/// Order handed to the exchange whose acknowledgement has not come back.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub client_order_id: String,
    pub kind:            TradeKind,
    pub side:            Side,
    pub contracts:       f64,
    pub sent_at:         DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Journal {
    model:       String,
    symbol:      String,
    pub audits:  Vec<AuditRecord>,
    pub trades:  Vec<TradeRecord>,
    pub pending: Vec<PendingOrder>,
}

impl Journal {
    pub fn new(model: &str, symbol: &str) -> Self {
        Self { model: model.to_string(), symbol: symbol.to_string(), ..Default::default() }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn record(&mut self, mut audit: AuditRecord) {
        if audit.model.is_empty() {
            audit.model = self.model.clone();
        }
        if audit.alert {
            warn!(
                model  = %audit.model,
                symbol = %audit.symbol,
                kind   = audit.kind.as_str(),
                reason = %audit.reason,
                detail = %audit.detail,
                "🚨 Alert"
            );
        } else {
            info!(
                model  = %audit.model,
                symbol = %audit.symbol,
                kind   = audit.kind.as_str(),
                reason = %audit.reason,
                detail = %audit.detail,
                "📋 Audit"
            );
        }
        self.audits.push(audit);
    }

    pub fn note(&mut self, kind: AuditKind, reason: ReasonCode, detail: impl Into<String>) {
        let rec = AuditRecord::new(&self.symbol, kind, reason, detail);
        self.record(rec);
    }

    pub fn alert(&mut self, kind: AuditKind, reason: ReasonCode, detail: impl Into<String>) {
        let rec = AuditRecord::new(&self.symbol, kind, reason, detail).alerting();
        self.record(rec);
    }

    pub fn trade(&mut self, mut trade: TradeRecord) {
        if trade.model.is_empty() {
            trade.model = self.model.clone();
        }
        self.trades.push(trade);
    }

    // ── In-flight orders ──────────────────────────────────────────────────────

    pub fn order_sent(&mut self, order: PendingOrder) {
        self.pending.push(order);
    }

    /// The order came back, filled or failed; it is no longer in doubt.
    pub fn order_settled(&mut self, client_order_id: &str) {
        self.pending.retain(|p| p.client_order_id != client_order_id);
    }
}

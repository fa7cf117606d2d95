//! # store — persistence seam
//!
//! The store is the durable owner of every record across restarts:
//!
//! | Table / map         | Written                    | Read                       |
//! |---------------------|----------------------------|----------------------------|
//! | `symbol_state`      | upsert, once per cycle     | start-up reload            |
//! | `trades`            | append-only                | `query_range`              |
//! | `audits`            | append-only                | `query_range`              |
//! | `equity_snapshots`  | append-only                | `query_range`              |
//!
//! A cycle hands everything it produced to [`Store::commit`] as one
//! [`WriteBatch`]; implementations make the whole batch visible at once
//! or not at all.
//!
//! State rows are keyed by lane `(model, symbol)`: two models trading the
//! same instrument keep separate positions, history and trailing memory.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::cycle::SymbolState;
use crate::error::StoreError;
use crate::models::{AuditRecord, EquitySnapshot, Position, TradeRecord, TrailingState};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Everything one cycle wants persisted for one lane.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub model:  String,
    pub symbol: String,
    /// Full per-lane state; `None` leaves the stored row untouched
    pub state:  Option<SymbolState>,
    pub trades: Vec<TradeRecord>,
    pub audits: Vec<AuditRecord>,
    /// Account equity, written by the model's equity owner only
    pub equity: Option<EquitySnapshot>,
}

impl WriteBatch {
    pub fn new(model: &str, symbol: &str) -> Self {
        Self { model: model.to_string(), symbol: symbol.to_string(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.trades.is_empty() && self.audits.is_empty() && self.equity.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Trade,
    Audit,
    Equity,
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trade" | "trades"   => Ok(RecordKind::Trade),
            "audit" | "audits"   => Ok(RecordKind::Audit),
            "equity"             => Ok(RecordKind::Equity),
            other => Err(format!("unknown record kind '{other}' (trade | audit | equity)")),
        }
    }
}

/// One row out of `query_range`, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredRecord {
    Trade(TradeRecord),
    Audit(AuditRecord),
    Equity {
        model:  String,
        symbol: String,
        #[serde(flatten)]
        snapshot: EquitySnapshot,
    },
}

impl StoredRecord {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            StoredRecord::Trade(t)              => t.at,
            StoredRecord::Audit(a)              => a.at,
            StoredRecord::Equity { snapshot, .. } => snapshot.at,
        }
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_symbol_state(&self, model: &str, symbol: &str) -> Result<Option<SymbolState>, StoreError>;

    /// All-or-nothing write of one batch.
    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Records of `kind` with `from <= at < to`, oldest first. `None`
    /// filters match every model / symbol.
    async fn query_range(
        &self,
        kind:   RecordKind,
        model:  Option<&str>,
        symbol: Option<&str>,
        from:   DateTime<Utc>,
        to:     DateTime<Utc>,
        limit:  usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    // ── Single-record helpers ─────────────────────────────────────────────────

    async fn append_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new(&trade.model, &trade.symbol);
        batch.trades.push(trade.clone());
        self.commit(&batch).await
    }

    async fn append_audit(&self, audit: &AuditRecord) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new(&audit.model, &audit.symbol);
        batch.audits.push(audit.clone());
        self.commit(&batch).await
    }

    async fn append_equity_snapshot(&self, model: &str, symbol: &str, snapshot: &EquitySnapshot) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new(model, symbol);
        batch.equity = Some(snapshot.clone());
        self.commit(&batch).await
    }

    /// Read-modify-write of the stored state; only the owning lane task
    /// writes a given row, so no lost update between load and commit.
    async fn upsert_position_state(&self, model: &str, symbol: &str, position: Option<&Position>) -> Result<(), StoreError> {
        let mut state = self
            .load_symbol_state(model, symbol)
            .await?
            .unwrap_or_else(|| SymbolState::new(symbol, 1).for_model(model));
        state.position = position.cloned();
        let mut batch = WriteBatch::new(model, symbol);
        batch.state = Some(state);
        self.commit(&batch).await
    }

    async fn upsert_trailing_state(&self, model: &str, symbol: &str, trailing: &TrailingState) -> Result<(), StoreError> {
        let mut state = self
            .load_symbol_state(model, symbol)
            .await?
            .unwrap_or_else(|| SymbolState::new(symbol, 1).for_model(model));
        state.trailing = *trailing;
        let mut batch = WriteBatch::new(model, symbol);
        batch.state = Some(state);
        self.commit(&batch).await
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `Store` implementation must show. Each backend's
    //! test module runs these against its own instance.

    use super::*;
    use crate::models::{AuditKind, ReasonCode, Side, Tier, TradeKind, TradeTrigger};
    use chrono::Duration;
    use uuid::Uuid;

    pub const SYM: &str = "BTC-USDT-SWAP";
    pub const MODEL: &str = "deepseek";

    pub fn trade(at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            trade_id:          Uuid::new_v4(),
            model:             MODEL.into(),
            symbol:            SYM.into(),
            kind:              TradeKind::Open,
            side:              Side::Long,
            contracts:         2.0,
            price:             50_000.0,
            leverage:          10,
            confidence:        None,
            trigger:           TradeTrigger::Signal,
            client_order_id:   "abc".into(),
            exchange_order_id: Some("1".into()),
            at,
        }
    }

    pub async fn state_round_trips(store: &dyn Store) {
        assert!(store.load_symbol_state(MODEL, SYM).await.unwrap().is_none());

        let mut st = SymbolState::new(SYM, 50).for_model(MODEL);
        st.trailing.tier = Tier::Tier2;
        st.trailing.peak_profit_pct = 3.4;
        st.current_leverage = Some(7);
        st.needs_reconcile = true;
        let mut batch = WriteBatch::new(MODEL, SYM);
        batch.state = Some(st.clone());
        store.commit(&batch).await.unwrap();

        let loaded = store.load_symbol_state(MODEL, SYM).await.unwrap().unwrap();
        assert_eq!(loaded, st);
    }

    pub async fn batch_is_visible_together(store: &dyn Store) {
        let now = Utc::now();
        let mut batch = WriteBatch::new(MODEL, SYM);
        batch.state = Some(SymbolState::new(SYM, 50).for_model(MODEL));
        batch.trades.push(trade(now));
        batch.audits.push(AuditRecord { model: MODEL.into(), ..AuditRecord::new(SYM, AuditKind::Executed, ReasonCode::Opened, "open 2") });
        batch.equity = Some(EquitySnapshot {
            at: now, total_equity: 1_000.0, available: 900.0, unrealized_pnl: 0.0, currency: "USDT".into(),
        });
        store.commit(&batch).await.unwrap();

        let from = now - Duration::minutes(1);
        let to   = now + Duration::minutes(1);
        for kind in [RecordKind::Trade, RecordKind::Audit, RecordKind::Equity] {
            let rows = store.query_range(kind, Some(MODEL), Some(SYM), from, to, 100).await.unwrap();
            assert_eq!(rows.len(), 1, "{kind:?}");
        }
        assert!(store.query_range(RecordKind::Trade, None, Some("ETH-USDT-SWAP"), from, to, 100).await.unwrap().is_empty());
    }

    pub async fn range_is_half_open_and_ordered(store: &dyn Store) {
        let base = Utc::now() - Duration::hours(1);
        for i in [2, 0, 1] {
            store.append_trade(&trade(base + Duration::minutes(i))).await.unwrap();
        }
        let rows = store
            .query_range(RecordKind::Trade, None, None, base, base + Duration::minutes(2), 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].at() < rows[1].at());
    }

    pub async fn single_upserts_touch_one_field(store: &dyn Store) {
        let mut trailing = TrailingState::default();
        trailing.tier = Tier::Low;
        store.upsert_trailing_state(MODEL, SYM, &trailing).await.unwrap();
        store.upsert_position_state(MODEL, SYM, None).await.unwrap();
        let loaded = store.load_symbol_state(MODEL, SYM).await.unwrap().unwrap();
        assert_eq!(loaded.trailing.tier, Tier::Low);
        assert!(loaded.position.is_none());

        let now = Utc::now();
        store
            .append_audit(&AuditRecord {
                model: MODEL.into(),
                ..AuditRecord::new(SYM, AuditKind::Deferred, ReasonCode::DeferredSpread, "wide")
            })
            .await
            .unwrap();
        store
            .append_equity_snapshot(MODEL, SYM, &EquitySnapshot {
                at: now, total_equity: 500.0, available: 500.0, unrealized_pnl: 0.0, currency: "USDT".into(),
            })
            .await
            .unwrap();
        let span = (now - Duration::minutes(1), now + Duration::minutes(1));
        let audits = store.query_range(RecordKind::Audit, Some(MODEL), Some(SYM), span.0, span.1, 10).await.unwrap();
        let equity = store.query_range(RecordKind::Equity, Some(MODEL), Some(SYM), span.0, span.1, 10).await.unwrap();
        assert_eq!((audits.len(), equity.len()), (1, 1));
    }

    pub async fn lanes_are_kept_apart(store: &dyn Store) {
        let mut a = SymbolState::new(SYM, 50).for_model(MODEL);
        a.current_leverage = Some(3);
        let b = SymbolState::new(SYM, 50).for_model("qwen");

        let now = Utc::now();
        let mut first = WriteBatch::new(MODEL, SYM);
        first.state = Some(a.clone());
        first.trades.push(trade(now));
        store.commit(&first).await.unwrap();

        let mut second = WriteBatch::new("qwen", SYM);
        second.state = Some(b.clone());
        store.commit(&second).await.unwrap();

        assert_eq!(store.load_symbol_state(MODEL, SYM).await.unwrap(), Some(a));
        assert_eq!(store.load_symbol_state("qwen", SYM).await.unwrap(), Some(b));

        let span = (now - Duration::minutes(1), now + Duration::minutes(1));
        let qwen = store.query_range(RecordKind::Trade, Some("qwen"), Some(SYM), span.0, span.1, 10).await.unwrap();
        let any  = store.query_range(RecordKind::Trade, None, Some(SYM), span.0, span.1, 10).await.unwrap();
        assert!(qwen.is_empty());
        assert_eq!(any.len(), 1);
    }
}

//! # store::memory
//!
//! In-process store. Used by tests and when `DATABASE_URL=memory`.
//! One mutex section per batch, so a batch is visible all at once.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::cycle::SymbolState;
use crate::error::StoreError;
use crate::models::{AuditRecord, EquitySnapshot, TradeRecord};
use crate::store::{RecordKind, Store, StoredRecord, WriteBatch};

/// `(model, symbol)`
type Lane = (String, String);

#[derive(Default)]
struct Inner {
    states: HashMap<Lane, SymbolState>,
    trades: Vec<TradeRecord>,
    audits: Vec<AuditRecord>,
    equity: Vec<(Lane, EquitySnapshot)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Corrupt("memory store mutex poisoned".into()))
    }

    /// Every audit for `symbol`, oldest first.
    #[cfg(test)]
    pub fn audits(&self, symbol: &str) -> Vec<AuditRecord> {
        self.inner.lock().unwrap().audits.iter().filter(|a| a.symbol == symbol).cloned().collect()
    }

    #[cfg(test)]
    pub fn trades(&self, symbol: &str) -> Vec<TradeRecord> {
        self.inner.lock().unwrap().trades.iter().filter(|t| t.symbol == symbol).cloned().collect()
    }

    #[cfg(test)]
    pub fn equity_count(&self) -> usize {
        self.inner.lock().unwrap().equity.len()
    }
}

fn in_range(at: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    at >= from && at < to
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_symbol_state(&self, model: &str, symbol: &str) -> Result<Option<SymbolState>, StoreError> {
        Ok(self.lock()?.states.get(&(model.to_string(), symbol.to_string())).cloned())
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let lane = (batch.model.clone(), batch.symbol.clone());
        if let Some(state) = &batch.state {
            inner.states.insert(lane.clone(), state.clone());
        }
        inner.trades.extend(batch.trades.iter().cloned());
        inner.audits.extend(batch.audits.iter().cloned());
        if let Some(eq) = &batch.equity {
            inner.equity.push((lane, eq.clone()));
        }
        Ok(())
    }

    async fn query_range(
        &self,
        kind:   RecordKind,
        model:  Option<&str>,
        symbol: Option<&str>,
        from:   DateTime<Utc>,
        to:     DateTime<Utc>,
        limit:  usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.lock()?;
        let matches = |m: &str, s: &str| {
            model.map_or(true, |want| want == m) && symbol.map_or(true, |want| want == s)
        };

        let mut rows: Vec<StoredRecord> = match kind {
            RecordKind::Trade => inner
                .trades
                .iter()
                .filter(|t| matches(&t.model, &t.symbol) && in_range(t.at, from, to))
                .cloned()
                .map(StoredRecord::Trade)
                .collect(),
            RecordKind::Audit => inner
                .audits
                .iter()
                .filter(|a| matches(&a.model, &a.symbol) && in_range(a.at, from, to))
                .cloned()
                .map(StoredRecord::Audit)
                .collect(),
            RecordKind::Equity => inner
                .equity
                .iter()
                .filter(|((m, s), e)| matches(m, s) && in_range(e.at, from, to))
                .map(|((m, s), e)| StoredRecord::Equity { model: m.clone(), symbol: s.clone(), snapshot: e.clone() })
                .collect(),
        };
        rows.sort_by_key(|r| r.at());
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn state_round_trips() {
        contract::state_round_trips(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn batch_is_visible_together() {
        contract::batch_is_visible_together(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn range_is_half_open_and_ordered() {
        contract::range_is_half_open_and_ordered(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn single_upserts_touch_one_field() {
        contract::single_upserts_touch_one_field(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn lanes_are_kept_apart() {
        contract::lanes_are_kept_apart(&MemoryStore::new()).await;
    }
}

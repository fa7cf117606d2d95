//! # store::sqlite — SQLite Database Layer
//!
//! ใช้ `sqlx` (SQLite driver) แบบ runtime query, ไม่ต้องมี database ตอน build
//!
//! ## Layout
//! ทุก record เก็บเป็น JSON `payload` + คอลัมน์ที่ใช้ filter (`model`,
//! `symbol`, `at` เป็น epoch millis). Schema ฝังอยู่ในไฟล์นี้และรันตอน
//! start-up. `symbol_state` มี primary key เป็น lane `(model, symbol)`.
//!
//! `commit` ห่อทั้ง batch ไว้ใน transaction เดียว

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::engine::cycle::SymbolState;
use crate::error::StoreError;
use crate::models::{AuditRecord, EquitySnapshot, TradeRecord};
use crate::store::{RecordKind, Store, StoredRecord, WriteBatch};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS symbol_state (
        model           TEXT NOT NULL,
        symbol          TEXT NOT NULL,
        payload         TEXT NOT NULL,
        side            TEXT,
        tier            TEXT NOT NULL,
        needs_reconcile INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        PRIMARY KEY (model, symbol)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trades (
        trade_id TEXT PRIMARY KEY,
        model    TEXT NOT NULL,
        symbol   TEXT NOT NULL,
        kind     TEXT NOT NULL,
        at       INTEGER NOT NULL,
        payload  TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_trades_lane_at ON trades (model, symbol, at)",
    r#"CREATE TABLE IF NOT EXISTS audits (
        id      TEXT PRIMARY KEY,
        model   TEXT NOT NULL,
        symbol  TEXT NOT NULL,
        kind    TEXT NOT NULL,
        reason  TEXT NOT NULL,
        alert   INTEGER NOT NULL,
        at      INTEGER NOT NULL,
        payload TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_audits_lane_at ON audits (model, symbol, at)",
    r#"CREATE TABLE IF NOT EXISTS equity_snapshots (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        model   TEXT NOT NULL,
        symbol  TEXT NOT NULL,
        at      INTEGER NOT NULL,
        payload TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_equity_lane_at ON equity_snapshots (model, symbol, at)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// สร้าง pool และ apply schema
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!(url = database_url, "Connecting to SQLite...");

        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid DATABASE_URL {database_url:?}"))?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to ":memory:" is its own database → keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        run_migrations(&pool).await?;

        info!("✅ SQLite ready, schema applied");
        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("Schema statement failed: {}", stmt.lines().next().unwrap_or_default()))?;
    }
    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_symbol_state(&self, model: &str, symbol: &str) -> Result<Option<SymbolState>, StoreError> {
        let row = sqlx::query("SELECT payload FROM symbol_state WHERE model = ?1 AND symbol = ?2")
            .bind(model)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        if let Some(state) = &batch.state {
            sqlx::query(
                r#"INSERT INTO symbol_state (model, symbol, payload, side, tier, needs_reconcile, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                   ON CONFLICT (model, symbol) DO UPDATE SET
                     payload         = excluded.payload,
                     side            = excluded.side,
                     tier            = excluded.tier,
                     needs_reconcile = excluded.needs_reconcile,
                     updated_at      = excluded.updated_at"#,
            )
            .bind(&batch.model)
            .bind(&batch.symbol)
            .bind(serde_json::to_string(state)?)
            .bind(state.position.as_ref().map(|p| p.side.as_str()))
            .bind(state.trailing.tier.as_str())
            .bind(state.needs_reconcile)
            .bind(millis(Utc::now()))
            .execute(&mut *tx)
            .await?;
        }

        for t in &batch.trades {
            sqlx::query(
                "INSERT INTO trades (trade_id, model, symbol, kind, at, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(t.trade_id.to_string())
            .bind(&t.model)
            .bind(&t.symbol)
            .bind(t.kind.as_str())
            .bind(millis(t.at))
            .bind(serde_json::to_string(t)?)
            .execute(&mut *tx)
            .await?;
        }

        for a in &batch.audits {
            sqlx::query(
                "INSERT INTO audits (id, model, symbol, kind, reason, alert, at, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(a.id.to_string())
            .bind(&a.model)
            .bind(&a.symbol)
            .bind(a.kind.as_str())
            .bind(a.reason.as_str())
            .bind(a.alert)
            .bind(millis(a.at))
            .bind(serde_json::to_string(a)?)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(eq) = &batch.equity {
            sqlx::query("INSERT INTO equity_snapshots (model, symbol, at, payload) VALUES (?1, ?2, ?3, ?4)")
                .bind(&batch.model)
                .bind(&batch.symbol)
                .bind(millis(eq.at))
                .bind(serde_json::to_string(eq)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
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
        let table = match kind {
            RecordKind::Trade  => "trades",
            RecordKind::Audit  => "audits",
            RecordKind::Equity => "equity_snapshots",
        };
        let sql = format!(
            "SELECT model, symbol, payload FROM {table} \
             WHERE at >= ?1 AND at < ?2 \
               AND (?3 IS NULL OR model = ?3) AND (?4 IS NULL OR symbol = ?4) \
             ORDER BY at, rowid LIMIT ?5"
        );
        let rows = sqlx::query(&sql)
            .bind(millis(from))
            .bind(millis(to))
            .bind(model)
            .bind(symbol)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<StoredRecord, StoreError> {
                let payload: String = row.try_get("payload")?;
                Ok(match kind {
                    RecordKind::Trade => StoredRecord::Trade(serde_json::from_str::<TradeRecord>(&payload)?),
                    RecordKind::Audit => StoredRecord::Audit(serde_json::from_str::<AuditRecord>(&payload)?),
                    RecordKind::Equity => StoredRecord::Equity {
                        model:    row.try_get("model")?,
                        symbol:   row.try_get("symbol")?,
                        snapshot: serde_json::from_str::<EquitySnapshot>(&payload)?,
                    },
                })
            })
            .collect()
    }
}

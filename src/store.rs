//! Run persistence: runs, fills, and equity curves
//!
//! `RunSink` is the narrow write interface the executor emits into. The
//! SQLite store keeps the original report schema (`runs`, `trades_fills`,
//! `equity_curve`); `NullSink` is used when no database is configured.
//!
//! Sink failures must never abort a run: the executor downgrades them to
//! warnings and keeps processing bars.

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::SimError;
use crate::types::FillRecord;

/// Destination for run metadata, fills, and equity samples.
pub trait RunSink: Send {
    /// Register a new run and return its id. Resets the fill sequence.
    fn new_run(&mut self, strategy: &str, params: &serde_json::Value) -> Result<String, SimError>;

    fn log_fill(&mut self, rec: &FillRecord) -> Result<(), SimError>;

    fn log_equity(&mut self, ts_ms: i64, equity: f64) -> Result<(), SimError>;
}

/// Sink that drops everything. Used by tests and database-less runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl RunSink for NullSink {
    fn new_run(&mut self, _strategy: &str, _params: &serde_json::Value) -> Result<String, SimError> {
        Ok(Uuid::new_v4().to_string())
    }

    fn log_fill(&mut self, _rec: &FillRecord) -> Result<(), SimError> {
        Ok(())
    }

    fn log_equity(&mut self, _ts_ms: i64, _equity: f64) -> Result<(), SimError> {
        Ok(())
    }
}

/// SQLite-backed store. The engine side owns this single write handle;
/// auxiliary writers reuse it rather than opening their own.
pub struct SqliteStore {
    con: Connection,
    run_id: Option<String>,
    seq: i64,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, SimError> {
        let con = Connection::open(path)
            .map_err(|e| SimError::SinkWriteFailed(format!("open {path}: {e}")))?;
        let mut store = Self {
            con,
            run_id: None,
            seq: 0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, SimError> {
        let con = Connection::open_in_memory()
            .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;
        let mut store = Self {
            con,
            run_id: None,
            seq: 0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Wrap an existing connection (shared-handle construction).
    pub fn from_connection(con: Connection) -> Result<Self, SimError> {
        let mut store = Self {
            con,
            run_id: None,
            seq: 0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.con
    }

    fn ensure_schema(&mut self) -> Result<(), SimError> {
        self.con
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    run_id      TEXT PRIMARY KEY,
                    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                    strategy    TEXT,
                    params_json TEXT
                );
                CREATE TABLE IF NOT EXISTS trades_fills (
                    run_id       TEXT NOT NULL,
                    seq          INTEGER NOT NULL,
                    ts           INTEGER NOT NULL,
                    symbol       TEXT NOT NULL,
                    side         TEXT NOT NULL,
                    price        REAL NOT NULL,
                    qty          REAL NOT NULL,
                    realized_pnl REAL NOT NULL,
                    fee          REAL NOT NULL,
                    is_maker     INTEGER NOT NULL,
                    PRIMARY KEY (run_id, seq)
                );
                CREATE TABLE IF NOT EXISTS equity_curve (
                    run_id TEXT NOT NULL,
                    ts     INTEGER NOT NULL,
                    equity REAL NOT NULL
                );",
            )
            .map_err(|e| Self::classify(e))
    }

    /// Read-only handles surface as a configuration conflict rather than a
    /// plain write failure, so callers can give an actionable message.
    fn classify(e: rusqlite::Error) -> SimError {
        let msg = e.to_string();
        if msg.contains("readonly") || msg.contains("read-only") {
            SimError::ConfigurationConflict(format!(
                "store opened read-only; reopen writable to persist runs: {msg}"
            ))
        } else {
            SimError::SinkWriteFailed(msg)
        }
    }
}

impl RunSink for SqliteStore {
    fn new_run(&mut self, strategy: &str, params: &serde_json::Value) -> Result<String, SimError> {
        let rid = Uuid::new_v4().to_string();
        self.con
            .execute(
                "INSERT INTO runs (run_id, strategy, params_json) VALUES (?1, ?2, ?3)",
                params![rid, strategy, params.to_string()],
            )
            .map_err(Self::classify)?;
        self.run_id = Some(rid.clone());
        self.seq = 0;
        Ok(rid)
    }

    fn log_fill(&mut self, rec: &FillRecord) -> Result<(), SimError> {
        let Some(run_id) = self.run_id.as_ref() else {
            return Ok(());
        };
        self.seq += 1;
        self.con
            .execute(
                "INSERT INTO trades_fills
                    (run_id, seq, ts, symbol, side, price, qty, realized_pnl, fee, is_maker)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    self.seq,
                    rec.ts_ms,
                    rec.symbol.as_str(),
                    rec.side.as_str(),
                    rec.price,
                    rec.qty,
                    rec.realized_pnl,
                    rec.fee,
                    rec.is_maker as i64,
                ],
            )
            .map_err(Self::classify)?;
        Ok(())
    }

    fn log_equity(&mut self, ts_ms: i64, equity: f64) -> Result<(), SimError> {
        let Some(run_id) = self.run_id.as_ref() else {
            return Ok(());
        };
        self.con
            .execute(
                "INSERT INTO equity_curve (run_id, ts, equity) VALUES (?1, ?2, ?3)",
                params![run_id, ts_ms, equity],
            )
            .map_err(Self::classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol};

    fn rec(ts: i64, price: f64) -> FillRecord {
        FillRecord {
            ts_ms: ts,
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            price,
            qty: 1.0,
            realized_pnl: 0.0,
            fee: 0.1,
            is_maker: false,
        }
    }

    #[test]
    fn fills_are_sequenced_per_run() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .new_run("test", &serde_json::json!({"k": 1}))
            .unwrap();
        store.log_fill(&rec(1, 100.0)).unwrap();
        store.log_fill(&rec(2, 101.0)).unwrap();
        store.log_equity(2, 10_000.0).unwrap();

        let count: i64 = store
            .con
            .query_row(
                "SELECT COUNT(*) FROM trades_fills WHERE run_id = ?1",
                params![run],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let max_seq: i64 = store
            .con
            .query_row(
                "SELECT MAX(seq) FROM trades_fills WHERE run_id = ?1",
                params![run],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(max_seq, 2);
    }

    #[test]
    fn logging_without_a_run_is_a_noop() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.log_fill(&rec(1, 100.0)).unwrap();
        let count: i64 = store
            .con
            .query_row("SELECT COUNT(*) FROM trades_fills", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn new_run_resets_sequence() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.new_run("a", &serde_json::json!({})).unwrap();
        store.log_fill(&rec(1, 100.0)).unwrap();
        let run_b = store.new_run("b", &serde_json::json!({})).unwrap();
        store.log_fill(&rec(2, 101.0)).unwrap();

        let seq: i64 = store
            .con
            .query_row(
                "SELECT seq FROM trades_fills WHERE run_id = ?1",
                params![run_b],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(seq, 1);
    }
}

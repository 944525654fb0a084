//! Market data sources
//!
//! All sources expose the same two queries: klines (OHLCV bars) and funding
//! rate history, both sorted ascending and inclusive on both bounds, and
//! deterministic for identical arguments.
//!
//! Three implementations: local CSV files, a SQLite database, and the
//! Binance USDⓈ-M futures REST API.

use std::path::{Path, PathBuf};

use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::SimError;
use crate::store::SqliteStore;
use crate::types::{Bar, FundingEvent, Symbol};

/// Data source selector for the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceKind {
    #[default]
    Api,
    Files,
    Sqlite,
}

impl std::str::FromStr for SourceKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(SourceKind::Api),
            "files" => Ok(SourceKind::Files),
            "sqlite" => Ok(SourceKind::Sqlite),
            other => Err(SimError::InvalidParam(format!(
                "unknown data source: {other} (expected api|files|sqlite)"
            ))),
        }
    }
}

/// Read interface consumed by the replayer and the batch runner.
pub trait DataSource: Send {
    fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, SimError>;

    fn get_funding_rates(
        &self,
        symbol: &Symbol,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<FundingEvent>, SimError>;
}

fn in_range(ts: i64, start: Option<i64>, end: Option<i64>) -> bool {
    start.map_or(true, |s| ts >= s) && end.map_or(true, |e| ts <= e)
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Pre-loaded bars and funding events. Used by tests and by gateway setups
/// that inject synthetic data.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub bars: Vec<Bar>,
    pub funding: Vec<FundingEvent>,
}

impl DataSource for MemorySource {
    fn get_klines(
        &self,
        symbol: &Symbol,
        _interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, SimError> {
        let mut out: Vec<Bar> = self
            .bars
            .iter()
            .filter(|b| b.symbol == *symbol && in_range(b.open_time, start_ms, end_ms))
            .cloned()
            .collect();
        out.sort_by_key(|b| b.open_time);
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }

    fn get_funding_rates(
        &self,
        _symbol: &Symbol,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<FundingEvent>, SimError> {
        let mut out: Vec<FundingEvent> = self
            .funding
            .iter()
            .filter(|f| in_range(f.funding_time, start_ms, end_ms))
            .copied()
            .collect();
        out.sort_by_key(|f| f.funding_time);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// CSV files
// ---------------------------------------------------------------------------

/// Local CSV layout:
/// - klines:  `{base}/klines/{SYMBOL}_{interval}.csv` with columns
///   `open_time,open,high,low,close,volume[,close_time,...]`
/// - funding: `{base}/funding/{SYMBOL}.csv` with columns
///   `fundingTime,fundingRate`
///
/// A leading header row is detected and skipped; extra columns are ignored.
pub struct CsvDirSource {
    base_dir: PathBuf,
}

impl CsvDirSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn read_rows(path: &Path) -> Result<Vec<csv::StringRecord>, SimError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| SimError::DataUnavailable(format!("{}: {e}", path.display())))?;
        let mut rows = Vec::new();
        for rec in reader.records() {
            let rec = rec.map_err(|e| SimError::DataUnavailable(format!("{}: {e}", path.display())))?;
            if rec.is_empty() {
                continue;
            }
            rows.push(rec);
        }
        Ok(rows)
    }

    fn is_numeric(field: &str) -> bool {
        field.trim().parse::<f64>().is_ok()
    }
}

impl DataSource for CsvDirSource {
    fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, SimError> {
        let path = self
            .base_dir
            .join("klines")
            .join(format!("{}_{}.csv", symbol.as_str(), interval));
        if !path.exists() {
            return Err(SimError::DataUnavailable(format!(
                "klines file not found: {}",
                path.display()
            )));
        }

        let rows = Self::read_rows(&path)?;
        let mut out = Vec::new();
        for (idx, rec) in rows.iter().enumerate() {
            let first = rec.get(0).unwrap_or("");
            if idx == 0 && !Self::is_numeric(first) {
                continue; // header
            }
            if rec.len() < 6 {
                warn!(row = idx + 1, file = %path.display(), "short kline row skipped");
                continue;
            }
            let parse_f = |i: usize| -> Result<f64, SimError> {
                rec.get(i)
                    .unwrap_or("")
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| {
                        SimError::DataUnavailable(format!(
                            "{} row {}: column {i}: {e}",
                            path.display(),
                            idx + 1
                        ))
                    })
            };
            let open_time = parse_f(0)? as i64;
            // Some exports omit close_time; derive it from the open when missing.
            let close_time = match rec.get(6) {
                Some(v) if !v.trim().is_empty() => v.trim().parse::<f64>().map_err(|e| {
                    SimError::DataUnavailable(format!("{} row {}: {e}", path.display(), idx + 1))
                })? as i64,
                _ => open_time,
            };
            out.push(Bar {
                open_time,
                open: parse_f(1)?,
                high: parse_f(2)?,
                low: parse_f(3)?,
                close: parse_f(4)?,
                volume: parse_f(5)?,
                close_time,
                symbol: symbol.clone(),
            });
        }

        out.retain(|b| in_range(b.open_time, start_ms, end_ms));
        out.sort_by_key(|b| b.open_time);
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }

    fn get_funding_rates(
        &self,
        symbol: &Symbol,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<FundingEvent>, SimError> {
        let path = self
            .base_dir
            .join("funding")
            .join(format!("{}.csv", symbol.as_str()));
        if !path.exists() {
            // Funding files are optional; a missing one means no funding.
            debug!(file = %path.display(), "no funding file, assuming none");
            return Ok(Vec::new());
        }

        let rows = Self::read_rows(&path)?;
        let mut out = Vec::new();
        for (idx, rec) in rows.iter().enumerate() {
            let first = rec.get(0).unwrap_or("");
            if idx == 0 && !Self::is_numeric(first) {
                continue;
            }
            if rec.len() < 2 {
                continue;
            }
            let t = rec
                .get(0)
                .unwrap_or("")
                .trim()
                .parse::<f64>()
                .map_err(|e| {
                    SimError::DataUnavailable(format!("{} row {}: {e}", path.display(), idx + 1))
                })? as i64;
            let rate = rec
                .get(1)
                .unwrap_or("")
                .trim()
                .parse::<f64>()
                .map_err(|e| {
                    SimError::DataUnavailable(format!("{} row {}: {e}", path.display(), idx + 1))
                })?;
            out.push(FundingEvent {
                funding_time: t,
                funding_rate: rate,
            });
        }

        out.retain(|f| in_range(f.funding_time, start_ms, end_ms));
        out.sort_by_key(|f| f.funding_time);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed source over `klines` and `funding` tables.
///
/// Opened writable by default so the batch runner can hand the same
/// connection to the run store afterwards (`into_store`); a read-only
/// source refuses that conversion with `ConfigurationConflict`.
pub struct SqliteSource {
    con: Connection,
    read_only: bool,
}

impl SqliteSource {
    pub fn open(path: &str, read_only: bool) -> Result<Self, SimError> {
        let con = if read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        } else {
            Connection::open(path)
        }
        .map_err(|e| SimError::DataUnavailable(format!("open {path}: {e}")))?;

        let src = Self { con, read_only };
        if !read_only {
            src.ensure_data_schema()?;
        }
        Ok(src)
    }

    pub fn open_in_memory() -> Result<Self, SimError> {
        let con = Connection::open_in_memory()
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        let src = Self {
            con,
            read_only: false,
        };
        src.ensure_data_schema()?;
        Ok(src)
    }

    fn ensure_data_schema(&self) -> Result<(), SimError> {
        self.con
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS klines (
                    symbol     TEXT NOT NULL,
                    interval   TEXT NOT NULL,
                    open_time  INTEGER NOT NULL,
                    open       REAL NOT NULL,
                    high       REAL NOT NULL,
                    low        REAL NOT NULL,
                    close      REAL NOT NULL,
                    volume     REAL NOT NULL,
                    close_time INTEGER NOT NULL,
                    PRIMARY KEY (symbol, interval, open_time)
                );
                CREATE TABLE IF NOT EXISTS funding (
                    symbol       TEXT NOT NULL,
                    funding_time INTEGER NOT NULL,
                    funding_rate REAL NOT NULL,
                    PRIMARY KEY (symbol, funding_time)
                );",
            )
            .map_err(|e| SimError::DataUnavailable(e.to_string()))
    }

    /// Upsert a batch of bars (used by the download command).
    pub fn ingest_klines(&self, interval: &str, bars: &[Bar]) -> Result<usize, SimError> {
        if self.read_only {
            return Err(SimError::ConfigurationConflict(
                "source opened read-only; cannot ingest klines".into(),
            ));
        }
        let mut stmt = self
            .con
            .prepare(
                "INSERT OR REPLACE INTO klines
                    (symbol, interval, open_time, open, high, low, close, volume, close_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        for b in bars {
            stmt.execute(rusqlite::params![
                b.symbol.as_str(),
                interval,
                b.open_time,
                b.open,
                b.high,
                b.low,
                b.close,
                b.volume,
                b.close_time,
            ])
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        }
        Ok(bars.len())
    }

    /// Upsert a batch of funding events (used by the download command).
    pub fn ingest_funding(
        &self,
        symbol: &Symbol,
        events: &[FundingEvent],
    ) -> Result<usize, SimError> {
        if self.read_only {
            return Err(SimError::ConfigurationConflict(
                "source opened read-only; cannot ingest funding".into(),
            ));
        }
        let mut stmt = self
            .con
            .prepare(
                "INSERT OR REPLACE INTO funding (symbol, funding_time, funding_rate)
                 VALUES (?1, ?2, ?3)",
            )
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        for f in events {
            stmt.execute(rusqlite::params![
                symbol.as_str(),
                f.funding_time,
                f.funding_rate
            ])
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        }
        Ok(events.len())
    }

    /// Convert this source into a run store, reusing the same connection.
    ///
    /// This is the single-write-handle rule: the store that records the run
    /// is the same handle that served the data, never a second connection
    /// with different options.
    pub fn into_store(self) -> Result<SqliteStore, SimError> {
        if self.read_only {
            return Err(SimError::ConfigurationConflict(
                "source opened read-only; reopen writable to record runs".into(),
            ));
        }
        SqliteStore::from_connection(self.con)
    }
}

impl DataSource for SqliteSource {
    fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, SimError> {
        let mut sql = String::from(
            "SELECT open_time, open, high, low, close, volume, close_time
             FROM klines WHERE symbol = ?1 AND interval = ?2",
        );
        let mut args: Vec<rusqlite::types::Value> = vec![
            symbol.as_str().to_string().into(),
            interval.to_string().into(),
        ];
        if let Some(s) = start_ms {
            sql.push_str(&format!(" AND open_time >= ?{}", args.len() + 1));
            args.push(s.into());
        }
        if let Some(e) = end_ms {
            sql.push_str(&format!(" AND open_time <= ?{}", args.len() + 1));
            args.push(e.into());
        }
        sql.push_str(" ORDER BY open_time ASC");
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
            args.push((n as i64).into());
        }

        let mut stmt = self
            .con
            .prepare(&sql)
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(Bar {
                    open_time: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    close_time: row.get(6)?,
                    symbol: symbol.clone(),
                })
            })
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| SimError::DataUnavailable(e.to_string()))?);
        }
        Ok(out)
    }

    fn get_funding_rates(
        &self,
        symbol: &Symbol,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<FundingEvent>, SimError> {
        let mut sql = String::from(
            "SELECT funding_time, funding_rate FROM funding WHERE symbol = ?1",
        );
        let mut args: Vec<rusqlite::types::Value> =
            vec![symbol.as_str().to_string().into()];
        if let Some(s) = start_ms {
            sql.push_str(&format!(" AND funding_time >= ?{}", args.len() + 1));
            args.push(s.into());
        }
        if let Some(e) = end_ms {
            sql.push_str(&format!(" AND funding_time <= ?{}", args.len() + 1));
            args.push(e.into());
        }
        sql.push_str(" ORDER BY funding_time ASC");

        let mut stmt = self
            .con
            .prepare(&sql)
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(FundingEvent {
                    funding_time: row.get(0)?,
                    funding_rate: row.get(1)?,
                })
            })
            .map_err(|e| SimError::DataUnavailable(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| SimError::DataUnavailable(e.to_string()))?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Binance REST
// ---------------------------------------------------------------------------

const BINANCE_FAPI_BASE: &str = "https://fapi.binance.com";
const KLINES_PAGE: usize = 1500;
const FUNDING_PAGE: usize = 1000;

/// Binance USDⓈ-M futures REST source (public market data, no signing).
pub struct BinanceRestSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl BinanceRestSource {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_FAPI_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<serde_json::Value, SimError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .map_err(|e| SimError::DataUnavailable(format!("GET {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(SimError::DataUnavailable(format!(
                "GET {path}: status {}",
                resp.status()
            )));
        }
        resp.json()
            .map_err(|e| SimError::DataUnavailable(format!("GET {path}: {e}")))
    }

    fn value_as_f64(v: &serde_json::Value) -> Option<f64> {
        match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl Default for BinanceRestSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSource for BinanceRestSource {
    fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>, SimError> {
        let mut out: Vec<Bar> = Vec::new();
        let mut cursor = start_ms;

        loop {
            let mut query: Vec<(String, String)> = vec![
                ("symbol".into(), symbol.as_str().to_string()),
                ("interval".into(), interval.to_string()),
                ("limit".into(), KLINES_PAGE.to_string()),
            ];
            if let Some(s) = cursor {
                query.push(("startTime".into(), s.to_string()));
            }
            if let Some(e) = end_ms {
                query.push(("endTime".into(), e.to_string()));
            }

            let page = self.get_json("/fapi/v1/klines", &query)?;
            let rows = page
                .as_array()
                .ok_or_else(|| SimError::DataUnavailable("klines: expected array".into()))?;
            if rows.is_empty() {
                break;
            }

            let page_len = rows.len();
            for row in rows {
                let rec = row
                    .as_array()
                    .ok_or_else(|| SimError::DataUnavailable("klines: malformed row".into()))?;
                if rec.len() < 7 {
                    continue;
                }
                let open_time = rec[0].as_i64().ok_or_else(|| {
                    SimError::DataUnavailable("klines: bad open_time".into())
                })?;
                let close_time = rec[6].as_i64().ok_or_else(|| {
                    SimError::DataUnavailable("klines: bad close_time".into())
                })?;
                let f = |i: usize| {
                    Self::value_as_f64(&rec[i]).ok_or_else(|| {
                        SimError::DataUnavailable(format!("klines: bad field {i}"))
                    })
                };
                out.push(Bar {
                    open_time,
                    open: f(1)?,
                    high: f(2)?,
                    low: f(3)?,
                    close: f(4)?,
                    volume: f(5)?,
                    close_time,
                    symbol: symbol.clone(),
                });
            }

            debug!(fetched = out.len(), "klines page");
            if page_len < KLINES_PAGE {
                break;
            }
            if let Some(n) = limit {
                if out.len() >= n {
                    break;
                }
            }
            // next page starts just past the last open we saw
            cursor = out.last().map(|b| b.open_time + 1);
            if let (Some(c), Some(e)) = (cursor, end_ms) {
                if c > e {
                    break;
                }
            }
        }

        out.retain(|b| in_range(b.open_time, start_ms, end_ms));
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }

    fn get_funding_rates(
        &self,
        symbol: &Symbol,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<FundingEvent>, SimError> {
        let mut out: Vec<FundingEvent> = Vec::new();
        let mut cursor = start_ms;

        loop {
            let mut query: Vec<(String, String)> = vec![
                ("symbol".into(), symbol.as_str().to_string()),
                ("limit".into(), FUNDING_PAGE.to_string()),
            ];
            if let Some(s) = cursor {
                query.push(("startTime".into(), s.to_string()));
            }
            if let Some(e) = end_ms {
                query.push(("endTime".into(), e.to_string()));
            }

            let page = self.get_json("/fapi/v1/fundingRate", &query)?;
            let rows = page
                .as_array()
                .ok_or_else(|| SimError::DataUnavailable("fundingRate: expected array".into()))?;
            if rows.is_empty() {
                break;
            }

            let page_len = rows.len();
            for row in rows {
                let t = row
                    .get("fundingTime")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| SimError::DataUnavailable("fundingRate: bad time".into()))?;
                let rate = row
                    .get("fundingRate")
                    .and_then(Self::value_as_f64)
                    .ok_or_else(|| SimError::DataUnavailable("fundingRate: bad rate".into()))?;
                out.push(FundingEvent {
                    funding_time: t,
                    funding_rate: rate,
                });
            }

            if page_len < FUNDING_PAGE {
                break;
            }
            cursor = out.last().map(|f| f.funding_time + 1);
            if let (Some(c), Some(e)) = (cursor, end_ms) {
                if c > e {
                    break;
                }
            }
        }

        out.retain(|f| in_range(f.funding_time, start_ms, end_ms));
        out.sort_by_key(|f| f.funding_time);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(sym: &str, t: i64) -> Bar {
        Bar {
            open_time: t,
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 105.0,
            volume: 1.0,
            close_time: t + 59_999,
            symbol: Symbol::new(sym),
        }
    }

    #[test]
    fn sqlite_roundtrip_klines_and_funding() {
        let src = SqliteSource::open_in_memory().unwrap();
        let sym = Symbol::new("BTCUSDT");
        let bars = vec![bar("BTCUSDT", 0), bar("BTCUSDT", 60_000), bar("BTCUSDT", 120_000)];
        src.ingest_klines("1m", &bars).unwrap();
        src.ingest_funding(
            &sym,
            &[
                FundingEvent {
                    funding_time: 50_000,
                    funding_rate: 0.0001,
                },
                FundingEvent {
                    funding_time: 100_000,
                    funding_rate: -0.0002,
                },
            ],
        )
        .unwrap();

        let got = src
            .get_klines(&sym, "1m", Some(60_000), Some(120_000), None)
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].open_time, 60_000);

        let fr = src.get_funding_rates(&sym, None, Some(60_000)).unwrap();
        assert_eq!(fr.len(), 1);
        assert_eq!(fr[0].funding_time, 50_000);
    }

    #[test]
    fn sqlite_limit_applies_after_ordering() {
        let src = SqliteSource::open_in_memory().unwrap();
        let sym = Symbol::new("BTCUSDT");
        let bars: Vec<Bar> = (0..5).map(|i| bar("BTCUSDT", i * 60_000)).collect();
        src.ingest_klines("1m", &bars).unwrap();

        let got = src.get_klines(&sym, "1m", None, None, Some(2)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].open_time, 0);
        assert_eq!(got[1].open_time, 60_000);
    }

    #[test]
    fn memory_source_filters_by_symbol_and_range() {
        let src = MemorySource {
            bars: vec![bar("BTCUSDT", 0), bar("ETHUSDT", 0), bar("BTCUSDT", 60_000)],
            funding: Vec::new(),
        };
        let got = src
            .get_klines(&Symbol::new("BTCUSDT"), "1m", Some(1), None, None)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].open_time, 60_000);
    }
}

//! Shared configuration types and time parsing

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::SourceKind;
use crate::error::SimError;

/// Parse a user-supplied instant into epoch milliseconds (UTC).
///
/// Accepts:
/// - raw epoch digits (seconds or milliseconds, disambiguated by magnitude)
/// - ISO 8601 date-times with or without a trailing `Z` / space separator
/// - plain `YYYY-MM-DD` dates (midnight UTC)
pub fn parse_time_ms(s: &str) -> Result<i64, SimError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SimError::InvalidParam("empty timestamp".into()));
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        let v: i64 = s
            .parse()
            .map_err(|e| SimError::InvalidParam(format!("timestamp {s}: {e}")))?;
        return Ok(if v > 10_000_000_000 { v } else { v * 1000 });
    }

    let cleaned = s.trim_end_matches('Z').replace(' ', "T");
    if let Ok(ndt) = NaiveDateTime::parse_from_str(&cleaned, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt).timestamp_millis());
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let ndt = nd
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| SimError::InvalidParam(format!("invalid date: {s}")))?;
        return Ok(Utc.from_utc_datetime(&ndt).timestamp_millis());
    }

    Err(SimError::InvalidParam(format!(
        "unrecognized timestamp: {s} (expected YYYY-MM-DD, ISO datetime, or epoch)"
    )))
}

/// Current wall-clock epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Batch backtest configuration (CLI surface of the offline runner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub interval: String,
    /// Start / end instants in any `parse_time_ms` format.
    pub start: String,
    pub end: String,
    #[serde(skip)]
    pub data_source: SourceKind,
    pub sqlite_path: String,
    pub csv_dir: String,
    pub fill_model: String,
    pub seed: u64,
    pub maker_bps: f64,
    pub taker_bps: f64,
    pub slippage_bps: f64,
    pub starting_balance: f64,
    pub strategy: Option<String>,
    pub strategy_params: Option<Value>,
    pub reports_dir: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            interval: "1h".into(),
            start: String::new(),
            end: String::new(),
            data_source: SourceKind::Api,
            sqlite_path: "data/exsim.sqlite".into(),
            csv_dir: "data/files".into(),
            fill_model: "ohlc_up".into(),
            seed: 42,
            maker_bps: 2.0,
            taker_bps: 4.0,
            slippage_bps: 0.0,
            starting_balance: 100_000.0,
            strategy: None,
            strategy_params: None,
            reports_dir: "reports".into(),
        }
    }
}

/// Online gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub db_path: String,
    pub symbol: String,
    pub interval: String,
    pub start_ts: i64,
    pub end_ts: i64,
    /// Replay speed in bars per second.
    pub bars_per_sec: f64,
    pub maker_bps: f64,
    pub taker_bps: f64,
    pub slippage_bps: f64,
    pub starting_balance: f64,
    pub fill_model: String,
    pub seed: u64,
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: "data/exsim.sqlite".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            start_ts: 0,
            end_ts: 0,
            bars_per_sec: 10.0,
            maker_bps: 2.0,
            taker_bps: 4.0,
            slippage_bps: 0.0,
            starting_balance: 100_000.0,
            fill_model: "ohlc_up".into(),
            seed: 42,
            host: "0.0.0.0".into(),
            port: 9001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_dates_to_midnight_utc() {
        assert_eq!(parse_time_ms("2024-07-01").unwrap(), 1_719_792_000_000);
    }

    #[test]
    fn parses_iso_with_and_without_z() {
        let a = parse_time_ms("2024-07-01T12:30:00Z").unwrap();
        let b = parse_time_ms("2024-07-01T12:30:00").unwrap();
        let c = parse_time_ms("2024-07-01 12:30:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a, 1_719_837_000_000);
    }

    #[test]
    fn parses_epoch_seconds_and_millis() {
        assert_eq!(parse_time_ms("1719792000").unwrap(), 1_719_792_000_000);
        assert_eq!(parse_time_ms("1719792000000").unwrap(), 1_719_792_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_time_ms("not-a-date").is_err());
        assert!(parse_time_ms("").is_err());
    }
}

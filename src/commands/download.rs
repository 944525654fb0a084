//! `exsim download` — fetch klines and funding history into SQLite

use anyhow::{Context, Result};
use tracing::info;

use exsim::config::parse_time_ms;
use exsim::data::{BinanceRestSource, DataSource, SqliteSource};
use exsim::types::Symbol;

pub fn run(
    symbols: String,
    intervals: String,
    start: String,
    end: String,
    sqlite_path: String,
) -> Result<()> {
    let start_ts = parse_time_ms(&start).context("invalid --start")?;
    let end_ts = parse_time_ms(&end).context("invalid --end")?;

    let api = BinanceRestSource::new();
    let db = SqliteSource::open(&sqlite_path, false)
        .with_context(|| format!("open {sqlite_path}"))?;

    for raw_symbol in symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let symbol = Symbol::new(raw_symbol);

        for interval in intervals.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let bars = api
                .get_klines(&symbol, interval, Some(start_ts), Some(end_ts), None)
                .with_context(|| format!("fetch klines {symbol} {interval}"))?;
            let n = db
                .ingest_klines(interval, &bars)
                .with_context(|| format!("ingest klines {symbol} {interval}"))?;
            info!(symbol = %symbol, interval, bars = n, "klines ingested");
            println!("{symbol} {interval}: {n} bars");
        }

        let funding = api
            .get_funding_rates(&symbol, Some(start_ts), Some(end_ts))
            .with_context(|| format!("fetch funding {symbol}"))?;
        let n = db
            .ingest_funding(&symbol, &funding)
            .with_context(|| format!("ingest funding {symbol}"))?;
        info!(symbol = %symbol, events = n, "funding ingested");
        println!("{symbol} funding: {n} events");
    }

    Ok(())
}

//! Batch backtest runner
//!
//! Streams a date range of bars through the executor, invoking an optional
//! strategy on each bar boundary, then writes three artifacts: per-fill CSV,
//! per-bar equity CSV, and a JSON summary. When the data came from SQLite
//! the run is persisted through the same connection that served the data.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::DateTime;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{parse_time_ms, BacktestConfig};
use crate::data::{BinanceRestSource, CsvDirSource, DataSource, SourceKind, SqliteSource};
use crate::error::SimError;
use crate::executor::build_executor;
use crate::fill::build_fill_model;
use crate::store::{NullSink, RunSink};
use crate::strategy::create_strategy;
use crate::types::{EquityPoint, FillRecord, Side, Symbol};

/// Headline statistics of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    pub max_drawdown: f64,
    pub average_weekly_return: f64,
    pub average_monthly_return: f64,
    pub starting_balance: f64,
    pub ending_equity: f64,
    pub symbol: String,
    pub interval: String,
    pub start: String,
    pub end: String,
    pub data_source: String,
    pub fill_model: String,
    pub maker_bps: f64,
    pub taker_bps: f64,
    pub slippage_bps: f64,
    pub seed: u64,
    pub strategy: Option<String>,
    pub strategy_params: Value,
    pub run_id: Option<String>,
}

#[derive(Debug)]
pub struct BacktestReport {
    pub summary: Summary,
    pub trades: Vec<FillRecord>,
    pub equity: Vec<EquityPoint>,
}

/// Run a batch backtest end to end and write report artifacts.
pub fn run_backtest(cfg: &BacktestConfig) -> Result<BacktestReport, SimError> {
    let start_ts = parse_time_ms(&cfg.start)?;
    let end_ts = parse_time_ms(&cfg.end)?;
    if end_ts < start_ts {
        return Err(SimError::InvalidParam(format!(
            "end {} precedes start {}",
            cfg.end, cfg.start
        )));
    }

    let symbol = Symbol::new(cfg.symbol.clone());

    // --- Data: load everything up front, then hand the handle over ---------
    let (bars, funding, sink): (_, _, Box<dyn RunSink>) = match cfg.data_source {
        SourceKind::Files => {
            let src = CsvDirSource::new(cfg.csv_dir.clone());
            let bars = src.get_klines(&symbol, &cfg.interval, Some(start_ts), Some(end_ts), None)?;
            let funding = src.get_funding_rates(&symbol, Some(start_ts), Some(end_ts))?;
            (bars, funding, Box::new(NullSink))
        }
        SourceKind::Api => {
            let src = BinanceRestSource::new();
            let bars = src.get_klines(&symbol, &cfg.interval, Some(start_ts), Some(end_ts), None)?;
            let funding = src.get_funding_rates(&symbol, Some(start_ts), Some(end_ts))?;
            (bars, funding, Box::new(NullSink))
        }
        SourceKind::Sqlite => {
            let src = SqliteSource::open(&cfg.sqlite_path, false)?;
            let bars = src.get_klines(&symbol, &cfg.interval, Some(start_ts), Some(end_ts), None)?;
            let funding = src.get_funding_rates(&symbol, Some(start_ts), Some(end_ts))?;
            // Same connection becomes the run store: one write handle.
            (bars, funding, Box::new(src.into_store()?))
        }
    };

    if bars.is_empty() {
        return Err(SimError::DataUnavailable(format!(
            "no bars for {} {} in [{}, {}]",
            symbol, cfg.interval, cfg.start, cfg.end
        )));
    }
    info!(bars = bars.len(), funding = funding.len(), "data loaded");

    // --- Engine ------------------------------------------------------------
    let fill_model = build_fill_model(&cfg.fill_model, cfg.seed, cfg.slippage_bps)?;
    let mut engine = build_executor(
        cfg.starting_balance,
        cfg.maker_bps,
        cfg.taker_bps,
        fill_model,
        cfg.slippage_bps,
        sink,
    );
    engine.set_funding_events(funding);

    let strategy_label = cfg
        .strategy
        .clone()
        .unwrap_or_else(|| "manual".to_string());
    let run_params = json!({
        "symbol": symbol.as_str(),
        "interval": cfg.interval,
        "start_ts": start_ts,
        "end_ts": end_ts,
        "maker_bps": cfg.maker_bps,
        "taker_bps": cfg.taker_bps,
        "slippage_bps": cfg.slippage_bps,
        "starting_balance": cfg.starting_balance,
        "fill_model": cfg.fill_model,
        "seed": cfg.seed,
        "strategy_params": cfg.strategy_params.clone().unwrap_or(Value::Null),
    });
    let run_id = match engine.new_run(&format!("backtest/{strategy_label}"), run_params) {
        Ok(rid) => Some(rid),
        Err(e) => {
            warn!(error = %e, "run not persisted");
            None
        }
    };

    let mut strategy = match &cfg.strategy {
        Some(name) => Some(create_strategy(
            name,
            symbol.clone(),
            cfg.strategy_params.as_ref().unwrap_or(&Value::Null),
        )?),
        None => None,
    };

    // --- Main loop ---------------------------------------------------------
    if let Some(strat) = strategy.as_mut() {
        strat.on_start(&mut engine)?;
    }

    for bar in &bars {
        // The strategy sees the open mark before the matching step, so its
        // MARKET orders execute at this bar's open.
        engine.mark_price(&symbol, bar.open);
        if let Some(strat) = strategy.as_mut() {
            strat.on_bar(&mut engine, bar)?;
        }
        engine.on_bar(bar)?;
    }

    if let Some(strat) = strategy.as_mut() {
        strat.on_finish(&mut engine)?;
    }

    // --- Reports -----------------------------------------------------------
    let trades = engine.trade_log().to_vec();
    let equity = engine.equity_log().to_vec();

    let summary = summarize(cfg, &trades, &equity, start_ts, end_ts, run_id);
    write_reports(&cfg.reports_dir, &trades, &equity, &summary)?;

    info!(
        trades = summary.trades,
        win_rate = summary.win_rate,
        ending_equity = summary.ending_equity,
        "backtest finished"
    );

    Ok(BacktestReport {
        summary,
        trades,
        equity,
    })
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

fn sign(x: f64) -> f64 {
    if x > 1e-9 {
        1.0
    } else if x < -1e-9 {
        -1.0
    } else {
        0.0
    }
}

/// Reconstruct closed-trade PnLs from the fill log.
///
/// A trade closes when the running position returns to flat. A flip counts
/// as closing the old trade at the pre-flip cumulative PnL and immediately
/// opening a new one.
fn closed_trade_pnls(trades: &[FillRecord]) -> Vec<f64> {
    let mut closed = Vec::new();
    let mut pos_qty = 0.0f64;
    let mut trade_active = false;
    let mut current_pnl = 0.0f64;

    for tr in trades {
        let prev_sign = sign(pos_qty);
        pos_qty += match tr.side {
            Side::Buy => tr.qty,
            Side::Sell => -tr.qty,
        };
        let new_sign = sign(pos_qty);

        if !trade_active && new_sign != 0.0 {
            trade_active = true;
            current_pnl = 0.0;
        }
        if trade_active {
            current_pnl += tr.realized_pnl;
        }

        if trade_active && new_sign == 0.0 {
            trade_active = false;
            closed.push(current_pnl);
            current_pnl = 0.0;
        } else if trade_active && prev_sign != 0.0 && new_sign != 0.0 && prev_sign != new_sign {
            closed.push(current_pnl);
            current_pnl = 0.0;
        }
    }
    closed
}

fn summarize(
    cfg: &BacktestConfig,
    trades: &[FillRecord],
    equity: &[EquityPoint],
    start_ts: i64,
    end_ts: i64,
    run_id: Option<String>,
) -> Summary {
    let closed = closed_trade_pnls(trades);
    let wins = closed.iter().filter(|p| **p > 1e-9).count();
    let num_trades = closed.len();
    let win_rate = if num_trades > 0 {
        wins as f64 / num_trades as f64 * 100.0
    } else {
        0.0
    };

    let gross_profit: f64 = closed.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = closed.iter().filter(|p| **p < 0.0).sum();
    let profit_factor = if gross_loss != 0.0 {
        gross_profit / gross_loss.abs()
    } else {
        f64::INFINITY
    };

    // Daily equity closes (UTC) drive the return distribution.
    let mut daily: BTreeMap<chrono::NaiveDate, f64> = BTreeMap::new();
    for pt in equity {
        if let Some(dt) = DateTime::from_timestamp_millis(pt.ts_ms) {
            daily.insert(dt.date_naive(), pt.equity);
        }
    }
    let daily_eq: Vec<f64> = daily.into_values().collect();
    let daily_returns: Vec<f64> = daily_eq
        .windows(2)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();

    let (sharpe, sortino) = if daily_returns.len() >= 2 {
        let n = daily_returns.len() as f64;
        let mean = daily_returns.iter().sum::<f64>() / n;
        let variance = daily_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();

        // Population downside deviation over all returns.
        let down_var = daily_returns
            .iter()
            .filter(|r| **r < 0.0)
            .map(|r| r * r)
            .sum::<f64>()
            / n;
        let down_std = down_var.sqrt();

        let annual = 365.0f64.sqrt();
        (
            (std > 0.0).then(|| mean / std * annual),
            (down_std > 0.0).then(|| mean / down_std * annual),
        )
    } else {
        (None, None)
    };

    let mut peak = equity.first().map(|p| p.equity).unwrap_or(0.0);
    let mut max_dd = 0.0f64;
    for pt in equity {
        if pt.equity > peak {
            peak = pt.equity;
        }
        if peak > 0.0 {
            let dd = (peak - pt.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    let (avg_weekly, avg_monthly) = if end_ts <= start_ts || equity.is_empty() {
        (0.0, 0.0)
    } else {
        let total_days = (end_ts - start_ts) as f64 / 86_400_000.0;
        let first = equity.first().map(|p| p.equity).unwrap_or(0.0);
        let last = equity.last().map(|p| p.equity).unwrap_or(0.0);
        let total_return = if first > 0.0 { last / first - 1.0 } else { 0.0 };
        let daily_ret = if total_days > 0.0 {
            (1.0 + total_return).powf(1.0 / total_days) - 1.0
        } else {
            0.0
        };
        (
            ((1.0 + daily_ret).powi(7) - 1.0) * 100.0,
            ((1.0 + daily_ret).powi(30) - 1.0) * 100.0,
        )
    };

    Summary {
        trades: num_trades,
        win_rate,
        profit_factor,
        sharpe,
        sortino,
        max_drawdown: max_dd * 100.0,
        average_weekly_return: avg_weekly,
        average_monthly_return: avg_monthly,
        starting_balance: cfg.starting_balance,
        ending_equity: equity
            .last()
            .map(|p| p.equity)
            .unwrap_or(cfg.starting_balance),
        symbol: cfg.symbol.to_uppercase(),
        interval: cfg.interval.clone(),
        start: cfg.start.clone(),
        end: cfg.end.clone(),
        data_source: format!("{:?}", cfg.data_source).to_lowercase(),
        fill_model: cfg.fill_model.clone(),
        maker_bps: cfg.maker_bps,
        taker_bps: cfg.taker_bps,
        slippage_bps: cfg.slippage_bps,
        seed: cfg.seed,
        strategy: cfg.strategy.clone(),
        strategy_params: cfg.strategy_params.clone().unwrap_or(Value::Null),
        run_id,
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

fn write_reports(
    dir: &str,
    trades: &[FillRecord],
    equity: &[EquityPoint],
    summary: &Summary,
) -> Result<(), SimError> {
    let dir = Path::new(dir);
    fs::create_dir_all(dir)
        .map_err(|e| SimError::SinkWriteFailed(format!("create {}: {e}", dir.display())))?;

    let trades_path = dir.join("trades.csv");
    let mut w = csv::Writer::from_path(&trades_path)
        .map_err(|e| SimError::SinkWriteFailed(format!("{}: {e}", trades_path.display())))?;
    w.write_record([
        "timestamp",
        "symbol",
        "side",
        "price",
        "quantity",
        "realized_pnl",
        "fee",
        "is_maker",
    ])
    .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;
    for t in trades {
        w.write_record([
            t.ts_ms.to_string(),
            t.symbol.to_string(),
            t.side.to_string(),
            t.price.to_string(),
            t.qty.to_string(),
            t.realized_pnl.to_string(),
            t.fee.to_string(),
            t.is_maker.to_string(),
        ])
        .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;
    }
    w.flush()
        .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;

    let equity_path = dir.join("equity.csv");
    let mut w = csv::Writer::from_path(&equity_path)
        .map_err(|e| SimError::SinkWriteFailed(format!("{}: {e}", equity_path.display())))?;
    w.write_record(["timestamp", "equity"])
        .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;
    for pt in equity {
        w.write_record([pt.ts_ms.to_string(), pt.equity.to_string()])
            .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;
    }
    w.flush()
        .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;

    let summary_path = dir.join("summary.json");
    let file = fs::File::create(&summary_path)
        .map_err(|e| SimError::SinkWriteFailed(format!("{}: {e}", summary_path.display())))?;
    serde_json::to_writer_pretty(file, summary)
        .map_err(|e| SimError::SinkWriteFailed(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;
    use approx::assert_relative_eq;

    fn fill(side: Side, qty: f64, pnl: f64) -> FillRecord {
        FillRecord {
            ts_ms: 0,
            symbol: Symbol::new("TEST"),
            side,
            price: 100.0,
            qty,
            realized_pnl: pnl,
            fee: 0.0,
            is_maker: true,
        }
    }

    #[test]
    fn round_trip_counts_one_closed_trade() {
        let trades = vec![fill(Side::Buy, 1.0, 0.0), fill(Side::Sell, 1.0, 10.0)];
        let closed = closed_trade_pnls(&trades);
        assert_eq!(closed.len(), 1);
        assert_relative_eq!(closed[0], 10.0);
    }

    #[test]
    fn flip_closes_at_preflip_pnl_then_reopens() {
        // Long 1, then sell 2 (close + reverse), then buy 1 to flatten.
        let trades = vec![
            fill(Side::Buy, 1.0, 0.0),
            fill(Side::Sell, 2.0, 15.0),
            fill(Side::Buy, 1.0, -3.0),
        ];
        let closed = closed_trade_pnls(&trades);
        assert_eq!(closed.len(), 2);
        assert_relative_eq!(closed[0], 15.0);
        assert_relative_eq!(closed[1], -3.0);
    }

    #[test]
    fn partial_closes_stay_within_one_trade() {
        let trades = vec![
            fill(Side::Buy, 2.0, 0.0),
            fill(Side::Sell, 1.0, 5.0),
            fill(Side::Sell, 1.0, 7.0),
        ];
        let closed = closed_trade_pnls(&trades);
        assert_eq!(closed.len(), 1);
        assert_relative_eq!(closed[0], 12.0);
    }

    #[test]
    fn drawdown_is_peak_relative() {
        let cfg = BacktestConfig::default();
        let equity = vec![
            EquityPoint { ts_ms: 0, equity: 100.0 },
            EquityPoint { ts_ms: 86_400_000, equity: 120.0 },
            EquityPoint { ts_ms: 172_800_000, equity: 90.0 },
            EquityPoint { ts_ms: 259_200_000, equity: 110.0 },
        ];
        let s = summarize(&cfg, &[], &equity, 0, 259_200_000, None);
        assert_relative_eq!(s.max_drawdown, 25.0); // (120-90)/120
    }

    #[test]
    fn sharpe_needs_at_least_two_daily_returns() {
        let cfg = BacktestConfig::default();
        let equity = vec![
            EquityPoint { ts_ms: 0, equity: 100.0 },
            EquityPoint { ts_ms: 3_600_000, equity: 101.0 },
        ];
        // Both samples land on the same UTC date: no return series.
        let s = summarize(&cfg, &[], &equity, 0, 3_600_000, None);
        assert!(s.sharpe.is_none());
        assert!(s.sortino.is_none());
    }
}

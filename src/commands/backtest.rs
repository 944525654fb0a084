//! `exsim backtest` — offline batch runner

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use exsim::backtest::run_backtest;
use exsim::config::BacktestConfig;
use exsim::data::SourceKind;

#[allow(clippy::too_many_arguments)]
pub fn run(
    symbol: String,
    interval: String,
    start: String,
    end: String,
    data_source: String,
    sqlite_path: String,
    csv_dir: String,
    fill_model: String,
    seed: u64,
    maker_bps: f64,
    taker_bps: f64,
    slippage_bps: f64,
    starting_balance: f64,
    strategy: Option<String>,
    strategy_params: Option<String>,
    reports_dir: String,
) -> Result<()> {
    let data_source: SourceKind = data_source.parse().context("invalid --data-source")?;
    let strategy_params: Option<Value> = strategy_params
        .map(|raw| serde_json::from_str(&raw).context("invalid --strategy-params JSON"))
        .transpose()?;

    let cfg = BacktestConfig {
        symbol,
        interval,
        start,
        end,
        data_source,
        sqlite_path,
        csv_dir,
        fill_model,
        seed,
        maker_bps,
        taker_bps,
        slippage_bps,
        starting_balance,
        strategy,
        strategy_params,
        reports_dir,
    };

    let report = run_backtest(&cfg).context("backtest failed")?;
    let s = &report.summary;

    // Console summary mirrors the JSON artifact.
    println!(
        "Trades: {}, Win rate: {:.2}%, Profit Factor: {:.2}",
        s.trades, s.win_rate, s.profit_factor
    );
    let fmt_opt = |v: Option<f64>| v.map_or("n/a".to_string(), |x| format!("{x:.2}"));
    println!(
        "Sharpe: {}, Sortino: {}",
        fmt_opt(s.sharpe),
        fmt_opt(s.sortino)
    );
    println!(
        "Max Drawdown: {:.2}%, Avg Weekly Return: {:.2}%, Avg Monthly Return: {:.2}%",
        s.max_drawdown, s.average_weekly_return, s.average_monthly_return
    );
    println!(
        "Starting balance: {:.2}, Ending equity: {:.2}",
        s.starting_balance, s.ending_equity
    );
    if let Some(rid) = &s.run_id {
        println!("Run ID: {rid}");
    }

    info!(reports_dir = %cfg.reports_dir, "artifacts written");
    Ok(())
}

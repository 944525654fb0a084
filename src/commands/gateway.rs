//! `exsim gateway` — online REST+WS exchange gateway

use anyhow::{Context, Result};

use exsim::config::{parse_time_ms, GatewayConfig};

#[allow(clippy::too_many_arguments)]
pub fn run(
    db_path: String,
    symbol: String,
    interval: String,
    start: String,
    end: String,
    speed: f64,
    maker_bps: f64,
    taker_bps: f64,
    slippage_bps: f64,
    starting_balance: f64,
    fill_model: String,
    seed: u64,
    host: String,
    port: u16,
) -> Result<()> {
    let cfg = GatewayConfig {
        db_path,
        symbol,
        interval,
        start_ts: parse_time_ms(&start).context("invalid --start")?,
        end_ts: parse_time_ms(&end).context("invalid --end")?,
        bars_per_sec: speed,
        maker_bps,
        taker_bps,
        slippage_bps,
        starting_balance,
        fill_model,
        seed,
        host,
        port,
    };

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(exsim::gateway::serve(cfg))
}

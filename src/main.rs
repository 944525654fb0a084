//! ExSim - main entry point
//!
//! This binary provides three subcommands:
//! - backtest: run a batch backtest over a date range and write reports
//! - gateway: serve the Binance-style REST+WS replay gateway
//! - download: fetch historical klines/funding from Binance into SQLite

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "exsim")]
#[command(about = "Deterministic perpetual-futures exchange simulator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a batch backtest
    Backtest {
        /// Symbol, e.g. BTCUSDT
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,

        /// Bar interval, e.g. 1m, 1h, 1d
        #[arg(long, default_value = "1h")]
        interval: String,

        /// Start (YYYY-MM-DD, ISO datetime, or epoch)
        #[arg(long)]
        start: String,

        /// End (YYYY-MM-DD, ISO datetime, or epoch)
        #[arg(long)]
        end: String,

        /// Data source: api | files | sqlite
        #[arg(long, default_value = "api")]
        data_source: String,

        /// SQLite database path (for --data-source sqlite)
        #[arg(long, default_value = "data/exsim.sqlite")]
        sqlite_path: String,

        /// CSV directory (for --data-source files)
        #[arg(long, default_value = "data/files")]
        csv_dir: String,

        /// Fill model: ohlc_up | ohlc_down | random | book
        #[arg(long, default_value = "ohlc_up")]
        fill_model: String,

        /// Random seed (for the random fill model)
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Maker fee in bps (2.0 => 0.02%)
        #[arg(long, default_value = "2.0")]
        maker_bps: f64,

        /// Taker fee in bps
        #[arg(long, default_value = "4.0")]
        taker_bps: f64,

        /// Slippage in bps, applied against the trader on taker fills
        #[arg(long, default_value = "0.0")]
        slippage_bps: f64,

        /// Starting USDT balance
        #[arg(long, default_value = "100000.0")]
        starting_balance: f64,

        /// Strategy name (e.g. sma); omit for manual order flow
        #[arg(long)]
        strategy: Option<String>,

        /// JSON parameters for the strategy
        #[arg(long)]
        strategy_params: Option<String>,

        /// Output directory for trades.csv / equity.csv / summary.json
        #[arg(long, default_value = "reports")]
        reports_dir: String,
    },

    /// Serve the REST+WS replay gateway
    Gateway {
        /// SQLite database with klines/funding tables
        #[arg(long, default_value = "data/exsim.sqlite")]
        db_path: String,

        /// Symbol, e.g. BTCUSDT
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,

        /// Bar interval
        #[arg(long, default_value = "1m")]
        interval: String,

        /// Start (YYYY-MM-DD, ISO datetime, or epoch)
        #[arg(long)]
        start: String,

        /// End (YYYY-MM-DD, ISO datetime, or epoch)
        #[arg(long)]
        end: String,

        /// Replay speed, bars per second
        #[arg(long, default_value = "10.0")]
        speed: f64,

        /// Maker fee in bps
        #[arg(long, default_value = "2.0")]
        maker_bps: f64,

        /// Taker fee in bps
        #[arg(long, default_value = "4.0")]
        taker_bps: f64,

        /// Slippage in bps
        #[arg(long, default_value = "0.0")]
        slippage_bps: f64,

        /// Starting USDT balance
        #[arg(long, default_value = "100000.0")]
        starting_balance: f64,

        /// Fill model: ohlc_up | ohlc_down | random | book
        #[arg(long, default_value = "ohlc_up")]
        fill_model: String,

        /// Random seed (for the random fill model)
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port
        #[arg(long, default_value = "9001")]
        port: u16,
    },

    /// Download historical data from Binance into SQLite
    Download {
        /// Symbols, comma-separated. E.g. "BTCUSDT,ETHUSDT"
        #[arg(short, long, default_value = "BTCUSDT")]
        symbols: String,

        /// Intervals, comma-separated. E.g. "1m,1h,1d"
        #[arg(short, long, default_value = "1h")]
        intervals: String,

        /// Start (YYYY-MM-DD, ISO datetime, or epoch)
        #[arg(long)]
        start: String,

        /// End (YYYY-MM-DD, ISO datetime, or epoch)
        #[arg(long)]
        end: String,

        /// Destination SQLite database
        #[arg(long, default_value = "data/exsim.sqlite")]
        sqlite_path: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy HTTP internals unless explicitly requested.
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn,tower_http=info",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    // .env is optional; production injects env vars directly.
    let _ = dotenv::dotenv();

    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Gateway { .. } => "gateway",
        Commands::Download { .. } => "download",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
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
        } => commands::backtest::run(
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
        ),

        Commands::Gateway {
            db_path,
            symbol,
            interval,
            start,
            end,
            speed,
            maker_bps,
            taker_bps,
            slippage_bps,
            starting_balance,
            fill_model,
            seed,
            host,
            port,
        } => commands::gateway::run(
            db_path,
            symbol,
            interval,
            start,
            end,
            speed,
            maker_bps,
            taker_bps,
            slippage_bps,
            starting_balance,
            fill_model,
            seed,
            host,
            port,
        ),

        Commands::Download {
            symbols,
            intervals,
            start,
            end,
            sqlite_path,
        } => commands::download::run(symbols, intervals, start, end, sqlite_path),
    }
}

//! Online gateway: a Binance USDⓈ-M futures REST+WS subset over the
//! simulator core
//!
//! Two thin layers: `build_router` wires the HTTP/WS surface to a shared
//! [`state::GatewayState`]; `serve` assembles the engine, replayer, and
//! store from a [`GatewayConfig`] and runs the server. External trading
//! bots can be pointed at it unchanged.

pub mod binance;
pub mod state;

mod routes_account;
mod routes_admin;
mod routes_market;
mod routes_orders;
mod ws;

use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::SimError;
use crate::executor::{build_executor, Executor};
use crate::fill::build_fill_model;
use crate::replay::{ReplayParams, Replayer};
use crate::store::{NullSink, RunSink, SqliteStore};
use crate::types::Symbol;
use state::SharedState;

/// Build the full application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are not applied here; `serve` attaches
/// them after this call so tests can drive the bare router.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // orders
        .route(
            "/fapi/v1/order",
            post(routes_orders::post_order).delete(routes_orders::delete_order),
        )
        .route(
            "/fapi/v1/allOpenOrders",
            delete(routes_orders::cancel_all_open),
        )
        .route("/fapi/v1/openOrders", get(routes_orders::open_orders))
        .route("/fapi/v1/ticker/bookTicker", get(routes_orders::book_ticker))
        // market data
        .route("/fapi/v1/time", get(routes_market::server_time))
        .route("/fapi/v1/klines", get(routes_market::klines))
        .route("/fapi/v1/fundingRate", get(routes_market::funding_rate))
        .route("/fapi/v1/premiumIndex", get(routes_market::premium_index))
        .route("/fapi/v1/exchangeInfo", get(routes_market::exchange_info))
        // account
        .route("/fapi/v2/balance", get(routes_account::balance))
        .route("/fapi/v1/positionRisk", get(routes_account::position_risk))
        .route("/fapi/v2/positionRisk", get(routes_account::position_risk))
        .route("/fapi/v1/leverage", post(routes_account::set_leverage))
        .route("/fapi/v1/marginType", post(routes_account::set_margin_type))
        .route(
            "/fapi/v1/positionSide/dual",
            post(routes_account::set_position_mode),
        )
        .route("/fapi/v1/listenKey", post(routes_account::listen_key))
        // admin
        .route("/admin/status", get(routes_admin::admin_status))
        .route("/admin/replay", post(routes_admin::admin_replay))
        // websockets (two compatible paths)
        .route("/stream", get(ws::ws_stream))
        .route("/ws/stream", get(ws::ws_stream))
        .with_state(state)
}

/// Build the simulator core for the gateway: fill model from config, run
/// store on the configured database (falling back to a null sink when the
/// database cannot be opened — persistence is non-fatal).
pub fn build_engine(cfg: &GatewayConfig) -> Result<Executor, SimError> {
    let fill_model = build_fill_model(&cfg.fill_model, cfg.seed, cfg.slippage_bps)?;
    let sink: Box<dyn RunSink> = match SqliteStore::open(&cfg.db_path) {
        Ok(store) => Box::new(store),
        Err(e) => {
            warn!(error = %e, "run store unavailable, fills will not be persisted");
            Box::new(NullSink)
        }
    };
    Ok(build_executor(
        cfg.starting_balance,
        cfg.maker_bps,
        cfg.taker_bps,
        fill_model,
        cfg.slippage_bps,
        sink,
    ))
}

/// Run parameter blob recorded with every gateway run.
pub(crate) fn run_params(cfg: &GatewayConfig) -> serde_json::Value {
    json!({
        "symbol": cfg.symbol.to_uppercase(),
        "interval": cfg.interval,
        "start_ts": cfg.start_ts,
        "end_ts": cfg.end_ts,
        "maker_bps": cfg.maker_bps,
        "taker_bps": cfg.taker_bps,
        "slippage_bps": cfg.slippage_bps,
        "starting_balance": cfg.starting_balance,
        "speed_bars_per_sec": cfg.bars_per_sec,
        "fill_model": cfg.fill_model,
        "seed": cfg.seed,
    })
}

/// Assemble everything from config and serve until shutdown.
pub async fn serve(cfg: GatewayConfig) -> anyhow::Result<()> {
    let symbol = Symbol::new(cfg.symbol.clone());

    let source = crate::data::SqliteSource::open(&cfg.db_path, false)
        .with_context(|| format!("open data source {}", cfg.db_path))?;
    let mut replayer = Replayer::new(
        Box::new(source),
        ReplayParams {
            symbol: symbol.clone(),
            interval: cfg.interval.clone(),
            start_ts: cfg.start_ts,
            end_ts: cfg.end_ts,
            bars_per_sec: cfg.bars_per_sec,
        },
    );
    replayer.load().context("load replay buffer")?;
    let funding = replayer.load_funding().unwrap_or_else(|e| {
        warn!(error = %e, "funding history unavailable");
        Vec::new()
    });

    let mut engine = build_engine(&cfg)?;
    engine.set_funding_events(funding.clone());
    let run_id = match engine.new_run("gateway/binance-sim", run_params(&cfg)) {
        Ok(rid) => Some(rid),
        Err(e) => {
            warn!(error = %e, "run not persisted");
            None
        }
    };

    let state = std::sync::Arc::new(state::GatewayState::new(
        cfg.clone(),
        engine,
        replayer,
        funding,
        run_id,
    ));

    state::start_replay(state.clone())
        .await
        .context("start replay task")?;

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, app).await.context("server crashed")?;
    Ok(())
}

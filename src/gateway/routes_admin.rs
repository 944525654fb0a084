//! Admin routes (no auth; operator-facing)
//!
//! - `GET  /admin/status` — state snapshot
//! - `POST /admin/replay` — reconfigure symbol/range/speed/fees and restart
//!   the replay atomically

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::gateway::binance::{error_response, ERR_BAD_RANGE};
use crate::gateway::state::{self, SharedState};
use crate::gateway::{build_engine, run_params};
use crate::replay::ReplayParams;
use crate::types::Symbol;

#[derive(Debug, Deserialize)]
pub(crate) struct ReplayBody {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub speed_bars_per_sec: Option<f64>,
    pub starting_balance: Option<f64>,
    pub maker_bps: Option<f64>,
    pub taker_bps: Option<f64>,
    pub slippage_bps: Option<f64>,
}

pub(crate) async fn admin_status(State(st): State<SharedState>) -> Response {
    let cfg = st.cfg.read().await.clone();
    let meta = st.meta.read().await.clone();
    let run_id = st.run_id.read().await.clone();
    let bars_loaded = st.replayer.lock().await.bars_count();
    let ws_clients = st.bus.receiver_count();

    let engine = st.engine.lock().await;
    let equity = engine.equity();
    let symbol = Symbol::new(cfg.symbol.clone());
    let (pos_qty, pos_entry) = engine
        .position(&symbol)
        .map(|p| (p.qty, p.entry_price))
        .unwrap_or((0.0, 0.0));
    drop(engine);

    Json(json!({
        "symbol": cfg.symbol.to_uppercase(),
        "interval": cfg.interval,
        "run_id": run_id,
        "ws_clients": ws_clients,
        "bars_loaded": bars_loaded,
        "equity_now": equity,
        "position": { "qty": pos_qty, "avg_price": pos_entry },
        "leverage": meta.leverage,
        "margin_type": meta.margin_type,
        "dual_side": meta.dual_side,
    }))
    .into_response()
}

pub(crate) async fn admin_replay(
    State(st): State<SharedState>,
    Json(body): Json<ReplayBody>,
) -> Response {
    // Stop first: the currently processing bar completes, then the replay
    // task joins. Everything below happens with the stream quiet.
    state::stop_replay(&st).await;

    let new_cfg = {
        let mut cfg = st.cfg.write().await;
        if let Some(s) = &body.symbol {
            cfg.symbol = s.to_uppercase();
        }
        if let Some(i) = &body.interval {
            cfg.interval = i.to_lowercase();
        }
        if let Some(v) = body.start_ts {
            cfg.start_ts = v;
        }
        if let Some(v) = body.end_ts {
            cfg.end_ts = v;
        }
        if let Some(v) = body.speed_bars_per_sec {
            if v > 0.0 {
                cfg.bars_per_sec = v;
            }
        }
        if let Some(v) = body.maker_bps {
            cfg.maker_bps = v;
        }
        if let Some(v) = body.taker_bps {
            cfg.taker_bps = v;
        }
        if let Some(v) = body.slippage_bps {
            cfg.slippage_bps = v;
        }
        if let Some(v) = body.starting_balance {
            cfg.starting_balance = v;
        }
        cfg.clone()
    };

    // Reload the replay buffer for the new window.
    let funding = {
        let mut rp = st.replayer.lock().await;
        rp.set_params(ReplayParams {
            symbol: Symbol::new(new_cfg.symbol.clone()),
            interval: new_cfg.interval.clone(),
            start_ts: new_cfg.start_ts,
            end_ts: new_cfg.end_ts,
            bars_per_sec: new_cfg.bars_per_sec,
        });
        if let Err(e) = rp.load() {
            return error_response(ERR_BAD_RANGE, e.to_string());
        }
        match rp.load_funding() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "funding reload failed, continuing without");
                Vec::new()
            }
        }
    };

    // A new starting balance resets the account wholesale; otherwise the
    // engine keeps its positions and only the funding cursor restarts.
    let run_id = {
        let mut engine = st.engine.lock().await;
        if body.starting_balance.is_some() {
            match build_engine(&new_cfg) {
                Ok(fresh) => *engine = fresh,
                Err(e) => return error_response(ERR_BAD_RANGE, e.to_string()),
            }
        }
        engine.set_funding_events(funding.clone());
        match engine.new_run("gateway/binance-sim", run_params(&new_cfg)) {
            Ok(rid) => Some(rid),
            Err(e) => {
                warn!(error = %e, "run not persisted");
                None
            }
        }
    };

    *st.funding.write().await = funding;
    *st.run_id.write().await = run_id.clone();

    let bars = st.replayer.lock().await.bars_count();
    if let Err(e) = state::start_replay(st.clone()).await {
        return error_response(ERR_BAD_RANGE, e.to_string());
    }

    info!(bars, run_id = ?run_id, "replay restarted");
    Json(json!({ "ok": true, "run_id": run_id, "bars": bars })).into_response()
}

//! Market data routes (read-only, served from the in-memory state)
//!
//! - `GET /fapi/v1/time`
//! - `GET /fapi/v1/klines`
//! - `GET /fapi/v1/fundingRate`
//! - `GET /fapi/v1/premiumIndex`
//! - `GET /fapi/v1/exchangeInfo`

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::config::now_ms;
use crate::gateway::binance::{error_response, fmt8, ERR_MANDATORY};
use crate::gateway::state::SharedState;

pub(crate) async fn server_time() -> Response {
    Json(json!({ "serverTime": now_ms() })).into_response()
}

fn get_i64(params: &HashMap<String, String>, key: &str) -> Option<i64> {
    params.get(key).and_then(|s| s.parse().ok())
}

pub(crate) async fn klines(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let symbol = symbol.to_uppercase();
    let start = get_i64(&params, "startTime");
    let end = get_i64(&params, "endTime");
    let limit = get_i64(&params, "limit").map(|n| n.max(0) as usize);

    let rp = st.replayer.lock().await;
    let mut rows: Vec<Value> = rp
        .bars()
        .iter()
        .filter(|b| b.symbol.as_str() == symbol)
        .filter(|b| start.map_or(true, |s| b.open_time >= s))
        .filter(|b| end.map_or(true, |e| b.open_time <= e))
        .map(|b| {
            json!([
                b.open_time,
                b.open,
                b.high,
                b.low,
                b.close,
                b.volume,
                b.close_time
            ])
        })
        .collect();
    if let Some(n) = limit {
        rows.truncate(n);
    }
    Json(rows).into_response()
}

pub(crate) async fn funding_rate(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let symbol = symbol.to_uppercase();
    let start = get_i64(&params, "startTime");
    let end = get_i64(&params, "endTime");
    let limit = get_i64(&params, "limit").map(|n| n.max(0) as usize);

    let funding = st.funding.read().await;
    let mut rows: Vec<Value> = funding
        .iter()
        .filter(|f| start.map_or(true, |s| f.funding_time >= s))
        .filter(|f| end.map_or(true, |e| f.funding_time <= e))
        .map(|f| {
            json!({
                "symbol": symbol,
                "fundingTime": f.funding_time,
                "fundingRate": f.funding_rate,
            })
        })
        .collect();
    if let Some(n) = limit {
        rows.truncate(n);
    }
    Json(rows).into_response()
}

pub(crate) async fn premium_index(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let px = st.current_price().await;

    // Last funding rate effective so far; 0 when none has applied yet.
    let now = now_ms();
    let last_rate = {
        let funding = st.funding.read().await;
        funding
            .iter()
            .rev()
            .find(|f| f.funding_time <= now)
            .map(|f| f.funding_rate)
            .unwrap_or(0.0)
    };

    Json(json!({
        "symbol": symbol.to_uppercase(),
        "markPrice": fmt8(px),
        "lastFundingRate": fmt8(last_rate),
    }))
    .into_response()
}

pub(crate) async fn exchange_info(State(st): State<SharedState>) -> Response {
    let symbol = st.cfg.read().await.symbol.to_uppercase();
    let (base, quote) = if symbol.len() > 4 {
        symbol.split_at(symbol.len() - 4)
    } else {
        (symbol.as_str(), "USDT")
    };

    // Static per-symbol filters; the simulator does not enforce them.
    let tick_size = 0.1;
    let step_size = 0.0001;

    Json(json!({
        "timezone": "UTC",
        "serverTime": now_ms(),
        "symbols": [
            {
                "symbol": symbol,
                "pair": symbol,
                "status": "TRADING",
                "contractType": "PERPETUAL",
                "baseAsset": base,
                "quoteAsset": quote,
                "filters": [
                    { "filterType": "PRICE_FILTER", "tickSize": fmt8(tick_size) },
                    { "filterType": "LOT_SIZE", "stepSize": fmt8(step_size) },
                ],
            }
        ],
    }))
    .into_response()
}

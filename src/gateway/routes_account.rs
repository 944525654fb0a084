//! Account and position routes (Binance UM-futures subset)
//!
//! - `GET  /fapi/v2/balance`
//! - `GET  /fapi/v1/positionRisk` (+ v2 alias)
//! - `POST /fapi/v1/leverage`
//! - `POST /fapi/v1/marginType`
//! - `POST /fapi/v1/positionSide/dual`
//! - `POST /fapi/v1/listenKey`
//!
//! Leverage, margin type, and position mode are stored as tags for
//! compatibility; they never change the accounting.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::now_ms;
use crate::gateway::binance::{error_response, fmt8, ERR_MANDATORY};
use crate::gateway::state::SharedState;
use crate::types::Symbol;

pub(crate) async fn balance(State(st): State<SharedState>) -> Response {
    let engine = st.engine.lock().await;
    let equity = engine.equity();
    let cash = engine.account().balance;
    drop(engine);

    Json(json!([{
        "accountAlias": "SIM",
        "asset": "USDT",
        "balance": fmt8(equity),
        "crossWalletBalance": fmt8(equity),
        "availableBalance": fmt8(cash),
        "maxWithdrawAmount": fmt8(cash),
        "updateTime": now_ms(),
    }]))
    .into_response()
}

pub(crate) async fn position_risk(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filter = params.get("symbol").map(|s| Symbol::new(s.clone()));
    let meta = st.meta.read().await.clone();
    let cfg_symbol = Symbol::new(st.cfg.read().await.symbol.clone());

    let engine = st.engine.lock().await;
    let mut rows: Vec<Value> = Vec::new();
    for (sym, pos) in engine.positions() {
        if filter.as_ref().is_some_and(|f| f != sym) {
            continue;
        }
        let mark = engine.last_price(sym).unwrap_or(pos.entry_price);
        rows.push(json!({
            "symbol": sym.as_str(),
            "positionAmt": fmt8(pos.qty),
            "entryPrice": fmt8(pos.entry_price),
            "unRealizedProfit": fmt8(pos.unrealized_pnl(mark)),
            "markPrice": fmt8(mark),
            "leverage": meta.leverage.to_string(),
            "marginType": meta.margin_type.clone(),
            "updateTime": now_ms(),
            "positionSide": "BOTH",
        }));
    }

    // Bots expect at least the configured symbol to be present, flat or not.
    if rows.is_empty() {
        let sym = filter.unwrap_or(cfg_symbol);
        let mark = engine.last_price(&sym).unwrap_or(0.0);
        rows.push(json!({
            "symbol": sym.as_str(),
            "positionAmt": fmt8(0.0),
            "entryPrice": fmt8(0.0),
            "unRealizedProfit": fmt8(0.0),
            "markPrice": fmt8(mark),
            "leverage": meta.leverage.to_string(),
            "marginType": meta.margin_type,
            "updateTime": now_ms(),
            "positionSide": "BOTH",
        }));
    }

    Json(rows).into_response()
}

pub(crate) async fn set_leverage(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let Some(leverage) = params.get("leverage").and_then(|s| s.parse::<u32>().ok()) else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'leverage' was not sent.");
    };

    st.meta.write().await.leverage = leverage;
    Json(json!({
        "leverage": leverage,
        "symbol": symbol.to_uppercase(),
        "maxNotionalValue": "0",
    }))
    .into_response()
}

pub(crate) async fn set_margin_type(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let Some(margin_type) = params.get("marginType") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'marginType' was not sent.");
    };

    let normalized = margin_type.to_uppercase();
    st.meta.write().await.margin_type = normalized.clone();
    Json(json!({
        "symbol": symbol.to_uppercase(),
        "marginType": normalized,
    }))
    .into_response()
}

pub(crate) async fn set_position_mode(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let dual = params
        .get("dualSidePosition")
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    st.meta.write().await.dual_side = dual;
    Json(json!({ "dualSidePosition": dual })).into_response()
}

pub(crate) async fn listen_key() -> Response {
    let key = Uuid::new_v4().simple().to_string();
    Json(json!({ "listenKey": format!("sim-{}", &key[..16]) })).into_response()
}

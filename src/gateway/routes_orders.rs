//! Order routes
//!
//! - `POST   /fapi/v1/order`         — place MARKET/LIMIT/STOP_MARKET/STOP_LIMIT
//! - `DELETE /fapi/v1/order`         — cancel by orderId
//! - `DELETE /fapi/v1/allOpenOrders` — bulk cancel by symbol
//! - `GET    /fapi/v1/openOrders`    — resting orders
//! - `GET    /fapi/v1/ticker/bookTicker` — synthetic L1 quote
//!
//! Order parameters are accepted as JSON, urlencoded form, or query string;
//! body fields win over query fields on conflict.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Query, RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::error::SimError;
use crate::executor::OrderRequest;
use crate::gateway::binance::{
    error_response, fmt8, order_json, ERR_BAD_RANGE, ERR_BAD_TYPE, ERR_MANDATORY,
    ERR_UNKNOWN_ORDER,
};
use crate::gateway::state::SharedState;
use crate::types::{OrderType, Side, Symbol, TimeInForce};

/// Collapse query string and body (JSON or urlencoded) into one string map;
/// body entries overwrite query entries.
fn merge_params(query: Option<&str>, headers: &HeaderMap, body: &Bytes) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();

    if let Some(q) = query {
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) {
            out.extend(pairs);
        }
    }

    if body.is_empty() {
        return out;
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let looks_json =
        content_type.contains("json") || body.first().is_some_and(|b| *b == b'{');

    if looks_json {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
            for (k, v) in map {
                let s = match v {
                    Value::String(s) => s,
                    Value::Null => continue,
                    other => other.to_string(),
                };
                out.insert(k, s);
            }
        }
    } else if let Ok(text) = std::str::from_utf8(body) {
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(text) {
            out.extend(pairs);
        }
    }

    out
}

fn boolish(v: Option<&String>) -> bool {
    v.map(|s| {
        matches!(
            s.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
    .unwrap_or(false)
}

/// Parse the merged params into an engine request, with Binance error codes
/// for every failure mode.
fn parse_order_request(params: &HashMap<String, String>) -> Result<OrderRequest, Response> {
    let symbol = params
        .get("symbol")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent."))?;

    let side_raw = params
        .get("side")
        .ok_or_else(|| error_response(ERR_MANDATORY, "Mandatory parameter 'side' was not sent."))?;
    let side = Side::parse(side_raw)
        .map_err(|_| error_response(ERR_MANDATORY, format!("Invalid side: {side_raw}")))?;

    let type_raw = params
        .get("type")
        .ok_or_else(|| error_response(ERR_MANDATORY, "Mandatory parameter 'type' was not sent."))?;
    let order_type = OrderType::parse(type_raw)
        .map_err(|_| error_response(ERR_BAD_TYPE, format!("Unsupported order type: {type_raw}")))?;

    let qty_raw = params
        .get("quantity")
        .or_else(|| params.get("origQty"))
        .or_else(|| params.get("qty"))
        .ok_or_else(|| {
            error_response(ERR_MANDATORY, "Mandatory parameter 'quantity' was not sent.")
        })?;
    let qty: f64 = qty_raw
        .parse()
        .map_err(|_| error_response(ERR_MANDATORY, format!("Invalid quantity: {qty_raw}")))?;
    if !(qty.is_finite() && qty > 0.0) {
        return Err(error_response(ERR_BAD_RANGE, "Invalid quantity."));
    }

    let parse_px = |key: &str| -> Result<Option<f64>, Response> {
        match params.get(key) {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|_| error_response(ERR_MANDATORY, format!("Invalid {key}: {raw}"))),
        }
    };
    let price = parse_px("price")?;
    let stop_price = parse_px("stopPrice")?;

    let tif = params
        .get("timeInForce")
        .map(|s| TimeInForce::parse_or_gtc(s))
        .unwrap_or(TimeInForce::Gtc);

    Ok(OrderRequest {
        symbol: Symbol::new(symbol.clone()),
        side,
        order_type,
        qty,
        price,
        stop_price,
        tif,
        reduce_only: boolish(params.get("reduceOnly")),
        client_id: params.get("newClientOrderId").cloned(),
    })
}

fn engine_error_response(e: SimError) -> Response {
    match e {
        SimError::UnsupportedType(t) => {
            error_response(ERR_BAD_TYPE, format!("Unsupported order type: {t}"))
        }
        SimError::NoMarketPrice(s) => {
            error_response(ERR_BAD_RANGE, format!("No market price available for {s}."))
        }
        other => error_response(ERR_BAD_RANGE, other.to_string()),
    }
}

pub(crate) async fn post_order(
    State(st): State<SharedState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let params = merge_params(query.as_deref(), &headers, &body);
    let req = match parse_order_request(&params) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    let result = {
        let mut engine = st.engine.lock().await;
        engine.place_order(req)
    };

    match result {
        Ok(order) => {
            info!(
                order_id = order.id,
                symbol = %order.symbol,
                side = %order.side,
                order_type = %order.order_type,
                status = order.status.as_str(),
                "order placed"
            );
            Json(order_json(&order)).into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

pub(crate) async fn delete_order(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let symbol = params.get("symbol").cloned().unwrap_or_default();
    let Some(order_id) = params.get("orderId").and_then(|s| s.parse::<u64>().ok()) else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'orderId' was not sent.");
    };

    let result = {
        let mut engine = st.engine.lock().await;
        engine.cancel(order_id)
    };

    match result {
        Ok(order) => Json(json!({
            "symbol": symbol.to_uppercase(),
            "orderId": order.id,
            "clientOrderId": order.client_id.clone().unwrap_or_default(),
            "status": order.status.as_str(),
        }))
        .into_response(),
        Err(_) => error_response(ERR_UNKNOWN_ORDER, "Unknown order sent."),
    }
}

pub(crate) async fn cancel_all_open(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let symbol = Symbol::new(symbol.clone());

    let ids = {
        let mut engine = st.engine.lock().await;
        engine.cancel_all(&symbol)
    };
    info!(symbol = %symbol, canceled = ids.len(), "bulk cancel");
    Json(json!(ids)).into_response()
}

pub(crate) async fn open_orders(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filter = params.get("symbol").map(|s| Symbol::new(s.clone()));
    let orders = {
        let engine = st.engine.lock().await;
        engine.open_orders(filter.as_ref())
    };
    let list: Vec<Value> = orders.iter().map(order_json).collect();
    Json(list).into_response()
}

pub(crate) async fn book_ticker(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(symbol) = params.get("symbol") else {
        return error_response(ERR_MANDATORY, "Mandatory parameter 'symbol' was not sent.");
    };
    let px = st.current_price().await;
    let bid = px * (1.0 - 0.0002);
    let ask = px * (1.0 + 0.0002);
    Json(json!({
        "symbol": symbol.to_uppercase(),
        "bidPrice": fmt8(bid),
        "bidQty": "1.00000000",
        "askPrice": fmt8(ask),
        "askQty": "1.00000000",
    }))
    .into_response()
}

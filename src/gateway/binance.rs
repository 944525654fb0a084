//! Binance-style payload builders and error codes
//!
//! Prices and quantities are formatted as `%.8f` strings the way the real
//! futures API emits them; WS events are wrapped in `{stream, data}`
//! envelopes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::config::now_ms;
use crate::types::{Bar, Order, Symbol};

/// Mandatory parameter missing or malformed.
pub const ERR_MANDATORY: i64 = -1102;
/// Numeric value outside its valid range.
pub const ERR_BAD_RANGE: i64 = -1013;
/// Order type outside the supported set.
pub const ERR_BAD_TYPE: i64 = -1116;
/// Cancel for an order the engine does not know.
pub const ERR_UNKNOWN_ORDER: i64 = -2011;

pub fn fmt8(x: f64) -> String {
    format!("{x:.8}")
}

/// Binance-compatible error body with HTTP 400.
pub fn error_response(code: i64, msg: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "code": code, "msg": msg.into() })),
    )
        .into_response()
}

/// Order response shape shared by placement and open-order listings.
pub fn order_json(order: &Order) -> Value {
    let mut out = json!({
        "symbol": order.symbol.as_str(),
        "orderId": order.id,
        "clientOrderId": order.client_id.clone().unwrap_or_default(),
        "transactTime": now_ms(),
        "price": fmt8(order.price.unwrap_or(0.0)),
        "origQty": fmt8(order.qty),
        "executedQty": fmt8(order.filled_qty),
        "status": order.status.as_str(),
        "timeInForce": order.tif.as_str(),
        "type": order.order_type.as_str(),
        "side": order.side.as_str(),
    });
    if !order.fills.is_empty() {
        out["fills"] = Value::Array(
            order
                .fills
                .iter()
                .map(|f| {
                    json!({
                        "price": fmt8(f.price),
                        "qty": fmt8(f.qty),
                        "commission": fmt8(f.fee),
                        "commissionAsset": "USDT",
                    })
                })
                .collect(),
        );
    }
    out
}

/// Closed-kline event (`x: true`) wrapped in its stream envelope,
/// serialized for the broadcast bus.
pub fn kline_close_envelope(bar: &Bar, interval: &str) -> String {
    let symbol = bar.symbol.as_str();
    let data = json!({
        "e": "kline",
        "E": now_ms(),
        "s": symbol,
        "k": {
            "t": bar.open_time,
            "T": bar.close_time,
            "s": symbol,
            "i": interval.to_lowercase(),
            "o": fmt8(bar.open),
            "c": fmt8(bar.close),
            "h": fmt8(bar.high),
            "l": fmt8(bar.low),
            "v": fmt8(bar.volume),
            "n": 0,
            "x": true,
            "q": "0",
            "V": "0",
            "Q": "0",
            "B": "0",
        }
    });
    let stream = format!("{}@kline_{}", symbol.to_lowercase(), interval.to_lowercase());
    envelope(&stream, data)
}

/// markPriceUpdate event wrapped in its stream envelope.
pub fn mark_price_envelope(symbol: &Symbol, price: f64) -> String {
    let data = json!({
        "e": "markPriceUpdate",
        "E": now_ms(),
        "s": symbol.as_str(),
        "p": fmt8(price),
    });
    let stream = format!("{}@markPrice@1s", symbol.as_str().to_lowercase());
    envelope(&stream, data)
}

fn envelope(stream: &str, data: Value) -> String {
    json!({ "stream": stream, "data": data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, OrderType, Side, TimeInForce};

    #[test]
    fn fmt8_pads_to_eight_decimals() {
        assert_eq!(fmt8(95.0), "95.00000000");
        assert_eq!(fmt8(0.1), "0.10000000");
    }

    #[test]
    fn kline_envelope_has_stream_and_closed_flag() {
        let bar = Bar {
            open_time: 0,
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 105.0,
            volume: 3.5,
            close_time: 59_999,
            symbol: Symbol::new("BTCUSDT"),
        };
        let raw = kline_close_envelope(&bar, "1m");
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["stream"], "btcusdt@kline_1m");
        assert_eq!(v["data"]["k"]["x"], true);
        assert_eq!(v["data"]["k"]["c"], "105.00000000");
    }

    #[test]
    fn order_json_includes_fills_only_when_present() {
        let mut order = Order {
            id: 7,
            client_id: Some("cid-1".into()),
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 1.0,
            price: Some(95.0),
            stop_price: None,
            tif: TimeInForce::Gtc,
            reduce_only: false,
            status: OrderStatus::New,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            fills: Vec::new(),
            created_ms: 0,
        };
        let v = order_json(&order);
        assert_eq!(v["orderId"], 7);
        assert_eq!(v["price"], "95.00000000");
        assert!(v.get("fills").is_none());

        order.apply_fill(crate::types::Fill {
            price: 95.0,
            qty: 1.0,
            is_maker: false,
            fee: 0.038,
            ts_ms: 0,
        });
        let v = order_json(&order);
        assert_eq!(v["fills"].as_array().unwrap().len(), 1);
        assert_eq!(v["status"], "FILLED");
    }
}

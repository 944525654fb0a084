//! Core data types used across the simulator

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Numeric tolerance used when comparing quantities against zero.
pub const EPS: f64 = 1e-12;

/// Trading pair symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(SimError::InvalidParam(format!("invalid side: {other}"))),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type - determines execution logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Execute immediately at the last known price (taker)
    Market,

    /// Rest until the intrabar path crosses the limit price.
    /// Buy limit fills when price ≤ limit; sell limit when price ≥ limit.
    Limit,

    /// Converts to market once the stop level trades
    StopMarket,

    /// Converts to a resting limit once the stop level trades
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }

    /// Parse a wire order type. `STOP` is accepted as an alias for
    /// `STOP_MARKET` (binance-connector sends it for futures stops).
    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s.to_uppercase().as_str() {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            "STOP" | "STOP_MARKET" => Ok(OrderType::StopMarket),
            "STOP_LIMIT" => Ok(OrderType::StopLimit),
            other => Err(SimError::UnsupportedType(other.to_string())),
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-in-force policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good-til-canceled
    Gtc,
    /// Immediate-or-cancel: unfilled remainder expires after the order's
    /// first matching opportunity
    Ioc,
    /// Fill-or-kill: expires unless completely filled at the first
    /// matching opportunity
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }

    /// Parse a wire TIF, defaulting to GTC for empty/unknown values.
    pub fn parse_or_gtc(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "IOC" => TimeInForce::Ioc,
            "FOK" => TimeInForce::Fok,
            _ => TimeInForce::Gtc,
        }
    }
}

/// Order state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states are absorbing: no further transitions or fills.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

/// OHLCV bar. Times in milliseconds since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub symbol: Symbol,
}

impl Bar {
    /// Reject bars whose data violates OHLC/time invariants before any
    /// engine state is touched.
    pub fn validate(&self) -> Result<(), SimError> {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        if !(self.low <= body_lo && body_hi <= self.high) {
            return Err(SimError::DataUnavailable(format!(
                "malformed bar at {}: O={} H={} L={} C={}",
                self.open_time, self.open, self.high, self.low, self.close
            )));
        }
        if self.close_time <= self.open_time {
            return Err(SimError::DataUnavailable(format!(
                "bar at {} closes before it opens ({})",
                self.open_time, self.close_time
            )));
        }
        Ok(())
    }
}

/// Single execution against an order, possibly timestamped intrabar.
///
/// Produced by a fill model with `fee = 0.0`; the executor prices the fee
/// from the account's maker/taker rates before the fill is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
    pub is_maker: bool,
    pub fee: f64,
    pub ts_ms: i64,
}

/// Order model used by the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub client_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub filled_qty: f64,
    /// VWAP of all fills applied so far (0.0 while unfilled).
    pub avg_fill_price: f64,
    pub fills: Vec<Fill>,
    /// Engine clock at submission (ms).
    pub created_ms: i64,
}

impl Order {
    pub fn remaining_qty(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }

    /// Accumulate a fill into the order: advances `filled_qty`, recomputes
    /// the quantity-weighted `avg_fill_price`, and updates status.
    pub fn apply_fill(&mut self, fill: Fill) {
        let prev_notional = self.avg_fill_price * self.filled_qty;
        let new_total = self.filled_qty + fill.qty;
        if new_total > 0.0 {
            self.avg_fill_price = (prev_notional + fill.price * fill.qty) / new_total;
        }
        self.filled_qty = new_total;
        self.fills.push(fill);

        self.status = if self.remaining_qty() <= EPS {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}

/// Fill row as recorded to the sink and the in-memory trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub ts_ms: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub is_maker: bool,
}

/// Equity sample emitted once per closed bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts_ms: i64,
    pub equity: f64,
}

/// Funding event: periodic cash flow for perpetual positions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingEvent {
    pub funding_time: i64,
    pub funding_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            open_time: 0,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 0.0,
            close_time: 60_000,
            symbol: Symbol::new("BTCUSDT"),
        }
    }

    #[test]
    fn bar_validate_accepts_sane_ohlc() {
        assert!(bar(100.0, 120.0, 80.0, 110.0).validate().is_ok());
    }

    #[test]
    fn bar_validate_rejects_low_above_high() {
        let b = bar(100.0, 90.0, 95.0, 92.0);
        assert!(matches!(b.validate(), Err(SimError::DataUnavailable(_))));
    }

    #[test]
    fn bar_validate_rejects_inverted_times() {
        let mut b = bar(100.0, 120.0, 80.0, 110.0);
        b.close_time = b.open_time;
        assert!(b.validate().is_err());
    }

    #[test]
    fn order_type_parse_accepts_stop_alias() {
        assert_eq!(OrderType::parse("STOP").unwrap(), OrderType::StopMarket);
        assert_eq!(
            OrderType::parse("stop_limit").unwrap(),
            OrderType::StopLimit
        );
        assert!(matches!(
            OrderType::parse("TRAILING_STOP_MARKET"),
            Err(SimError::UnsupportedType(_))
        ));
    }

    #[test]
    fn order_fill_accumulation_is_quantity_weighted() {
        let mut order = Order {
            id: 1,
            client_id: None,
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 10.0,
            price: Some(50_000.0),
            stop_price: None,
            tif: TimeInForce::Gtc,
            reduce_only: false,
            status: OrderStatus::New,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            fills: Vec::new(),
            created_ms: 0,
        };

        order.apply_fill(Fill {
            price: 50_000.0,
            qty: 3.0,
            is_maker: true,
            fee: 0.0,
            ts_ms: 0,
        });
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        order.apply_fill(Fill {
            price: 50_100.0,
            qty: 7.0,
            is_maker: true,
            fee: 0.0,
            ts_ms: 0,
        });
        assert_eq!(order.status, OrderStatus::Filled);

        let expected = (50_000.0 * 3.0 + 50_100.0 * 7.0) / 10.0;
        assert!((order.avg_fill_price - expected).abs() < 1e-9);
        assert!(order.filled_qty <= order.qty + EPS);
    }
}

//! Matching loop and order lifecycle
//!
//! The executor is the single owner of open orders, per-symbol positions,
//! and the account. It is synchronous and single-threaded with respect to
//! its own state: `on_bar` is the only mutator, and adapters serialize
//! every call into it. Orders are processed in submission order; within a
//! bar the fill model's segment traversal is fixed.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::account::Account;
use crate::error::SimError;
use crate::fill::FillModel;
use crate::position::Position;
use crate::store::RunSink;
use crate::types::{
    Bar, EquityPoint, Fill, FillRecord, FundingEvent, Order, OrderStatus, OrderType, Side, Symbol,
    TimeInForce, EPS,
};

/// Parameters for a new order, as accepted by the public API.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub client_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: Side, qty: f64) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_price: None,
            tif: TimeInForce::Gtc,
            reduce_only: false,
            client_id: None,
        }
    }

    pub fn limit(symbol: Symbol, side: Side, qty: f64, price: f64) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            stop_price: None,
            tif: TimeInForce::Gtc,
            reduce_only: false,
            client_id: None,
        }
    }
}

/// Funding schedule consumed via a monotone cursor.
#[derive(Debug, Default)]
struct FundingCursor {
    events: Vec<FundingEvent>,
    idx: usize,
}

impl FundingCursor {
    /// Sum of all not-yet-consumed rates effective up to `ts` (inclusive).
    fn accumulate_until(&mut self, ts: i64) -> f64 {
        let mut rate = 0.0;
        while self.idx < self.events.len() && self.events[self.idx].funding_time <= ts {
            rate += self.events[self.idx].funding_rate;
            self.idx += 1;
        }
        rate
    }
}

/// The simulator core: bar-driven matching, accounting, and funding.
pub struct Executor {
    account: Account,
    positions: HashMap<Symbol, Position>,
    open_orders: Vec<Order>,
    next_order_id: u64,
    fill_model: Box<dyn FillModel>,
    /// Slippage (fraction) charged on immediate MARKET executions, where no
    /// bar exists yet to clamp against.
    slip_frac: f64,
    last_price: HashMap<Symbol, f64>,
    clock_ms: Option<i64>,
    last_open_ms: Option<i64>,
    funding: FundingCursor,
    sink: Box<dyn RunSink>,
    run_id: Option<String>,
    trade_log: Vec<FillRecord>,
    equity_log: Vec<EquityPoint>,
}

impl Executor {
    pub fn new(
        account: Account,
        fill_model: Box<dyn FillModel>,
        slippage_bps: f64,
        sink: Box<dyn RunSink>,
    ) -> Self {
        Self {
            account,
            positions: HashMap::new(),
            open_orders: Vec::new(),
            next_order_id: 1,
            fill_model,
            slip_frac: slippage_bps / 10_000.0,
            last_price: HashMap::new(),
            clock_ms: None,
            last_open_ms: None,
            funding: FundingCursor::default(),
            sink,
            run_id: None,
            trade_log: Vec::new(),
            equity_log: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Run / schedule wiring
    // -----------------------------------------------------------------------

    /// Open a new run in the sink. All subsequent fills and equity samples
    /// reference it.
    pub fn new_run(&mut self, strategy: &str, params: serde_json::Value) -> Result<String, SimError> {
        let rid = self.sink.new_run(strategy, &params)?;
        self.run_id = Some(rid.clone());
        Ok(rid)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Install the funding schedule (sorted ascending; resorted defensively).
    pub fn set_funding_events(&mut self, mut events: Vec<FundingEvent>) {
        events.sort_by_key(|e| e.funding_time);
        self.funding = FundingCursor { events, idx: 0 };
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&Symbol, &Position)> {
        self.positions.iter()
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<f64> {
        self.last_price.get(symbol).copied()
    }

    pub fn clock_ms(&self) -> Option<i64> {
        self.clock_ms
    }

    pub fn trade_log(&self) -> &[FillRecord] {
        &self.trade_log
    }

    pub fn equity_log(&self) -> &[EquityPoint] {
        &self.equity_log
    }

    /// Open orders, optionally filtered by symbol, in submission order.
    pub fn open_orders(&self, symbol: Option<&Symbol>) -> Vec<Order> {
        self.open_orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == *s))
            .cloned()
            .collect()
    }

    /// Equity = balance + Σ unrealized PnL at the last known marks.
    pub fn equity(&self) -> f64 {
        let mut equity = self.account.balance;
        for (sym, pos) in &self.positions {
            if !pos.is_flat() {
                let mark = self.last_price.get(sym).copied().unwrap_or(pos.entry_price);
                equity += (mark - pos.entry_price) * pos.qty;
            }
        }
        equity
    }

    /// Manually set the mark for a symbol (used by the strategy host before
    /// the matching step, and by adapters that know a price out-of-band).
    pub fn mark_price(&mut self, symbol: &Symbol, price: f64) {
        self.last_price.insert(symbol.clone(), price);
    }

    // -----------------------------------------------------------------------
    // Order API
    // -----------------------------------------------------------------------

    /// Validate and submit an order. MARKET executes immediately at the
    /// last known price; everything else rests until `on_bar`.
    pub fn place_order(&mut self, req: OrderRequest) -> Result<Order, SimError> {
        if !(req.qty.is_finite() && req.qty > 0.0) {
            return Err(SimError::InvalidParam(format!(
                "quantity must be > 0, got {}",
                req.qty
            )));
        }
        match req.order_type {
            OrderType::Limit | OrderType::StopLimit => {
                if !req.price.map_or(false, |p| p.is_finite() && p > 0.0) {
                    return Err(SimError::InvalidParam(format!(
                        "{} requires a positive price",
                        req.order_type
                    )));
                }
            }
            _ => {}
        }
        match req.order_type {
            OrderType::StopMarket | OrderType::StopLimit => {
                if !req.stop_price.map_or(false, |p| p.is_finite() && p > 0.0) {
                    return Err(SimError::InvalidParam(format!(
                        "{} requires a positive stop price",
                        req.order_type
                    )));
                }
            }
            _ => {}
        }

        let mut order = Order {
            id: self.next_order_id,
            client_id: req.client_id,
            symbol: req.symbol,
            side: req.side,
            order_type: req.order_type,
            qty: req.qty,
            price: req.price,
            stop_price: req.stop_price,
            tif: req.tif,
            reduce_only: req.reduce_only,
            status: OrderStatus::New,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            fills: Vec::new(),
            created_ms: self.clock_ms.unwrap_or(0),
        };
        self.next_order_id += 1;

        // Reduce-only: clamp the requested quantity to the flattenable size.
        // An order that cannot reduce anything is canceled, not rejected.
        if order.reduce_only {
            let pos_qty = self
                .positions
                .get(&order.symbol)
                .map(|p| p.qty)
                .unwrap_or(0.0);
            let increases = match order.side {
                Side::Buy => pos_qty >= -EPS,
                Side::Sell => pos_qty <= EPS,
            };
            if increases {
                order.status = OrderStatus::Canceled;
                debug!(order_id = order.id, "reduce-only order with nothing to reduce, canceled");
                return Ok(order);
            }
            order.qty = order.qty.min(pos_qty.abs());
        }

        if order.order_type == OrderType::Market {
            let Some(&mark) = self.last_price.get(&order.symbol) else {
                return Err(SimError::NoMarketPrice(order.symbol.to_string()));
            };
            let exec_price = match order.side {
                Side::Buy => mark * (1.0 + self.slip_frac),
                Side::Sell => mark * (1.0 - self.slip_frac),
            };
            let fill = Fill {
                price: exec_price,
                qty: order.qty,
                is_maker: false,
                fee: 0.0,
                ts_ms: self.clock_ms.unwrap_or(0),
            };
            self.settle_fill(&mut order, fill);
            return Ok(order);
        }

        self.open_orders.push(order.clone());
        Ok(order)
    }

    /// Cancel a resting order by id. Only non-terminal orders can be
    /// canceled; anything not resting is unknown.
    pub fn cancel(&mut self, order_id: u64) -> Result<Order, SimError> {
        let idx = self
            .open_orders
            .iter()
            .position(|o| o.id == order_id)
            .ok_or(SimError::UnknownOrder(order_id))?;
        let mut order = self.open_orders.remove(idx);
        order.status = OrderStatus::Canceled;
        Ok(order)
    }

    /// Cancel every resting order for a symbol; returns the canceled ids.
    pub fn cancel_all(&mut self, symbol: &Symbol) -> Vec<u64> {
        let ids: Vec<u64> = self
            .open_orders
            .iter()
            .filter(|o| o.symbol == *symbol)
            .map(|o| o.id)
            .collect();
        self.open_orders.retain(|o| o.symbol != *symbol);
        ids
    }

    // -----------------------------------------------------------------------
    // Bar processing
    // -----------------------------------------------------------------------

    /// Process one bar of market data:
    /// 1. validate the bar and advance the clock to its open
    /// 2. run the fill model over this symbol's open orders
    /// 3. evict terminal orders, expire IOC/FOK remainders
    /// 4. apply funding effective within the bar
    /// 5. mark to the close and emit an equity sample
    pub fn on_bar(&mut self, bar: &Bar) -> Result<(), SimError> {
        bar.validate()?;
        if let Some(last_open) = self.last_open_ms {
            if bar.open_time < last_open {
                return Err(SimError::DataUnavailable(format!(
                    "bar stream went backwards: {} after {}",
                    bar.open_time, last_open
                )));
            }
        }

        self.clock_ms = Some(bar.open_time);
        self.last_open_ms = Some(bar.open_time);
        self.last_price.insert(bar.symbol.clone(), bar.open);

        // Matching: orders are evaluated in submission order, and the
        // resulting fills settle in that same order, so reduce-only
        // clamping observes positions updated by earlier settlements.
        let mut settled: Vec<(usize, Vec<Fill>)> = Vec::new();
        {
            let Self {
                fill_model,
                open_orders,
                ..
            } = self;
            for (i, order) in open_orders.iter_mut().enumerate() {
                if order.symbol != bar.symbol || order.status.is_terminal() {
                    continue;
                }
                let fills = fill_model.fills_on_bar(bar, order);
                if !fills.is_empty() {
                    settled.push((i, fills));
                }
            }
        }

        for (i, fills) in settled {
            // Move the order out so position/account can be borrowed freely.
            let mut order = std::mem::replace(&mut self.open_orders[i], Order::tombstone());
            for fill in fills {
                let fill = match self.clamp_reduce_only(&order, fill) {
                    Some(f) => f,
                    None => continue,
                };
                self.settle_fill(&mut order, fill);
            }
            self.open_orders[i] = order;
        }

        // IOC/FOK: the first matching opportunity has passed; unfilled
        // remainders expire.
        for order in &mut self.open_orders {
            if order.symbol == bar.symbol
                && order.tif != TimeInForce::Gtc
                && !order.status.is_terminal()
            {
                order.status = OrderStatus::Expired;
            }
        }

        self.open_orders.retain(|o| !o.status.is_terminal());

        // Funding at the close: all events effective within this bar are
        // summed into one rate applied at the close price.
        let rate = self.funding.accumulate_until(bar.close_time);
        if rate.abs() > 0.0 {
            if let Some(pos) = self.positions.get_mut(&bar.symbol) {
                if !pos.is_flat() {
                    let payment = pos.qty * rate * bar.close;
                    self.account.apply_funding(payment);
                    pos.realized_pnl -= payment;
                    debug!(rate, payment, "funding applied at bar close");
                }
            }
        }

        self.last_price.insert(bar.symbol.clone(), bar.close);
        self.clock_ms = Some(bar.close_time);

        let sample = EquityPoint {
            ts_ms: bar.close_time,
            equity: self.equity(),
        };
        self.equity_log.push(sample);
        if let Err(e) = self.sink.log_equity(sample.ts_ms, sample.equity) {
            warn!(error = %e, "equity sample dropped");
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Reduce-only discipline on fills: a fill may only shrink the position,
    /// never grow or flip it. Returns the (possibly truncated) fill, or
    /// `None` when nothing reduces.
    fn clamp_reduce_only(&self, order: &Order, mut fill: Fill) -> Option<Fill> {
        if !order.reduce_only {
            return Some(fill);
        }
        let pos_qty = self
            .positions
            .get(&order.symbol)
            .map(|p| p.qty)
            .unwrap_or(0.0);
        let reduces = match order.side {
            Side::Buy => pos_qty < -EPS,
            Side::Sell => pos_qty > EPS,
        };
        if !reduces {
            return None;
        }
        if fill.qty > pos_qty.abs() {
            fill.qty = pos_qty.abs();
        }
        if fill.qty <= EPS {
            return None;
        }
        Some(fill)
    }

    /// Apply a single fill: fee, position update, account update, logs.
    fn settle_fill(&mut self, order: &mut Order, mut fill: Fill) {
        let fee = fill.price * fill.qty * self.account.fee_rate(fill.is_maker);
        fill.fee = fee;

        let signed_qty = match order.side {
            Side::Buy => fill.qty,
            Side::Sell => -fill.qty,
        };
        let pos = self
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position::new(order.symbol.clone()));
        let realized = pos.update(signed_qty, fill.price);

        self.account.balance += realized;
        self.account.apply_fee(fee);

        let rec = FillRecord {
            ts_ms: fill.ts_ms,
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill.price,
            qty: fill.qty,
            realized_pnl: realized,
            fee,
            is_maker: fill.is_maker,
        };
        self.trade_log.push(rec.clone());
        if let Err(e) = self.sink.log_fill(&rec) {
            warn!(error = %e, order_id = order.id, "fill record dropped");
        }

        order.apply_fill(fill);
    }
}

impl Order {
    /// Placeholder swapped in while a live order is being settled.
    fn tombstone() -> Self {
        Order {
            id: 0,
            client_id: None,
            symbol: Symbol::new(""),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 0.0,
            price: None,
            stop_price: None,
            tif: TimeInForce::Gtc,
            reduce_only: false,
            status: OrderStatus::Canceled,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            fills: Vec::new(),
            created_ms: 0,
        }
    }
}

/// Convenience constructor used by both adapters.
pub fn build_executor(
    starting_balance: f64,
    maker_bps: f64,
    taker_bps: f64,
    fill_model: Box<dyn FillModel>,
    slippage_bps: f64,
    sink: Box<dyn RunSink>,
) -> Executor {
    Executor::new(
        Account::from_bps(starting_balance, maker_bps, taker_bps),
        fill_model,
        slippage_bps,
        sink,
    )
}

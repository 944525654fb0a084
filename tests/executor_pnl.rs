//! Executor accounting scenarios
//!
//! End-to-end checks of position/PnL accounting, reduce-only semantics,
//! funding cash flow, and the balance/equity identities, driven through the
//! public executor API exactly the way the adapters drive it.

use approx::assert_relative_eq;

use exsim::executor::{build_executor, Executor, OrderRequest};
use exsim::fill::OhlcPathFill;
use exsim::store::NullSink;
use exsim::types::{
    Bar, FundingEvent, OrderStatus, OrderType, Side, Symbol, TimeInForce,
};

// =============================================================================
// Helpers
// =============================================================================

fn engine_with_fees(maker_bps: f64, taker_bps: f64) -> Executor {
    build_executor(
        10_000.0,
        maker_bps,
        taker_bps,
        Box::new(OhlcPathFill::new(true, 0.0)),
        0.0,
        Box::new(NullSink),
    )
}

fn engine() -> Executor {
    engine_with_fees(0.0, 0.0)
}

fn bar(o: f64, h: f64, l: f64, c: f64, t0: i64) -> Bar {
    Bar {
        open_time: t0,
        open: o,
        high: h,
        low: l,
        close: c,
        volume: 0.0,
        close_time: t0 + 60_000,
        symbol: Symbol::new("TEST"),
    }
}

fn sym() -> Symbol {
    Symbol::new("TEST")
}

fn check_balance_identity(ex: &Executor, starting: f64) {
    let realized: f64 = ex.trade_log().iter().map(|t| t.realized_pnl).sum();
    let fees: f64 = ex.trade_log().iter().map(|t| t.fee).sum();
    assert_relative_eq!(
        ex.account().balance,
        starting + realized - fees - ex.account().total_funding,
        epsilon = 1e-9
    );
}

// =============================================================================
// Literal scenarios
// =============================================================================

#[test]
fn test_simple_profit_round_trip() {
    // Buy 1 at 100, sell 1 at 110, zero fees: +10 realized.
    let mut ex = engine();
    ex.mark_price(&sym(), 100.0);
    ex.place_order(OrderRequest::market(sym(), Side::Buy, 1.0))
        .unwrap();
    let pos = ex.position(&sym()).unwrap();
    assert_relative_eq!(pos.qty, 1.0);
    assert_relative_eq!(pos.entry_price, 100.0);
    assert_relative_eq!(ex.account().balance, 10_000.0);

    ex.mark_price(&sym(), 110.0);
    ex.place_order(OrderRequest::market(sym(), Side::Sell, 1.0))
        .unwrap();
    let pos = ex.position(&sym()).unwrap();
    assert_relative_eq!(pos.qty, 0.0);
    assert_relative_eq!(pos.entry_price, 0.0);
    assert_relative_eq!(pos.realized_pnl, 10.0);
    assert_relative_eq!(ex.account().balance, 10_010.0);
}

#[test]
fn test_reduce_only_partial_clamp() {
    // Long 2 at 50. A reduce-only sell limit for 5 at 60 is clamped to the
    // position size, realizes 20, leaves everything flat and no orders.
    let mut ex = engine();
    ex.mark_price(&sym(), 50.0);
    ex.place_order(OrderRequest::market(sym(), Side::Buy, 2.0))
        .unwrap();

    let mut req = OrderRequest::limit(sym(), Side::Sell, 5.0, 60.0);
    req.reduce_only = true;
    ex.place_order(req).unwrap();

    ex.on_bar(&bar(50.0, 60.0, 50.0, 60.0, 0)).unwrap();

    let pos = ex.position(&sym()).unwrap();
    assert_relative_eq!(pos.qty, 0.0);
    assert_relative_eq!(pos.realized_pnl, 20.0);
    assert_relative_eq!(ex.account().balance, 10_020.0);
    assert!(ex.open_orders(Some(&sym())).is_empty());

    let last_fill = ex.trade_log().last().unwrap();
    assert_relative_eq!(last_fill.qty, 2.0);
    assert_relative_eq!(last_fill.price, 60.0);
    assert!(last_fill.is_maker);
}

#[test]
fn test_funding_debit_on_long() {
    // Position +1 at entry 100, funding 0.0001 at the close of a flat bar
    // at 100: payment is +0.01, debited from the wallet.
    let mut ex = engine();
    ex.mark_price(&sym(), 100.0);
    ex.place_order(OrderRequest::market(sym(), Side::Buy, 1.0))
        .unwrap();
    ex.set_funding_events(vec![FundingEvent {
        funding_time: 60_000,
        funding_rate: 0.0001,
    }]);

    ex.on_bar(&bar(100.0, 100.0, 100.0, 100.0, 0)).unwrap();

    assert_relative_eq!(ex.account().balance, 9_999.99);
    assert_relative_eq!(ex.account().total_funding, 0.01);
    check_balance_identity(&ex, 10_000.0);
}

#[test]
fn test_funding_credit_on_short() {
    let mut ex = engine();
    ex.mark_price(&sym(), 100.0);
    ex.place_order(OrderRequest::market(sym(), Side::Sell, 1.0))
        .unwrap();
    ex.set_funding_events(vec![FundingEvent {
        funding_time: 60_000,
        funding_rate: 0.0001,
    }]);

    ex.on_bar(&bar(100.0, 100.0, 100.0, 100.0, 0)).unwrap();

    // Shorts receive positive funding: payment = (-1)(0.0001)(100) = -0.01.
    assert_relative_eq!(ex.account().balance, 10_000.01);
    assert_relative_eq!(ex.account().total_funding, -0.01);
}

#[test]
fn test_gap_through_limit_is_taker_at_open() {
    let mut ex = engine_with_fees(2.0, 4.0);
    ex.place_order(OrderRequest::limit(sym(), Side::Buy, 1.0, 100.0))
        .unwrap();

    ex.on_bar(&bar(95.0, 96.0, 90.0, 92.0, 0)).unwrap();

    let fill = &ex.trade_log()[0];
    assert_relative_eq!(fill.price, 95.0);
    assert!(!fill.is_maker);
    // Taker fee rate applied, not maker.
    assert_relative_eq!(fill.fee, 95.0 * 1.0 * 0.0004);
    check_balance_identity(&ex, 10_000.0);
}

#[test]
fn test_stop_limit_survives_bar_as_limit() {
    let mut ex = engine();
    let mut req = OrderRequest::limit(sym(), Side::Sell, 1.0, 90.0);
    req.order_type = OrderType::StopLimit;
    req.stop_price = Some(85.0);
    ex.place_order(req).unwrap();

    // Down-leg triggers the stop; the demoted limit at 90 cannot execute
    // within this up-first bar before the close at 110.
    ex.on_bar(&bar(100.0, 120.0, 80.0, 110.0, 0)).unwrap();

    let open = ex.open_orders(Some(&sym()));
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].order_type, OrderType::Limit);
    assert_eq!(open[0].stop_price, None);
    assert_eq!(open[0].status, OrderStatus::New);

    // A later bar trading through 90 fills it as a resting maker limit.
    ex.on_bar(&bar(88.0, 92.0, 86.0, 91.0, 60_001)).unwrap();
    assert!(ex.open_orders(Some(&sym())).is_empty());
    let fill = ex.trade_log().last().unwrap();
    assert_relative_eq!(fill.price, 90.0);
    assert!(fill.is_maker);
}

// =============================================================================
// Laws and invariants
// =============================================================================

#[test]
fn test_open_close_same_price_costs_only_fees() {
    let mut ex = engine_with_fees(2.0, 4.0);
    ex.mark_price(&sym(), 100.0);
    ex.place_order(OrderRequest::market(sym(), Side::Buy, 1.0))
        .unwrap();
    ex.place_order(OrderRequest::market(sym(), Side::Sell, 1.0))
        .unwrap();

    let pos = ex.position(&sym()).unwrap();
    assert!(pos.is_flat());

    let fees: f64 = ex.trade_log().iter().map(|t| t.fee).sum();
    assert!(fees > 0.0);
    assert_relative_eq!(ex.account().balance, 10_000.0 - fees);
    check_balance_identity(&ex, 10_000.0);
}

#[test]
fn test_submit_and_cancel_is_a_noop() {
    let mut ex = engine();
    let order = ex
        .place_order(OrderRequest::limit(sym(), Side::Buy, 1.0, 90.0))
        .unwrap();
    let canceled = ex.cancel(order.id).unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert!(ex.position(&sym()).is_none());
    assert_relative_eq!(ex.account().balance, 10_000.0);
    assert!(ex.trade_log().is_empty());
}

#[test]
fn test_cancel_all_returns_ids_for_symbol_only() {
    let mut ex = engine();
    let a = ex
        .place_order(OrderRequest::limit(sym(), Side::Buy, 1.0, 90.0))
        .unwrap();
    let b = ex
        .place_order(OrderRequest::limit(sym(), Side::Sell, 1.0, 110.0))
        .unwrap();
    let other = ex
        .place_order(OrderRequest::limit(
            Symbol::new("OTHER"),
            Side::Buy,
            1.0,
            90.0,
        ))
        .unwrap();

    let ids = ex.cancel_all(&sym());
    assert_eq!(ids, vec![a.id, b.id]);
    let remaining = ex.open_orders(None);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, other.id);
}

#[test]
fn test_balance_and_equity_identities_over_a_sequence() {
    let mut ex = engine_with_fees(2.0, 4.0);
    ex.set_funding_events(vec![
        FundingEvent {
            funding_time: 60_000,
            funding_rate: 0.0001,
        },
        FundingEvent {
            funding_time: 180_000,
            funding_rate: -0.0003,
        },
    ]);

    ex.place_order(OrderRequest::limit(sym(), Side::Buy, 2.0, 95.0))
        .unwrap();
    ex.on_bar(&bar(100.0, 105.0, 94.0, 96.0, 0)).unwrap();

    ex.place_order(OrderRequest::limit(sym(), Side::Sell, 1.0, 99.0))
        .unwrap();
    ex.on_bar(&bar(96.0, 100.0, 95.0, 98.0, 60_001)).unwrap();

    ex.mark_price(&sym(), 98.0);
    ex.place_order(OrderRequest::market(sym(), Side::Sell, 2.0))
        .unwrap();
    ex.on_bar(&bar(98.0, 99.0, 97.0, 97.5, 120_001)).unwrap();

    check_balance_identity(&ex, 10_000.0);

    // Equity sample equals balance + mark-to-market at the sample's close.
    let eq = ex.equity_log().last().unwrap();
    let unrealized: f64 = ex
        .positions()
        .map(|(s, p)| (ex.last_price(s).unwrap_or(p.entry_price) - p.entry_price) * p.qty)
        .sum();
    assert_relative_eq!(eq.equity, ex.account().balance + unrealized, epsilon = 1e-9);

    // Every order kept filled_qty within qty.
    for o in ex.open_orders(None) {
        assert!(o.filled_qty <= o.qty + 1e-12);
    }
}

#[test]
fn test_reduce_only_never_flips_sign() {
    let mut ex = engine();
    ex.mark_price(&sym(), 100.0);
    ex.place_order(OrderRequest::market(sym(), Side::Buy, 1.0))
        .unwrap();

    // Oversized reduce-only sell, repeatedly triggered across bars.
    let mut req = OrderRequest::limit(sym(), Side::Sell, 10.0, 101.0);
    req.reduce_only = true;
    ex.place_order(req).unwrap();

    for i in 0..3 {
        ex.on_bar(&bar(100.0, 102.0, 99.0, 100.0, i * 60_001)).unwrap();
        let qty = ex.position(&sym()).map(|p| p.qty).unwrap_or(0.0);
        assert!(qty >= 0.0, "position flipped to {qty}");
    }
    assert_relative_eq!(ex.position(&sym()).unwrap().qty, 0.0);
}

#[test]
fn test_fok_expires_when_not_fillable() {
    let mut ex = engine();
    let mut req = OrderRequest::limit(sym(), Side::Buy, 1.0, 50.0);
    req.tif = TimeInForce::Fok;
    ex.place_order(req).unwrap();

    ex.on_bar(&bar(100.0, 110.0, 95.0, 105.0, 0)).unwrap();
    assert!(ex.open_orders(None).is_empty());
    assert!(ex.trade_log().is_empty());
}

#[test]
fn test_reduce_only_market_clamps_at_submission() {
    // The requested quantity is clamped to the flattenable size before the
    // immediate execution, so the order completes and never rests.
    let mut ex = engine();
    ex.mark_price(&sym(), 100.0);
    ex.place_order(OrderRequest::market(sym(), Side::Buy, 2.0))
        .unwrap();

    let mut req = OrderRequest::market(sym(), Side::Sell, 5.0);
    req.reduce_only = true;
    let order = ex.place_order(req).unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_relative_eq!(order.filled_qty, 2.0);
    assert!(ex.open_orders(None).is_empty());
    assert!(ex.position(&sym()).unwrap().is_flat());
}

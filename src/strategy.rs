//! Strategy interface and registry
//!
//! Strategies are driven on bar boundaries: `on_bar` runs after the engine
//! has marked the bar's open price and before the matching step, so MARKET
//! orders submitted from it execute at the open (plus slippage). Strategies
//! are registered by name and constructed from a JSON parameter blob.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::info;

use crate::error::SimError;
use crate::executor::{Executor, OrderRequest};
use crate::types::{Bar, Side, Symbol};

/// Hook points invoked by the batch runner.
pub trait Strategy: Send {
    fn on_start(&mut self, _exec: &mut Executor) -> Result<(), SimError> {
        Ok(())
    }

    fn on_bar(&mut self, exec: &mut Executor, bar: &Bar) -> Result<(), SimError>;

    fn on_finish(&mut self, _exec: &mut Executor) -> Result<(), SimError> {
        Ok(())
    }
}

/// Create a strategy by registered name.
pub fn create_strategy(
    name: &str,
    symbol: Symbol,
    params: &Value,
) -> Result<Box<dyn Strategy>, SimError> {
    match name {
        "sma" => Ok(Box::new(SmaCross::from_params(symbol, params))),
        other => Err(SimError::InvalidParam(format!(
            "unknown strategy: {other}. Available: sma"
        ))),
    }
}

/// Fast/slow SMA cross, issuing MARKET orders to open and reverse.
///
/// Parameters: `fast` (default 5), `slow` (default 20), `qty` (default
/// 0.001 base units).
pub struct SmaCross {
    symbol: Symbol,
    fast: usize,
    slow: usize,
    qty: f64,
    closes: VecDeque<f64>,
    last_fast: Option<f64>,
    last_slow: Option<f64>,
}

impl SmaCross {
    pub fn new(symbol: Symbol, fast: usize, slow: usize, qty: f64) -> Self {
        Self {
            symbol,
            fast: fast.max(1),
            slow: slow.max(2),
            qty,
            closes: VecDeque::new(),
            last_fast: None,
            last_slow: None,
        }
    }

    pub fn from_params(symbol: Symbol, params: &Value) -> Self {
        let fast = params.get("fast").and_then(Value::as_u64).unwrap_or(5) as usize;
        let slow = params.get("slow").and_then(Value::as_u64).unwrap_or(20) as usize;
        let qty = params.get("qty").and_then(Value::as_f64).unwrap_or(0.001);
        Self::new(symbol, fast, slow, qty)
    }

    fn sma(&self, n: usize) -> f64 {
        let len = self.closes.len();
        let take = n.min(len);
        self.closes.iter().skip(len - take).sum::<f64>() / take as f64
    }
}

impl Strategy for SmaCross {
    fn on_start(&mut self, _exec: &mut Executor) -> Result<(), SimError> {
        info!(
            symbol = %self.symbol,
            fast = self.fast,
            slow = self.slow,
            qty = self.qty,
            "sma cross starting"
        );
        Ok(())
    }

    fn on_bar(&mut self, exec: &mut Executor, bar: &Bar) -> Result<(), SimError> {
        self.closes.push_back(bar.close);
        while self.closes.len() > self.slow {
            self.closes.pop_front();
        }
        if self.closes.len() < self.slow {
            // still warming up
            if self.last_fast.is_none() {
                self.last_fast = Some(bar.close);
                self.last_slow = Some(bar.close);
            }
            return Ok(());
        }

        let fast = self.sma(self.fast);
        let slow = self.sma(self.slow);

        let cross_up = matches!(
            (self.last_fast, self.last_slow),
            (Some(lf), Some(ls)) if lf <= ls && fast > slow
        );
        let cross_dn = matches!(
            (self.last_fast, self.last_slow),
            (Some(lf), Some(ls)) if lf >= ls && fast < slow
        );

        let pos_qty = exec.position(&self.symbol).map(|p| p.qty).unwrap_or(0.0);

        if cross_up && pos_qty <= 0.0 {
            let buy_qty = pos_qty.abs() + self.qty;
            exec.place_order(OrderRequest::market(self.symbol.clone(), Side::Buy, buy_qty))?;
        }
        if cross_dn && pos_qty >= 0.0 {
            let sell_qty = pos_qty.abs() + self.qty;
            exec.place_order(OrderRequest::market(
                self.symbol.clone(),
                Side::Sell,
                sell_qty,
            ))?;
        }

        self.last_fast = Some(fast);
        self.last_slow = Some(slow);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::build_executor;
    use crate::fill::OhlcPathFill;
    use crate::store::NullSink;

    fn engine() -> Executor {
        build_executor(
            10_000.0,
            0.0,
            0.0,
            Box::new(OhlcPathFill::new(true, 0.0)),
            0.0,
            Box::new(NullSink),
        )
    }

    fn bar(t0: i64, close: f64) -> Bar {
        Bar {
            open_time: t0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            close_time: t0 + 60_000,
            symbol: Symbol::new("TEST"),
        }
    }

    #[test]
    fn registry_rejects_unknown_names() {
        assert!(matches!(
            create_strategy("nope", Symbol::new("TEST"), &serde_json::json!({})),
            Err(SimError::InvalidParam(_))
        ));
    }

    #[test]
    fn sma_cross_goes_long_on_upturn() {
        let sym = Symbol::new("TEST");
        let mut strat = SmaCross::new(sym.clone(), 2, 3, 1.0);
        let mut exec = engine();

        // Downtrend to prime the averages, then a sharp reversal.
        let prices = [100.0, 98.0, 96.0, 94.0, 92.0, 100.0, 108.0];
        for (i, px) in prices.iter().enumerate() {
            let b = bar(i as i64 * 60_000, *px);
            exec.mark_price(&sym, b.open);
            strat.on_bar(&mut exec, &b).unwrap();
            exec.on_bar(&b).unwrap();
        }

        let pos = exec.position(&sym).expect("position opened");
        assert!(pos.qty > 0.0, "expected long, got {}", pos.qty);
    }

    #[test]
    fn sma_cross_reverses_rather_than_stacking() {
        let sym = Symbol::new("TEST");
        let mut strat = SmaCross::new(sym.clone(), 2, 3, 1.0);
        let mut exec = engine();

        // Up, then hard down: the short entry must also flatten the long.
        let prices = [90.0, 95.0, 100.0, 105.0, 110.0, 100.0, 90.0, 80.0];
        for (i, px) in prices.iter().enumerate() {
            let b = bar(i as i64 * 60_000, *px);
            exec.mark_price(&sym, b.open);
            strat.on_bar(&mut exec, &b).unwrap();
            exec.on_bar(&b).unwrap();
        }

        let qty = exec.position(&sym).map(|p| p.qty).unwrap_or(0.0);
        assert!(qty <= 0.0, "expected flat or short, got {qty}");
        assert!(qty.abs() <= 1.0 + 1e-9, "position stacked: {qty}");
    }
}

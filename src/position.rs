//! Net position tracking with weighted-average entry
//!
//! One-way positions: positive quantity is long, negative is short.
//! `entry_price` is the quantity-weighted average entry of the *current*
//! open size; realized PnL accumulates as exposure is reduced.

use serde::{Deserialize, Serialize};

use crate::types::{Symbol, EPS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Signed net quantity: > 0 long, < 0 short, 0 flat.
    pub qty: f64,
    /// Weighted-average entry of the open quantity (0.0 when flat).
    pub entry_price: f64,
    pub realized_pnl: f64,
}

impl Position {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            qty: 0.0,
            entry_price: 0.0,
            realized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty.abs() < EPS
    }

    /// Unrealized PnL at `mark` (0.0 when flat).
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        (mark - self.entry_price) * self.qty
    }

    /// Apply a trade to the position and return the *realized* PnL of this
    /// update.
    ///
    /// - Increasing same-side exposure: no realized PnL, entry VWAP update.
    /// - Reducing: realize on the closed portion, entry unchanged.
    /// - Closing / flipping: realize on the full old size; any remainder
    ///   opens the opposite side at `price`.
    pub fn update(&mut self, qty_change: f64, price: f64) -> f64 {
        // No existing position -> open fresh
        if self.qty.abs() < EPS {
            self.qty = qty_change;
            self.entry_price = price;
            return 0.0;
        }

        // Same direction (increase exposure)
        if self.qty * qty_change > 0.0 {
            let new_qty = self.qty + qty_change;
            self.entry_price = (self.entry_price * self.qty.abs() + price * qty_change.abs())
                / new_qty.abs();
            self.qty = new_qty;
            return 0.0;
        }

        // Opposite direction -> reduce / close / flip
        if qty_change.abs() < self.qty.abs() - EPS {
            // Partial reduction
            let closed_qty = qty_change.abs();
            let pnl = if self.qty > 0.0 {
                (price - self.entry_price) * closed_qty
            } else {
                (self.entry_price - price) * closed_qty
            };
            self.realized_pnl += pnl;
            self.qty += qty_change; // move towards zero
            if self.qty.abs() < EPS {
                self.qty = 0.0;
                self.entry_price = 0.0;
            }
            return pnl;
        }

        // Close completely and possibly flip
        let closed_qty = self.qty.abs();
        let pnl = if self.qty > 0.0 {
            (price - self.entry_price) * closed_qty
        } else {
            (self.entry_price - price) * closed_qty
        };
        self.realized_pnl += pnl;

        let new_open_qty = self.qty + qty_change; // sign of the new side
        if new_open_qty.abs() < EPS {
            self.qty = 0.0;
            self.entry_price = 0.0;
        } else {
            self.qty = new_open_qty;
            self.entry_price = price;
        }
        pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pos() -> Position {
        Position::new(Symbol::new("BTCUSDT"))
    }

    #[test]
    fn open_fresh_sets_entry_without_pnl() {
        let mut p = pos();
        let realized = p.update(2.0, 50_000.0);
        assert_eq!(realized, 0.0);
        assert_eq!(p.qty, 2.0);
        assert_eq!(p.entry_price, 50_000.0);
    }

    #[test]
    fn same_side_add_updates_vwap() {
        let mut p = pos();
        p.update(1.0, 50_000.0);
        let realized = p.update(1.0, 51_000.0);
        assert_eq!(realized, 0.0);
        assert_eq!(p.qty, 2.0);
        assert_relative_eq!(p.entry_price, 50_500.0);
    }

    #[test]
    fn partial_close_realizes_and_keeps_entry() {
        let mut p = pos();
        p.update(2.0, 50_000.0);
        let realized = p.update(-1.0, 52_000.0);
        assert_relative_eq!(realized, 2_000.0);
        assert_eq!(p.qty, 1.0);
        assert_eq!(p.entry_price, 50_000.0);
        assert_relative_eq!(p.realized_pnl, 2_000.0);
    }

    #[test]
    fn full_close_zeroes_entry() {
        let mut p = pos();
        p.update(1.0, 100.0);
        let realized = p.update(-1.0, 110.0);
        assert_relative_eq!(realized, 10.0);
        assert_eq!(p.qty, 0.0);
        assert_eq!(p.entry_price, 0.0);
        assert!(p.is_flat());
    }

    #[test]
    fn flip_reopens_opposite_side_at_fill_price() {
        let mut p = pos();
        p.update(1.0, 50_000.0);
        let realized = p.update(-2.0, 52_000.0);
        assert_relative_eq!(realized, 2_000.0);
        assert_eq!(p.qty, -1.0);
        assert_eq!(p.entry_price, 52_000.0);
    }

    #[test]
    fn short_side_pnl_signs() {
        let mut p = pos();
        p.update(-1.0, 100.0);
        // Short profits when price drops
        let realized = p.update(1.0, 90.0);
        assert_relative_eq!(realized, 10.0);
        assert!(p.is_flat());
    }

    #[test]
    fn flat_implies_zero_entry_after_any_sequence() {
        let mut p = pos();
        p.update(3.0, 100.0);
        p.update(-1.5, 105.0);
        p.update(-1.5, 95.0);
        assert!(p.is_flat());
        assert_eq!(p.entry_price, 0.0);
        assert_eq!(p.unrealized_pnl(123.0), 0.0);
    }
}

//! Account state: realized cash balance plus fee and funding carry totals
//!
//! `balance` excludes unrealized PnL; equity is computed by the executor as
//! balance plus mark-to-market across open positions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Wallet balance (realized only).
    pub balance: f64,
    pub starting_balance: f64,
    /// Maker fee as a fraction (e.g. 0.0002 = 2 bps).
    pub maker_fee: f64,
    /// Taker fee as a fraction.
    pub taker_fee: f64,
    pub total_fees: f64,
    /// Positive = paid out, negative = received.
    pub total_funding: f64,
}

impl Account {
    /// Build an account from fee rates expressed in basis points.
    pub fn from_bps(starting_balance: f64, maker_bps: f64, taker_bps: f64) -> Self {
        Self {
            balance: starting_balance,
            starting_balance,
            maker_fee: maker_bps / 10_000.0,
            taker_fee: taker_bps / 10_000.0,
            total_fees: 0.0,
            total_funding: 0.0,
        }
    }

    /// Fee rate for a fill with the given liquidity flag.
    pub fn fee_rate(&self, is_maker: bool) -> f64 {
        if is_maker {
            self.maker_fee
        } else {
            self.taker_fee
        }
    }

    /// Deduct a fee from the balance and accumulate the running total.
    pub fn apply_fee(&mut self, fee: f64) {
        self.balance -= fee;
        self.total_fees += fee;
    }

    /// Apply a funding payment: positive debits the wallet (longs pay
    /// positive funding), negative credits it.
    pub fn apply_funding(&mut self, payment: f64) {
        self.balance -= payment;
        self.total_funding += payment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn bps_conversion() {
        let acct = Account::from_bps(10_000.0, 2.0, 4.0);
        assert_relative_eq!(acct.maker_fee, 0.0002);
        assert_relative_eq!(acct.taker_fee, 0.0004);
        assert_eq!(acct.balance, 10_000.0);
    }

    #[test]
    fn fees_accumulate_and_debit() {
        let mut acct = Account::from_bps(1_000.0, 0.0, 0.0);
        acct.apply_fee(1.5);
        acct.apply_fee(0.5);
        assert_relative_eq!(acct.balance, 998.0);
        assert_relative_eq!(acct.total_fees, 2.0);
    }

    #[test]
    fn funding_sign_convention() {
        let mut acct = Account::from_bps(1_000.0, 0.0, 0.0);
        acct.apply_funding(0.01); // long pays
        assert_relative_eq!(acct.balance, 999.99);
        assert_relative_eq!(acct.total_funding, 0.01);
        acct.apply_funding(-0.02); // receives
        assert_relative_eq!(acct.balance, 1_000.01);
        assert_relative_eq!(acct.total_funding, -0.01);
    }
}

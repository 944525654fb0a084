//! Engine error taxonomy
//!
//! Flat set of error kinds surfaced synchronously at the operation boundary.
//! Sink failures are deliberately non-fatal: the executor logs them and keeps
//! processing bars.

use thiserror::Error;

/// Errors produced by the simulator core and its adapters.
#[derive(Debug, Error)]
pub enum SimError {
    /// Missing mandatory field or a non-parseable / out-of-range numeric.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Order type outside the supported set.
    #[error("unsupported order type: {0}")]
    UnsupportedType(String),

    /// MARKET order submitted before any bar established a price.
    #[error("no market price available for {0}")]
    NoMarketPrice(String),

    /// Cancel targeting an order id that is not resting.
    #[error("unknown order: {0}")]
    UnknownOrder(u64),

    /// Underlying data source failed, returned nothing, or handed us a bar
    /// that violates OHLC/time invariants.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Downstream persistence failed. Non-fatal for the engine.
    #[error("sink write failed: {0}")]
    SinkWriteFailed(String),

    /// Attempt to reopen a resource with incompatible options
    /// (e.g. writing through a read-only store).
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),
}

pub type SimResult<T> = Result<T, SimError>;

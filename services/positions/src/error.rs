//! Error types for position tracking

use storage::StorageError;
use thiserror::Error;

/// Position tracker errors
#[derive(Error, Debug)]
pub enum PositionError {
    /// No usable mark price and the fallback policy refuses to guess
    #[error("no mark price for {symbol} on {exchange}")]
    PriceUnavailable {
        /// Instrument
        symbol: String,
        /// Venue
        exchange: String,
    },

    /// Position does not exist
    #[error("position not found: {key}")]
    NotFound {
        /// Position key
        key: String,
    },

    /// Fill cannot be applied to this position
    #[error("invalid fill {trade_id}: {reason}")]
    InvalidFill {
        /// Exchange trade id
        trade_id: String,
        /// What was wrong
        reason: String,
    },

    /// Event store failure; the in-memory state is kept and the write is queued
    #[error("persisting {key} failed: {source}")]
    Persistence {
        /// Position key
        key: String,
        /// Underlying store error
        #[source]
        source: StorageError,
    },

    /// Recovery could not fold stored history
    #[error("recovery failed: {0}")]
    Recovery(#[from] StorageError),
}

/// Result type for position operations
pub type PositionResult<T> = Result<T, PositionError>;

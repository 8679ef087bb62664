//! Error types for the execution service

use oms::OmsError;
use perf::PerfError;
use positions::PositionError;
use storage::StorageError;
use thiserror::Error;

/// Execution service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Order manager refused or failed the operation
    #[error(transparent)]
    Oms(#[from] OmsError),

    /// Position tracker refused or failed the operation
    #[error(transparent)]
    Position(#[from] PositionError),

    /// Event store could not be opened or migrated
    #[error("Store error: {0}")]
    Storage(#[from] StorageError),

    /// Worker thread could not be started
    #[error("Worker error: {0}")]
    Worker(#[from] PerfError),

    /// Configuration could not be read or is out of bounds
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// `start` called on a running service
    #[error("Service already started")]
    AlreadyStarted,
}

impl ServiceError {
    /// Build a `Configuration` error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Type alias for service results
pub type ServiceResult<T> = Result<T, ServiceError>;

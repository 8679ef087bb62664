//! Error types for the Order Management System

use crate::adapter::AdapterError;
use crate::order::OrderStatus;
use common::Qty;
use storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// OMS-specific error types
#[derive(Error, Debug)]
pub enum OmsError {
    /// Order request failed validation; nothing was created
    #[error("Validation error: {message}")]
    Validation {
        /// Detailed validation error message
        message: String,
    },

    /// Order not found in the system
    #[error("Order not found: {order_id}")]
    OrderNotFound {
        /// The identifier of the order that could not be found
        order_id: Uuid,
    },

    /// Order is in an invalid state for the requested operation
    #[error("Order {order_id} cannot be {operation} in current state {status}")]
    InvalidOrderState {
        /// The identifier of the order in invalid state
        order_id: Uuid,
        /// The operation that was attempted on the order
        operation: &'static str,
        /// The current state of the order that prevents the operation
        status: OrderStatus,
    },

    /// No adapter is registered for the order's exchange
    #[error("No adapter registered for exchange {exchange}")]
    UnknownExchange {
        /// Exchange name from the order
        exchange: String,
    },

    /// Exchange call failed after the retry budget was spent
    #[error("Routing {stage} for order {order_id} failed after {attempts} attempts: {source}")]
    Routing {
        /// Order being routed
        order_id: Uuid,
        /// Exchange operation (submit, cancel, modify)
        stage: &'static str,
        /// Attempts made, including the first
        attempts: u32,
        /// Last error from the adapter
        #[source]
        source: AdapterError,
    },

    /// Event store write failed; the events are queued for retry
    #[error("Persisting {stage} for order {order_id} failed: {source}")]
    Persistence {
        /// Order whose events were not written
        order_id: Uuid,
        /// Change being persisted
        stage: &'static str,
        /// Underlying store error
        #[source]
        source: StorageError,
    },

    /// Fill would take filled quantity past order quantity
    #[error("Fill of {fill_quantity} overfills order {order_id} with {remaining} remaining")]
    Overfill {
        /// Order receiving the fill
        order_id: Uuid,
        /// Quantity of the offending fill
        fill_quantity: Qty,
        /// Quantity the order still had open
        remaining: Qty,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Configuration error message detailing what went wrong
        message: String,
    },

    /// Recovery could not rebuild state from the event store
    #[error("Recovery failed: {0}")]
    Recovery(#[from] StorageError),
}

impl OmsError {
    /// Build a `Validation` error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Type alias for OMS results
pub type OmsResult<T> = Result<T, OmsError>;

//! Order Management System (OMS)
//!
//! Order lifecycle management with exchange routing, retry and
//! event-sourced persistence.
//!
//! Features:
//! - Order lifecycle (Pending → New → PartiallyFilled → Filled/Canceled/Rejected)
//! - Routing through pluggable exchange adapters with bounded retry
//! - Idempotent fill application
//! - Every transition journaled to the event store, with snapshots
//! - Crash recovery by replay
//! - Outbox for writes the store refused

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use positions::Fill;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

pub mod adapter;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod order;
pub mod recovery;
pub mod retry;

pub use adapter::{AdapterError, AdapterRegistry, ExchangeAdapter, SimulatedExchange, SubmitAck};
pub use error::{OmsError, OmsResult};
pub use events::OrderChange;
pub use lifecycle::OrderLifecycleManager;
pub use manager::{FillOutcome, OrderManager, OrderStatusUpdate, PlacedOrder};
pub use order::{Order, OrderRequest, OrderStatus, OrderType, TimeInForce};
pub use recovery::{Discrepancy, RecoveryStats, check_order};
pub use retry::{Attempted, BackoffType, Retrier, RetryClassifier, RetryFailure, RetryPolicy};

/// OMS Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmsConfig {
    /// Retry policy around exchange calls
    pub retry: RetryPolicy,
    /// Deadline for a single exchange call (milliseconds)
    pub routing_timeout_ms: u64,
    /// Terminal orders kept in memory per strategy
    pub max_history_per_strategy: usize,
    /// Snapshot every N events per order, 0 disables
    pub snapshot_every: u64,
    /// Capacity of the order event broadcast
    pub event_buffer_size: usize,
}

impl Default for OmsConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            routing_timeout_ms: 2_000,
            max_history_per_strategy: 10_000,
            snapshot_every: 100,
            event_buffer_size: 10_000,
        }
    }
}

impl OmsConfig {
    /// Check bounds
    pub fn validate(&self) -> OmsResult<()> {
        self.retry
            .validate()
            .map_err(|message| OmsError::Configuration { message })?;
        if self.routing_timeout_ms == 0 {
            return Err(OmsError::Configuration {
                message: "routing_timeout_ms must be positive".to_string(),
            });
        }
        if self.max_history_per_strategy == 0 || self.event_buffer_size == 0 {
            return Err(OmsError::Configuration {
                message: "history and event buffer sizes must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Per-call routing deadline
    #[must_use]
    pub const fn routing_timeout(&self) -> Duration {
        Duration::from_millis(self.routing_timeout_ms)
    }
}

/// Order event for broadcasting
#[derive(Debug, Clone)]
pub enum OrderEvent {
    /// Order created and about to be routed
    Created(Order),
    /// Exchange acknowledged the order
    Accepted(Order),
    /// Order rejected locally or by the venue
    Rejected(Order),
    /// Fill applied
    Filled {
        /// Order after the fill
        order: Order,
        /// Fill details
        fill: Fill,
    },
    /// Cancel acknowledged
    Canceled(Order),
    /// Modification acknowledged
    Modified(Order),
    /// Venue-reported status applied
    StatusChanged {
        /// Order after the change
        order: Order,
        /// Previous status
        old_status: OrderStatus,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },
}

impl OrderEvent {
    /// Order the event is about
    #[must_use]
    pub const fn order_id(&self) -> Uuid {
        match self {
            Self::Created(order)
            | Self::Accepted(order)
            | Self::Rejected(order)
            | Self::Canceled(order)
            | Self::Modified(order)
            | Self::Filled { order, .. }
            | Self::StatusChanged { order, .. } => order.id,
        }
    }
}

/// OMS counters
#[derive(Debug, Default)]
pub struct OmsMetrics {
    /// Orders that passed validation
    pub orders_created: AtomicU64,
    /// Orders that reached Filled
    pub orders_filled: AtomicU64,
    /// Orders canceled
    pub orders_canceled: AtomicU64,
    /// Orders rejected locally or by the venue
    pub orders_rejected: AtomicU64,
    /// Requests refused by validation
    pub validation_failures: AtomicU64,
    /// Extra routing attempts beyond the first
    pub routing_retries: AtomicU64,
    /// Event store writes that failed
    pub persistence_failures: AtomicU64,
    /// Fills applied
    pub total_fills: AtomicU64,
    /// Fills ignored as duplicates
    pub duplicate_fills: AtomicU64,
    /// Sum of creation-to-filled times (microseconds)
    pub fill_time_total_us: AtomicU64,
    /// Orders contributing to `fill_time_total_us`
    pub fill_time_count: AtomicU64,
    /// Sum of placement-to-acknowledgement latency (microseconds)
    pub ack_latency_total_us: AtomicU64,
    /// Acknowledgements contributing to `ack_latency_total_us`
    pub ack_count: AtomicU64,
}

impl OmsMetrics {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn record_fill_time(&self, elapsed: Duration) {
        self.fill_time_total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.fill_time_count.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn record_ack(&self, latency: Duration) {
        self.ack_latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.ack_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> OmsMetricsSnapshot {
        let average = |total: &AtomicU64, count: &AtomicU64| {
            let count = count.load(Ordering::Relaxed);
            if count == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total.load(Ordering::Relaxed) / count)
            }
        };
        OmsMetricsSnapshot {
            orders_created: self.orders_created.load(Ordering::Relaxed),
            orders_filled: self.orders_filled.load(Ordering::Relaxed),
            orders_canceled: self.orders_canceled.load(Ordering::Relaxed),
            orders_rejected: self.orders_rejected.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            routing_retries: self.routing_retries.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            total_fills: self.total_fills.load(Ordering::Relaxed),
            duplicate_fills: self.duplicate_fills.load(Ordering::Relaxed),
            avg_fill_time: average(&self.fill_time_total_us, &self.fill_time_count),
            avg_ack_latency: average(&self.ack_latency_total_us, &self.ack_count),
            active_orders: 0,
            pending_reconciliation: 0,
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OmsMetricsSnapshot {
    /// Orders that passed validation
    pub orders_created: u64,
    /// Orders that reached Filled
    pub orders_filled: u64,
    /// Orders canceled
    pub orders_canceled: u64,
    /// Orders rejected
    pub orders_rejected: u64,
    /// Requests refused by validation
    pub validation_failures: u64,
    /// Extra routing attempts
    pub routing_retries: u64,
    /// Failed event store writes
    pub persistence_failures: u64,
    /// Fills applied
    pub total_fills: u64,
    /// Duplicate fills ignored
    pub duplicate_fills: u64,
    /// Mean creation-to-filled time
    pub avg_fill_time: Duration,
    /// Mean placement-to-acknowledgement latency
    pub avg_ack_latency: Duration,
    /// Orders in the active index
    pub active_orders: usize,
    /// Orders with events waiting in the outbox
    pub pending_reconciliation: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OmsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = OmsConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            ..OmsConfig::default()
        };
        assert!(matches!(config.validate(), Err(OmsError::Configuration { .. })));
    }

    #[test]
    fn test_averages() {
        let metrics = OmsMetrics::default();
        assert_eq!(metrics.snapshot().avg_fill_time, Duration::ZERO);
        metrics.record_fill_time(Duration::from_millis(10));
        metrics.record_fill_time(Duration::from_millis(30));
        assert_eq!(metrics.snapshot().avg_fill_time, Duration::from_millis(20));
    }
}

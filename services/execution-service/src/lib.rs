//! Execution Service
//!
//! Takes orders from strategies to filled, marked positions:
//! - Order placement, cancel and modify through the order manager
//! - Fills applied to orders, then booked to positions
//! - Ticks kept in the price cache used for marking
//! - Bounded drop-on-full queues drained by one worker each
//! - Optional core-pinned workers
//! - Periodic maintenance and metrics logging
//!
//! Everything is wired explicitly by [`ExecutionService::new`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod service;

pub use config::{QueueConfig, ServiceConfig, StoreConfig};
pub use error::{ServiceError, ServiceResult};
pub use metrics::{ServiceMetrics, WorkerStats};
pub use queue::QueueDrops;
pub use service::{ExecutionService, PositionUpdate, RecoveryReport};

//! Exchange adapter seam
//!
//! The order manager talks to venues only through [`ExchangeAdapter`].
//! Adapters are registered per exchange name and looked up from the
//! order's `exchange` field.

use crate::order::Order;
use async_trait::async_trait;
use common::{Px, Qty};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Exchange answer to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAck {
    /// Order is working at the venue
    Accepted {
        /// Venue-assigned id
        exchange_order_id: String,
    },
    /// Venue refused the order
    Rejected {
        /// Venue reason
        reason: String,
    },
}

/// Failure talking to an exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Call did not complete within the deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Venue refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    /// Transient failures worth another attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connectivity(_))
    }
}

/// A venue the order manager can route to
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Exchange name orders are routed by
    fn exchange(&self) -> &str;

    /// Submit a new order
    async fn submit(&self, order: &Order) -> Result<SubmitAck, AdapterError>;

    /// Cancel a working order
    async fn cancel(&self, exchange_order_id: &str) -> Result<(), AdapterError>;

    /// Replace price and/or quantity of a working order
    async fn modify(&self, exchange_order_id: &str, price: Option<Px>, quantity: Qty) -> Result<(), AdapterError>;
}

/// Adapters by exchange name
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: FxHashMap<String, Arc<dyn ExchangeAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its exchange name, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        debug!("Registered adapter for {}", adapter.exchange());
        self.adapters.insert(adapter.exchange().to_string(), adapter);
    }

    /// Builder form of [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for an exchange
    #[must_use]
    pub fn get(&self, exchange: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(exchange).cloned()
    }

    /// Registered exchange names, sorted
    #[must_use]
    pub fn exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("exchanges", &self.exchanges())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    failure: Option<AdapterError>,
    reject_reason: Option<String>,
    stall: Option<Duration>,
}

/// In-process venue that acknowledges everything, with fault injection
/// for exercising retry and rejection paths.
#[derive(Debug)]
pub struct SimulatedExchange {
    name: String,
    latency: Duration,
    next_id: AtomicU64,
    submits: AtomicU32,
    cancels: AtomicU32,
    modifies: AtomicU32,
    faults: Mutex<Faults>,
}

impl SimulatedExchange {
    /// Venue named `name` that answers immediately
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            next_id: AtomicU64::new(1),
            submits: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
            modifies: AtomicU32::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Add a fixed delay to every call
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` calls with `error`
    pub fn fail_next(&self, count: u32, error: AdapterError) {
        let mut faults = self.faults.lock();
        faults.fail_next = count;
        faults.failure = Some(error);
    }

    /// Reject every submission with `reason`, or stop rejecting with `None`
    pub fn reject_submissions(&self, reason: Option<&str>) {
        self.faults.lock().reject_reason = reason.map(str::to_string);
    }

    /// Hold every call for `delay` before answering, or stop with `None`
    pub fn stall(&self, delay: Option<Duration>) {
        self.faults.lock().stall = delay;
    }

    /// Submit calls received, including failed ones
    #[must_use]
    pub fn submit_calls(&self) -> u32 {
        self.submits.load(Ordering::Relaxed)
    }

    /// Cancel calls received, including failed ones
    #[must_use]
    pub fn cancel_calls(&self) -> u32 {
        self.cancels.load(Ordering::Relaxed)
    }

    /// Modify calls received, including failed ones
    #[must_use]
    pub fn modify_calls(&self) -> u32 {
        self.modifies.load(Ordering::Relaxed)
    }

    async fn call(&self) -> Result<(), AdapterError> {
        let (stall, injected) = {
            let mut faults = self.faults.lock();
            let injected = if faults.fail_next > 0 {
                faults.fail_next -= 1;
                faults.failure.clone()
            } else {
                None
            };
            (faults.stall, injected)
        };
        let delay = self.latency + stall.unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        injected.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchange {
    fn exchange(&self) -> &str {
        &self.name
    }

    async fn submit(&self, order: &Order) -> Result<SubmitAck, AdapterError> {
        self.submits.fetch_add(1, Ordering::Relaxed);
        self.call().await?;
        if let Some(reason) = self.faults.lock().reject_reason.clone() {
            return Ok(SubmitAck::Rejected { reason });
        }
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("{} accepted order {} as {}-{}", self.name, order.id, self.name, seq);
        Ok(SubmitAck::Accepted {
            exchange_order_id: format!("{}-{}", self.name, seq),
        })
    }

    async fn cancel(&self, exchange_order_id: &str) -> Result<(), AdapterError> {
        self.cancels.fetch_add(1, Ordering::Relaxed);
        self.call().await?;
        debug!("{} canceled {}", self.name, exchange_order_id);
        Ok(())
    }

    async fn modify(&self, exchange_order_id: &str, price: Option<Px>, quantity: Qty) -> Result<(), AdapterError> {
        self.modifies.fetch_add(1, Ordering::Relaxed);
        self.call().await?;
        debug!("{} modified {} to {} @ {:?}", self.name, exchange_order_id, quantity, price);
        Ok(())
    }
}

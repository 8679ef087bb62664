//! Shared fixtures for OMS tests

#![allow(dead_code)]

use ::common::{Px, Qty, Side};
use oms::{AdapterRegistry, OmsConfig, OrderManager, OrderRequest, RetryPolicy, SimulatedExchange};
use positions::Fill;
use std::sync::{Arc, Once};
use storage::MemoryEventStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "oms=debug,warn".into()))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

pub const STRATEGY: &str = "momentum";
pub const SYMBOL: &str = "BTC-USD";
pub const EXCHANGE: &str = "X";

/// Millisecond backoff so retry tests stay fast
pub fn fast_config() -> OmsConfig {
    OmsConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryPolicy::default()
        },
        routing_timeout_ms: 200,
        snapshot_every: 4,
        ..OmsConfig::default()
    }
}

/// Manager wired to one simulated venue and an in-memory store
pub struct Harness {
    pub store: Arc<MemoryEventStore>,
    pub venue: Arc<SimulatedExchange>,
    pub manager: OrderManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: OmsConfig) -> Self {
        init_test_logging();
        let store = Arc::new(MemoryEventStore::new());
        let venue = Arc::new(SimulatedExchange::new(EXCHANGE));
        let manager = OrderManager::new(config, Self::registry(&venue), store.clone()).expect("valid config");
        Self { store, venue, manager }
    }

    /// Fresh manager over the same store and venue
    pub fn restart(&self) -> OrderManager {
        OrderManager::new(fast_config(), Self::registry(&self.venue), self.store.clone()).expect("valid config")
    }

    fn registry(venue: &Arc<SimulatedExchange>) -> AdapterRegistry {
        AdapterRegistry::new().with(venue.clone())
    }
}

pub fn buy_limit(qty: i64, px: i64) -> OrderRequest {
    OrderRequest::limit(STRATEGY, SYMBOL, EXCHANGE, Side::Buy, Qty::from_int(qty), Px::from_int(px))
}

pub fn fill(order_id: Uuid, trade_id: &str, qty: i64, px: i64) -> Fill {
    Fill::new(order_id, trade_id, SYMBOL, EXCHANGE, Side::Buy, Qty::from_int(qty), Px::from_int(px))
}

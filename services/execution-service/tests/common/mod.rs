//! Shared fixtures for execution service tests

#![allow(dead_code)]

use ::common::{Px, Qty, Side};
use execution_service::{ExecutionService, ServiceConfig};
use oms::{AdapterRegistry, OrderRequest, SimulatedExchange};
use positions::{Fill, PriceCache};
use std::sync::{Arc, Once};
use std::time::Duration;
use storage::MemoryEventStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "execution_service=debug,oms=info,positions=info,warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

pub const STRATEGY: &str = "momentum";
pub const SYMBOL: &str = "BTC-USD";
pub const EXCHANGE: &str = "X";

/// Small queues, fast retries, quiet monitoring
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.oms.retry.initial_delay_ms = 1;
    config.oms.retry.max_delay_ms = 5;
    config.oms.routing_timeout_ms = 200;
    config.pools.preallocate_ticks = 4;
    config.pools.preallocate_books = 2;
    config.pools.preallocate_orders = 4;
    config.monitoring_interval_ms = 60_000;
    config
}

/// Service on an in-memory store with one simulated venue
pub struct Harness {
    pub store: Arc<MemoryEventStore>,
    pub venue: Arc<SimulatedExchange>,
    pub prices: Arc<PriceCache>,
    pub service: ExecutionService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        init_test_logging();
        Self::build(config, Arc::new(MemoryEventStore::new()))
    }

    /// Fresh service over the same store, not started
    pub fn restart(&self) -> Self {
        Self::build(self.service.config().clone(), Arc::clone(&self.store))
    }

    fn build(config: ServiceConfig, store: Arc<MemoryEventStore>) -> Self {
        let venue = Arc::new(SimulatedExchange::new(EXCHANGE));
        let adapters = AdapterRegistry::new().with(venue.clone());
        let prices = Arc::new(PriceCache::new(Duration::from_millis(config.positions.price_max_age_ms)));
        let service = ExecutionService::new(config, adapters, store.clone(), prices.clone())
            .expect("service should build from a valid config");
        Self {
            store,
            venue,
            prices,
            service,
        }
    }
}

pub fn limit(side: Side, qty: i64, px: i64) -> OrderRequest {
    OrderRequest::limit(STRATEGY, SYMBOL, EXCHANGE, side, Qty::from_int(qty), Px::from_int(px))
}

pub fn fill(order_id: Uuid, trade_id: &str, side: Side, qty: i64, px: i64) -> Fill {
    Fill::new(order_id, trade_id, SYMBOL, EXCHANGE, side, Qty::from_int(qty), Px::from_int(px))
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

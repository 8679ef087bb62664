//! Shared fixtures for position tracker tests

#![allow(dead_code)]

use ::common::{Px, Qty, Side};
use positions::{Fill, PositionConfig, PositionTracker, PriceCache};
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
            .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "positions=debug,warn".into()))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

pub const STRATEGY: &str = "momentum";
pub const SYMBOL: &str = "BTC-USD";
pub const EXCHANGE: &str = "X";

/// Tracker wired to an in-memory store and a price cache
pub struct Harness {
    pub store: Arc<MemoryEventStore>,
    pub prices: Arc<PriceCache>,
    pub tracker: PositionTracker,
}

impl Harness {
    pub fn new(config: PositionConfig) -> Self {
        init_test_logging();
        let store = Arc::new(MemoryEventStore::new());
        let prices = Arc::new(PriceCache::new(Duration::from_millis(config.price_max_age_ms)));
        let tracker = PositionTracker::new(config, store.clone(), prices.clone());
        Self { store, prices, tracker }
    }

    /// Fresh tracker over the same store and prices
    pub fn restart(&self, config: PositionConfig) -> PositionTracker {
        PositionTracker::new(config, self.store.clone(), self.prices.clone())
    }
}

pub fn fill(trade_id: &str, side: Side, qty: i64, px: i64) -> Fill {
    Fill::new(Uuid::new_v4(), trade_id, SYMBOL, EXCHANGE, side, Qty::from_int(qty), Px::from_int(px))
}

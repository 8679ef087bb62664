//! Pooled hot-path types and the pool set that owns them

use crate::pool::{ObjectPool, PoolStats, Poolable};
use common::{Px, Qty, Side};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Small buffer tier
pub const SMALL_BUFFER: usize = 1024;
/// Medium buffer tier
pub const MEDIUM_BUFFER: usize = 8 * 1024;
/// Large buffer tier
pub const LARGE_BUFFER: usize = 64 * 1024;

/// Order ticket handed from a strategy to the execution service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PooledOrder {
    /// Caller-chosen id, echoed back on the placed order
    pub client_order_id: String,
    /// Owning strategy
    pub strategy_id: String,
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
    /// Direction
    pub side: Side,
    /// Quantity
    pub quantity: Qty,
    /// Limit price; `None` for market orders
    pub price: Option<Px>,
    /// Nanosecond timestamp the signal was generated at
    pub signal_ts_ns: u64,
}

impl Poolable for PooledOrder {
    fn reset(&mut self) {
        self.client_order_id.clear();
        self.strategy_id.clear();
        self.symbol.clear();
        self.exchange.clear();
        self.side = Side::Buy;
        self.quantity = Qty::ZERO;
        self.price = None;
        self.signal_ts_ns = 0;
    }
}

/// Top-of-book market data update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketTick {
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
    /// Best bid
    pub bid: Px,
    /// Best ask
    pub ask: Px,
    /// Last trade price
    pub last: Px,
    /// Traded volume
    pub volume: Qty,
    /// Exchange timestamp in nanoseconds
    pub timestamp_ns: u64,
}

impl MarketTick {
    /// Price used for marking positions: last trade, else mid
    #[must_use]
    pub fn mark_price(&self) -> Option<Px> {
        if self.last.is_positive() {
            Some(self.last)
        } else if self.bid.is_positive() && self.ask.is_positive() {
            Some(Px::from_i64((self.bid.as_i64() + self.ask.as_i64()) / 2))
        } else {
            None
        }
    }
}

impl Poolable for MarketTick {
    fn reset(&mut self) {
        self.symbol.clear();
        self.exchange.clear();
        self.bid = Px::ZERO;
        self.ask = Px::ZERO;
        self.last = Px::ZERO;
        self.volume = Qty::ZERO;
        self.timestamp_ns = 0;
    }
}

/// Aggregated depth at one price
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceLevel {
    /// Level price
    pub price: Px,
    /// Resting quantity
    pub quantity: Qty,
    /// Number of orders at the level
    pub orders: u32,
}

/// Depth snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBookSnapshot {
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
    /// Bids, best first
    pub bids: Vec<PriceLevel>,
    /// Asks, best first
    pub asks: Vec<PriceLevel>,
    /// Exchange sequence number
    pub sequence: u64,
    /// Exchange timestamp in nanoseconds
    pub timestamp_ns: u64,
}

impl OrderBookSnapshot {
    /// Book with level vectors pre-sized to `depth`
    #[must_use]
    pub fn with_depth(depth: usize) -> Self {
        Self {
            bids: Vec::with_capacity(depth),
            asks: Vec::with_capacity(depth),
            ..Self::default()
        }
    }

    /// Best bid/ask midpoint
    #[must_use]
    pub fn mid(&self) -> Option<Px> {
        let bid = self.bids.first()?.price;
        let ask = self.asks.first()?.price;
        Some(Px::from_i64((bid.as_i64() + ask.as_i64()) / 2))
    }
}

impl Poolable for OrderBookSnapshot {
    fn reset(&mut self) {
        self.symbol.clear();
        self.exchange.clear();
        self.bids.clear();
        self.asks.clear();
        self.sequence = 0;
        self.timestamp_ns = 0;
    }
}

/// Pool sizes and warm-up counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle order tickets kept
    pub orders: usize,
    /// Idle ticks kept
    pub ticks: usize,
    /// Idle book snapshots kept
    pub books: usize,
    /// Levels reserved per side in new book snapshots
    pub book_depth: usize,
    /// Idle 1 KiB buffers kept
    pub small_buffers: usize,
    /// Idle 8 KiB buffers kept
    pub medium_buffers: usize,
    /// Idle 64 KiB buffers kept
    pub large_buffers: usize,
    /// Order tickets built at startup
    pub preallocate_orders: usize,
    /// Ticks built at startup
    pub preallocate_ticks: usize,
    /// Book snapshots built at startup
    pub preallocate_books: usize,
    /// Buffers of each tier built at startup
    pub preallocate_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            orders: 1000,
            ticks: 5000,
            books: 1000,
            book_depth: 20,
            small_buffers: 500,
            medium_buffers: 200,
            large_buffers: 100,
            preallocate_orders: 100,
            preallocate_ticks: 500,
            preallocate_books: 100,
            preallocate_buffers: 50,
        }
    }
}

/// Byte buffers in three size tiers
#[derive(Debug)]
pub struct BufferPool {
    small: ObjectPool<Vec<u8>>,
    medium: ObjectPool<Vec<u8>>,
    large: ObjectPool<Vec<u8>>,
    oversize: AtomicU64,
}

impl BufferPool {
    /// Create the three tiers with the given idle bounds
    #[must_use]
    pub fn new(small: usize, medium: usize, large: usize) -> Self {
        Self {
            small: ObjectPool::new("buffer_1k", small, || Vec::with_capacity(SMALL_BUFFER)),
            medium: ObjectPool::new("buffer_8k", medium, || Vec::with_capacity(MEDIUM_BUFFER)),
            large: ObjectPool::new("buffer_64k", large, || Vec::with_capacity(LARGE_BUFFER)),
            oversize: AtomicU64::new(0),
        }
    }

    /// Buffer with capacity for at least `size` bytes
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        match size {
            s if s <= SMALL_BUFFER => self.small.take(),
            s if s <= MEDIUM_BUFFER => self.medium.take(),
            s if s <= LARGE_BUFFER => self.large.take(),
            _ => {
                self.oversize.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(size)
            }
        }
    }

    /// Return a buffer to the tier its capacity serves
    pub fn release(&self, buffer: Vec<u8>) -> bool {
        match buffer.capacity() {
            c if c >= LARGE_BUFFER => self.large.release(buffer),
            c if c >= MEDIUM_BUFFER => self.medium.release(buffer),
            c if c >= SMALL_BUFFER => self.small.release(buffer),
            _ => false,
        }
    }

    /// Requests too big for any tier
    #[must_use]
    pub fn oversize_requests(&self) -> u64 {
        self.oversize.load(Ordering::Relaxed)
    }

    fn preallocate(&self, count: usize) -> usize {
        self.small.preallocate(count) + self.medium.preallocate(count) + self.large.preallocate(count)
    }
}

/// Counters of every pool in a [`MemoryPools`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPoolStats {
    /// Order ticket pool
    pub orders: PoolStats,
    /// Tick pool
    pub ticks: PoolStats,
    /// Book pool
    pub books: PoolStats,
    /// 1 KiB tier
    pub small_buffers: PoolStats,
    /// 8 KiB tier
    pub medium_buffers: PoolStats,
    /// 64 KiB tier
    pub large_buffers: PoolStats,
    /// Buffer requests above the largest tier
    pub oversize_buffers: u64,
}

/// All hot-path pools, constructed once and shared by handle
#[derive(Debug)]
pub struct MemoryPools {
    /// Order tickets
    pub orders: ObjectPool<PooledOrder>,
    /// Market ticks
    pub ticks: ObjectPool<MarketTick>,
    /// Book snapshots
    pub books: ObjectPool<OrderBookSnapshot>,
    /// Byte buffers
    pub buffers: BufferPool,
    config: PoolConfig,
}

impl MemoryPools {
    /// Build empty pools sized from `config`
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let depth = config.book_depth;
        Self {
            orders: ObjectPool::with_default("orders", config.orders),
            ticks: ObjectPool::with_default("ticks", config.ticks),
            books: ObjectPool::new("books", config.books, move || OrderBookSnapshot::with_depth(depth)),
            buffers: BufferPool::new(config.small_buffers, config.medium_buffers, config.large_buffers),
            config: config.clone(),
        }
    }

    /// Warm every pool with the configured counts
    pub fn preallocate(&self) {
        let orders = self.orders.preallocate(self.config.preallocate_orders);
        let ticks = self.ticks.preallocate(self.config.preallocate_ticks);
        let books = self.books.preallocate(self.config.preallocate_books);
        let buffers = self.buffers.preallocate(self.config.preallocate_buffers);
        info!(
            "Pools warmed: {} orders, {} ticks, {} books, {} buffers",
            orders, ticks, books, buffers
        );
    }

    /// Counter snapshot across all pools
    pub fn stats(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            orders: self.orders.stats(),
            ticks: self.ticks.stats(),
            books: self.books.stats(),
            small_buffers: self.buffers.small.stats(),
            medium_buffers: self.buffers.medium.stats(),
            large_buffers: self.buffers.large.stats(),
            oversize_buffers: self.buffers.oversize_requests(),
        }
    }
}

//! Latency-sensitive building blocks shared by the execution core
//!
//! - [`pool`] / [`memory`]: fail-open object pools for orders, ticks, books
//!   and byte buffers
//! - [`latency`]: trace-based latency tracking with smoothed percentiles
//! - [`affinity`]: CPU topology, workload-to-core assignment, pinned threads
//!
//! Nothing here is global. Build each piece once at startup and hand out
//! `Arc`s.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod affinity;
pub mod error;
pub mod latency;
pub mod memory;
pub mod pool;

pub use affinity::{
    AffinityConfig, AffinityManager, Assignment, CoreSelector, CpuCore, CpuTopology, PinnedThread, SelectionContext,
    SelectionStrategy, ThreadManager, WorkloadType,
};
pub use error::{PerfError, PerfResult};
pub use latency::{CompletedTrace, LatencyConfig, LatencyPoint, LatencyStats, LatencyTracker};
pub use memory::{
    BufferPool, MarketTick, MemoryPoolStats, MemoryPools, OrderBookSnapshot, PoolConfig, PooledOrder, PriceLevel,
};
pub use pool::{ObjectPool, PoolStats, Poolable, Pooled};

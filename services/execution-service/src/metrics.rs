//! Service-level metrics

use crate::queue::QueueDrops;
use oms::OmsMetricsSnapshot;
use perf::{LatencyPoint, LatencyStats, MemoryPoolStats};
use positions::TrackerStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Items handled per worker, plus failures
#[derive(Debug, Default)]
pub struct WorkerCounters {
    /// Status reports applied or ignored
    pub order_updates: AtomicU64,
    /// Fills handled
    pub fills: AtomicU64,
    /// Position updates handled
    pub position_updates: AtomicU64,
    /// Ticks fanned out
    pub ticks: AtomicU64,
    /// Books fanned out
    pub books: AtomicU64,
    /// Items a worker failed on and skipped
    pub failures: AtomicU64,
}

impl WorkerCounters {
    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            order_updates: self.order_updates.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            position_updates: self.position_updates.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            books: self.books.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`WorkerCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Status reports handled
    pub order_updates: u64,
    /// Fills handled
    pub fills: u64,
    /// Position updates handled
    pub position_updates: u64,
    /// Ticks handled
    pub ticks: u64,
    /// Books handled
    pub books: u64,
    /// Items skipped after a failure
    pub failures: u64,
}

/// Everything the service reports
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    /// Orders that passed validation
    pub total_orders: u64,
    /// Orders that reached Filled
    pub filled_orders: u64,
    /// Orders canceled
    pub canceled_orders: u64,
    /// Orders rejected
    pub rejected_orders: u64,
    /// Mean creation-to-filled time
    pub avg_fill_time: Duration,
    /// Full order manager counters
    pub oms: OmsMetricsSnapshot,
    /// Position tracker counters
    pub positions: TrackerStats,
    /// Worker throughput
    pub workers: WorkerStats,
    /// Items dropped at full queues
    pub queue_drops: QueueDrops,
    /// Pool counters
    pub pools: MemoryPoolStats,
    /// Latency per point with samples
    pub latency: Vec<(LatencyPoint, LatencyStats)>,
    /// Latency traces refused at capacity
    pub dropped_traces: u64,
}

impl ServiceMetrics {
    pub(crate) fn new(
        oms: OmsMetricsSnapshot,
        positions: TrackerStats,
        workers: WorkerStats,
        queue_drops: QueueDrops,
        pools: MemoryPoolStats,
        latency: Vec<(LatencyPoint, LatencyStats)>,
        dropped_traces: u64,
    ) -> Self {
        Self {
            total_orders: oms.orders_created,
            filled_orders: oms.orders_filled,
            canceled_orders: oms.orders_canceled,
            rejected_orders: oms.orders_rejected,
            avg_fill_time: oms.avg_fill_time,
            oms,
            positions,
            workers,
            queue_drops,
            pools,
            latency,
            dropped_traces,
        }
    }
}

//! Nanosecond latency tracing for the signal-to-fill path
//!
//! A trace follows one unit of work (a tick, an order) through named
//! [`LatencyPoint`]s. Each recorded point contributes the elapsed time since
//! the trace started to that point's running statistics.
//!
//! Percentiles are exponentially smoothed estimates held in a few atomics,
//! not exact quantiles. Memory stays constant no matter how many samples are
//! recorded.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const P50_ALPHA: f64 = 0.1;
const P95_WEIGHT: f64 = 0.95;
const P99_WEIGHT: f64 = 0.99;
const P999_WEIGHT: f64 = 0.999;
const TAIL_DECAY: f64 = 0.001;

/// Named measurement points on the execution path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyPoint {
    /// Tick arrived from the feed
    MarketDataReceived,
    /// Strategy produced a signal
    SignalGenerated,
    /// Pre-trade risk passed
    RiskChecked,
    /// Order object built
    OrderCreated,
    /// Order passed validation
    OrderValidated,
    /// Order handed to the exchange adapter
    OrderSent,
    /// Exchange acknowledged the order
    OrderAcknowledged,
    /// Fill applied to the order
    OrderFilled,
    /// Position reflects the fill
    PositionUpdated,
}

impl LatencyPoint {
    /// Every point, in path order
    pub const ALL: [Self; 9] = [
        Self::MarketDataReceived,
        Self::SignalGenerated,
        Self::RiskChecked,
        Self::OrderCreated,
        Self::OrderValidated,
        Self::OrderSent,
        Self::OrderAcknowledged,
        Self::OrderFilled,
        Self::PositionUpdated,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Stable name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketDataReceived => "market_data_received",
            Self::SignalGenerated => "signal_generated",
            Self::RiskChecked => "risk_checked",
            Self::OrderCreated => "order_created",
            Self::OrderValidated => "order_validated",
            Self::OrderSent => "order_sent",
            Self::OrderAcknowledged => "order_acknowledged",
            Self::OrderFilled => "order_filled",
            Self::PositionUpdated => "position_updated",
        }
    }
}

impl fmt::Display for LatencyPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Start with tracking on
    pub enabled: bool,
    /// Traces in flight before new ones are dropped
    pub max_traces: usize,
    /// Traces older than this are swept by `cleanup_stale`
    pub stale_after_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_traces: 10_000,
            stale_after_ms: 60_000,
        }
    }
}

/// Running statistics for one point, in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Samples recorded
    pub count: u64,
    /// Smallest sample
    pub min_ns: u64,
    /// Largest sample
    pub max_ns: u64,
    /// Arithmetic mean
    pub mean_ns: f64,
    /// Smoothed median estimate
    pub p50_ns: f64,
    /// Smoothed 95th percentile estimate
    pub p95_ns: f64,
    /// Smoothed 99th percentile estimate
    pub p99_ns: f64,
    /// Smoothed 99.9th percentile estimate
    pub p999_ns: f64,
}

struct PointStats {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    p50: AtomicU64,
    p95: AtomicU64,
    p99: AtomicU64,
    p999: AtomicU64,
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn tail_update(cell: &AtomicU64, sample: f64, weight: f64) {
    let current = load_f64(cell);
    let next = if sample > current {
        current * weight + sample * (1.0 - weight)
    } else {
        current + TAIL_DECAY * (sample - current)
    };
    store_f64(cell, next);
}

impl PointStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            p50: AtomicU64::new(0),
            p95: AtomicU64::new(0),
            p99: AtomicU64::new(0),
            p999: AtomicU64::new(0),
        }
    }

    // Smoothed values are updated with plain load/store; concurrent writers
    // can lose an update, which only perturbs an estimate.
    #[allow(clippy::cast_precision_loss)]
    fn record(&self, nanos: u64) {
        let previous = self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(nanos, Ordering::Relaxed);
        self.min.fetch_min(nanos, Ordering::Relaxed);
        self.max.fetch_max(nanos, Ordering::Relaxed);

        let sample = nanos as f64;
        if previous == 0 {
            for cell in [&self.p50, &self.p95, &self.p99, &self.p999] {
                store_f64(cell, sample);
            }
            return;
        }
        let p50 = load_f64(&self.p50);
        store_f64(&self.p50, p50 + P50_ALPHA * (sample - p50));
        tail_update(&self.p95, sample, P95_WEIGHT);
        tail_update(&self.p99, sample, P99_WEIGHT);
        tail_update(&self.p999, sample, P999_WEIGHT);
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> Option<LatencyStats> {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        Some(LatencyStats {
            count,
            min_ns: self.min.load(Ordering::Relaxed),
            max_ns: self.max.load(Ordering::Relaxed),
            mean_ns: self.sum.load(Ordering::Relaxed) as f64 / count as f64,
            p50_ns: load_f64(&self.p50),
            p95_ns: load_f64(&self.p95),
            p99_ns: load_f64(&self.p99),
            p999_ns: load_f64(&self.p999),
        })
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        for cell in [&self.p50, &self.p95, &self.p99, &self.p999] {
            store_f64(cell, 0.0);
        }
    }
}

struct ActiveTrace {
    started: Instant,
    points: Vec<(LatencyPoint, Duration)>,
}

/// Finished trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTrace {
    /// Trace key
    pub trace_id: String,
    /// Start to end
    pub total: Duration,
    /// Recorded points with their offset from the start
    pub points: Vec<(LatencyPoint, Duration)>,
}

impl CompletedTrace {
    /// Offset of `point` from the trace start, if it was recorded
    #[must_use]
    pub fn offset(&self, point: LatencyPoint) -> Option<Duration> {
        self.points.iter().find(|(p, _)| *p == point).map(|(_, d)| *d)
    }
}

/// Concurrent latency tracker.
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct LatencyTracker {
    enabled: AtomicBool,
    max_traces: usize,
    traces: DashMap<String, ActiveTrace>,
    stats: [PointStats; LatencyPoint::ALL.len()],
    completed: AtomicU64,
    dropped: AtomicU64,
}

impl LatencyTracker {
    /// Create a tracker from config
    #[must_use]
    pub fn new(config: &LatencyConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            max_traces: config.max_traces.max(1),
            traces: DashMap::new(),
            stats: std::array::from_fn(|_| PointStats::new()),
            completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Turn tracking on
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Turn tracking off; calls become no-ops
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Whether tracking is on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Begin a trace. Returns `false` when disabled, at capacity, or already started.
    pub fn start_trace(&self, trace_id: impl Into<String>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.traces.len() >= self.max_traces {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Latency trace dropped: {} traces in flight", self.max_traces);
            return false;
        }
        match self.traces.entry(trace_id.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ActiveTrace {
                    started: Instant::now(),
                    points: Vec::with_capacity(LatencyPoint::ALL.len()),
                });
                true
            }
        }
    }

    /// Record `point` on a trace; returns the offset from trace start
    pub fn record(&self, trace_id: &str, point: LatencyPoint) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let mut trace = self.traces.get_mut(trace_id)?;
        let elapsed = trace.started.elapsed();
        trace.points.push((point, elapsed));
        drop(trace);
        self.record_duration(point, elapsed);
        Some(elapsed)
    }

    /// Feed a measured duration straight into a point's statistics
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_duration(&self, point: LatencyPoint, elapsed: Duration) {
        if self.is_enabled() {
            self.stats[point.index()].record(elapsed.as_nanos().min(u128::from(u64::MAX)) as u64);
        }
    }

    /// Time `f` and record it against `point`
    pub fn time<R>(&self, point: LatencyPoint, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.record_duration(point, started.elapsed());
        result
    }

    /// Finish a trace and return its points
    pub fn end_trace(&self, trace_id: &str) -> Option<CompletedTrace> {
        let (trace_id, trace) = self.traces.remove(trace_id)?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        Some(CompletedTrace {
            trace_id,
            total: trace.started.elapsed(),
            points: trace.points,
        })
    }

    /// Stats for one point; `None` before the first sample
    #[must_use]
    pub fn stats(&self, point: LatencyPoint) -> Option<LatencyStats> {
        self.stats[point.index()].snapshot()
    }

    /// Stats for every point that has samples
    #[must_use]
    pub fn all_stats(&self) -> Vec<(LatencyPoint, LatencyStats)> {
        LatencyPoint::ALL
            .iter()
            .filter_map(|point| self.stats(*point).map(|stats| (*point, stats)))
            .collect()
    }

    /// Drop traces older than `max_age`; returns how many were removed
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let before = self.traces.len();
        self.traces.retain(|_, trace| trace.started.elapsed() < max_age);
        let removed = before.saturating_sub(self.traces.len());
        if removed > 0 {
            debug!("Swept {} stale latency traces", removed);
        }
        removed
    }

    /// Clear all statistics and in-flight traces
    pub fn reset(&self) {
        self.traces.clear();
        for stats in &self.stats {
            stats.reset();
        }
        self.completed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Traces in flight
    #[must_use]
    pub fn active_traces(&self) -> usize {
        self.traces.len()
    }

    /// Traces finished with `end_trace`
    #[must_use]
    pub fn completed_traces(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Traces refused because the tracker was full
    #[must_use]
    pub fn dropped_traces(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(&LatencyConfig::default())
    }
}

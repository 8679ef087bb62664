//! Pool acquire/release versus plain allocation

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use perf::{LatencyPoint, LatencyTracker, MarketTick, ObjectPool};
use std::time::Duration;

fn benchmark_pool(c: &mut Criterion) {
    let pool = ObjectPool::<MarketTick>::with_default("bench_ticks", 1024);
    pool.preallocate(1024);

    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            let mut tick = pool.acquire();
            tick.symbol.push_str("BTC-USD");
            black_box(&tick);
        });
    });

    c.bench_function("heap_allocate", |b| {
        b.iter(|| {
            let mut tick = Box::new(MarketTick::default());
            tick.symbol.push_str("BTC-USD");
            black_box(tick);
        });
    });
}

fn benchmark_latency(c: &mut Criterion) {
    let tracker = LatencyTracker::default();
    c.bench_function("latency_record_duration", |b| {
        b.iter(|| tracker.record_duration(LatencyPoint::OrderSent, black_box(Duration::from_nanos(850))));
    });
}

criterion_group!(benches, benchmark_pool, benchmark_latency);
criterion_main!(benches);

//! Bounded object pools for hot-path allocations
//!
//! Pools keep pre-constructed instances around so the order and market-data
//! paths reuse memory instead of hitting the allocator on every message.
//!
//! # Behaviour
//! - **Fail open**: an empty pool constructs a fresh object (a *miss*), and a
//!   full pool drops the released object. Neither call blocks or errors.
//! - **Exclusive ownership**: `acquire` moves the object out of a lock-free
//!   `ArrayQueue`, so two holders can never see the same instance.
//! - **RAII**: [`Pooled`] returns its object on drop; [`Pooled::detach`]
//!   takes it for good (e.g. to send through a channel).
//!
//! # Example
//! ```
//! use perf::pool::{ObjectPool, Poolable};
//!
//! #[derive(Default)]
//! struct Scratch(Vec<u64>);
//!
//! impl Poolable for Scratch {
//!     fn reset(&mut self) {
//!         self.0.clear();
//!     }
//! }
//!
//! let pool = ObjectPool::<Scratch>::with_default("scratch", 16);
//! {
//!     let mut item = pool.acquire();
//!     item.0.push(42);
//! } // returned and reset here
//! assert_eq!(pool.stats().available, 1);
//! ```

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Object that can be returned to a clean state for reuse
pub trait Poolable: Send {
    /// Clear all per-use state, keeping allocated capacity
    fn reset(&mut self);
}

impl Poolable for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Acquires served from the pool
    pub hits: u64,
    /// Acquires that had to construct a new object
    pub misses: u64,
    /// Objects returned to the pool
    pub releases: u64,
    /// Objects dropped because the pool was full
    pub discards: u64,
    /// Objects ever constructed by the factory
    pub created: u64,
    /// Objects currently idle in the pool
    pub available: usize,
    /// Pool bound
    pub capacity: usize,
}

impl PoolStats {
    /// Fraction of acquires served from the pool
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// Bounded, fail-open pool of `T`
pub struct ObjectPool<T: Poolable> {
    name: &'static str,
    slots: ArrayQueue<T>,
    factory: Factory<T>,
    hits: AtomicU64,
    misses: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
    created: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    /// Create an empty pool holding at most `capacity` idle objects
    pub fn new(name: &'static str, capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            name,
            slots: ArrayQueue::new(capacity.max(1)),
            factory: Box::new(factory),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }

    /// Pool name used in logs and stats
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Take an object out of the pool, constructing one on a miss
    pub fn take(&self) -> T {
        if let Some(obj) = self.slots.pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            obj
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.construct()
        }
    }

    /// Take an object wrapped in a guard that returns it on drop
    pub fn acquire(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            value: Some(self.take()),
        }
    }

    /// Reset `obj` and put it back; returns `false` if it was discarded
    pub fn release(&self, mut obj: T) -> bool {
        obj.reset();
        if self.slots.push(obj).is_ok() {
            self.releases.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.discards.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Construct up to `count` objects into the pool; returns how many were added
    pub fn preallocate(&self, count: usize) -> usize {
        let mut added = 0;
        for _ in 0..count {
            if self.slots.is_full() || self.slots.push(self.construct()).is_err() {
                break;
            }
            added += 1;
        }
        added
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            available: self.slots.len(),
            capacity: self.slots.capacity(),
        }
    }

    /// Maximum idle objects
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    fn construct(&self) -> T {
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }
}

impl<T: Poolable + Default + 'static> ObjectPool<T> {
    /// Pool whose factory is `T::default`
    pub fn with_default(name: &'static str, capacity: usize) -> Self {
        Self::new(name, capacity, T::default)
    }
}

impl<T: Poolable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Guard around a pooled object; returns it to the pool on drop
pub struct Pooled<'a, T: Poolable> {
    pool: &'a ObjectPool<T>,
    value: Option<T>,
}

impl<T: Poolable> Pooled<'_, T> {
    /// Take ownership; the object will not go back to the pool
    pub fn detach(mut self) -> T {
        match self.value.take() {
            Some(value) => value,
            // value is only taken here or in drop
            None => self.pool.take(),
        }
    }
}

impl<T: Poolable> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is present until the guard is consumed"),
        }
    }
}

impl<T: Poolable> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is present until the guard is consumed"),
        }
    }
}

impl<T: Poolable> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Default)]
    struct Slot {
        id: u64,
        payload: Vec<u8>,
    }

    impl Poolable for Slot {
        fn reset(&mut self) {
            self.payload.clear();
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let pool = ObjectPool::<Slot>::with_default("slots", 2);
        let first = pool.take();
        assert_eq!(pool.stats().misses, 1);
        pool.release(first);
        let _second = pool.take();

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.created, 1);
    }

    #[test]
    fn test_release_resets_state() {
        let pool = ObjectPool::<Slot>::with_default("slots", 2);
        {
            let mut slot = pool.acquire();
            slot.payload.extend_from_slice(b"dirty");
        }
        assert!(pool.take().payload.is_empty());
    }

    #[test]
    fn test_full_pool_discards_without_blocking() {
        let pool = ObjectPool::<Slot>::with_default("slots", 1);
        assert!(pool.release(Slot::default()));
        assert!(!pool.release(Slot::default()));
        assert_eq!(pool.stats().discards, 1);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_preallocate_stops_at_capacity() {
        let pool = ObjectPool::<Slot>::with_default("slots", 4);
        assert_eq!(pool.preallocate(10), 4);
        assert_eq!(pool.stats().created, 4);

        assert_eq!(pool.preallocate(3), 0);
        assert_eq!(pool.stats().created, 4);
    }

    #[test]
    fn test_detach_keeps_object_out() {
        let pool = ObjectPool::<Slot>::with_default("slots", 4);
        let guard = pool.acquire();
        let _owned = guard.detach();
        assert_eq!(pool.stats().available, 0);
        assert_eq!(pool.stats().releases, 0);
    }

    #[test]
    fn test_no_two_live_holders_under_contention() {
        let counter = Arc::new(AtomicU64::new(0));
        let factory_counter = Arc::clone(&counter);
        let pool = Arc::new(ObjectPool::new("contended", 8, move || Slot {
            id: factory_counter.fetch_add(1, Ordering::Relaxed),
            payload: Vec::new(),
        }));
        let live = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let live = Arc::clone(&live);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let slot = pool.take();
                        let fresh = live.lock().map(|mut set| set.insert(slot.id)).unwrap_or(false);
                        assert!(fresh, "object {} handed out twice", slot.id);
                        if let Ok(mut set) = live.lock() {
                            set.remove(&slot.id);
                        }
                        pool.release(slot);
                    }
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().is_ok());
        }
        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 16_000);
        assert!(stats.available <= 8);
    }

    proptest::proptest! {
        #[test]
        fn prop_idle_objects_bounded_by_capacity(
            capacity in 1usize..32,
            ops in proptest::collection::vec(proptest::bool::ANY, 0..200),
        ) {
            let pool: ObjectPool<Slot> = ObjectPool::with_default("prop", capacity);
            let mut held = Vec::new();
            for take in ops {
                if take {
                    held.push(pool.take());
                } else if let Some(slot) = held.pop() {
                    pool.release(slot);
                }
                proptest::prop_assert!(pool.stats().available <= capacity);
            }
            let stats = pool.stats();
            proptest::prop_assert_eq!(stats.hits + stats.misses, stats.releases + stats.discards + held.len() as u64);
        }
    }
}

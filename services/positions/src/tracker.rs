//! Position tracker
//!
//! Owns every position in memory, serializes mutations per position key and
//! journals each change to the event store. Valuation is read-only with
//! respect to the journal: marks are recomputed, never persisted.

use crate::error::{PositionError, PositionResult};
use crate::fill::Fill;
use crate::position::{AGGREGATE_PREFIX, MarginRates, MarkSource, Position, PositionChange, PositionKey};
use crate::price::{PriceFeed, PriceQuote};
use crate::{MarkFallback, PositionConfig};
use chrono::Utc;
use common::{Amount, KeyedLocks, Px};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use storage::{EventStore, NewEvent, Snapshot, SnapshotPolicy, StorageError, StorageResult, load_aggregate};
use tracing::{debug, error, info, warn};

/// Aggregated PnL across positions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PnlSummary {
    /// Sum of realized PnL
    pub realized: Amount,
    /// Sum of unrealized PnL at last marks
    pub unrealized: Amount,
    /// Realized plus unrealized
    pub total: Amount,
    /// Positions with non-zero size
    pub open_positions: usize,
    /// Positions considered
    pub positions: usize,
}

/// Tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    /// Fills booked
    pub fills_applied: u64,
    /// Fills ignored because the trade id was already booked
    pub duplicate_fills: u64,
    /// Positions created
    pub positions_opened: u64,
    /// Explicit closes
    pub positions_closed: u64,
    /// Valuations that used a stale or fallback price
    pub mark_fallbacks: u64,
    /// Event store writes that failed and were queued
    pub persistence_failures: u64,
    /// Positions with queued events
    pub pending_writes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    fills_applied: AtomicU64,
    duplicate_fills: AtomicU64,
    positions_opened: AtomicU64,
    positions_closed: AtomicU64,
    mark_fallbacks: AtomicU64,
    persistence_failures: AtomicU64,
}

/// Event-sourced position book
pub struct PositionTracker {
    config: PositionConfig,
    rates: MarginRates,
    snapshots: SnapshotPolicy,
    store: Arc<dyn EventStore>,
    prices: Arc<dyn PriceFeed>,
    positions: RwLock<FxHashMap<PositionKey, Position>>,
    locks: KeyedLocks<PositionKey>,
    outbox: Mutex<FxHashMap<PositionKey, Vec<NewEvent>>>,
    counters: Counters,
}

impl PositionTracker {
    /// Create a tracker over a store and a price source
    pub fn new(config: PositionConfig, store: Arc<dyn EventStore>, prices: Arc<dyn PriceFeed>) -> Self {
        let rates = MarginRates {
            initial: config.initial_margin_rate,
            maintenance: config.maintenance_margin_rate,
        };
        let snapshots = SnapshotPolicy {
            every: config.snapshot_every,
        };
        Self {
            config,
            rates,
            snapshots,
            store,
            prices,
            positions: RwLock::new(FxHashMap::default()),
            locks: KeyedLocks::new(),
            outbox: Mutex::new(FxHashMap::default()),
            counters: Counters::default(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// Position for `key`, created flat if it does not exist yet.
    ///
    /// A creation that cannot be journaled stays in memory, is queued for
    /// [`flush_outbox`](Self::flush_outbox) and is reported as
    /// [`PositionError::Persistence`].
    pub async fn get_position(&self, key: &PositionKey) -> PositionResult<Position> {
        if let Some(position) = self.positions.read().get(key) {
            return Ok(position.clone());
        }
        let _guard = self.locks.lock(key).await;
        let (position, opened) = self.ensure(key);
        if let Some(change) = opened {
            self.persist(key, &[change], &position, false)
                .await
                .map_err(|source| Self::persistence(key, source))?;
        }
        Ok(position)
    }

    /// Position for `key` if it exists
    #[must_use]
    pub fn find_position(&self, key: &PositionKey) -> Option<Position> {
        self.positions.read().get(key).cloned()
    }

    /// Book a fill for `strategy_id`. Returns `None` for an already booked
    /// trade id.
    ///
    /// The fill stays booked in memory when the journal write fails; the
    /// events are queued and the failure is returned.
    pub async fn update_position_from_fill(&self, strategy_id: &str, fill: &Fill) -> PositionResult<Option<Position>> {
        if !fill.quantity.is_positive() {
            return Err(PositionError::InvalidFill {
                trade_id: fill.trade_id.clone(),
                reason: format!("quantity {} must be positive", fill.quantity),
            });
        }
        if fill.price < Px::ZERO {
            return Err(PositionError::InvalidFill {
                trade_id: fill.trade_id.clone(),
                reason: format!("price {} is negative", fill.price),
            });
        }

        let key = PositionKey::new(strategy_id, &fill.symbol, &fill.exchange);
        let _guard = self.locks.lock(&key).await;
        let (mut position, opened) = self.ensure(&key);

        let Some(effect) = position.apply_fill(fill) else {
            self.counters.duplicate_fills.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate fill {} for {} ignored", fill.trade_id, key);
            return Ok(None);
        };
        self.counters.fills_applied.fetch_add(1, Ordering::Relaxed);

        match self.valuation(&position) {
            Ok((mark, source)) => position.revalue(mark, source, self.rates),
            Err(e) => {
                debug!("Fill on {} left unmarked: {}", key, e);
                position.update_margin(self.rates);
            }
        }

        if effect.flipped {
            info!(
                "Position {} flipped to {} {} @ {}",
                key, position.side, position.size, position.entry_price
            );
        }
        debug!(
            "Fill {} {} {} @ {} on {}: size={} realized={}",
            fill.trade_id, fill.side, fill.quantity, fill.price, key, position.size, position.realized_pnl
        );

        self.positions.write().insert(key.clone(), position.clone());
        let mut changes: Vec<PositionChange> = opened.into_iter().collect();
        changes.push(PositionChange::Filled { fill: fill.clone() });
        self.persist(&key, &changes, &position, false)
            .await
            .map_err(|source| Self::persistence(&key, source))?;
        Ok(Some(position))
    }

    /// Revalue a position at the current mark
    pub async fn mark_to_market(&self, key: &PositionKey) -> PositionResult<Position> {
        let _guard = self.locks.lock(key).await;
        let mut position = self.existing(key)?;
        let (mark, source) = self.valuation(&position)?;
        position.revalue(mark, source, self.rates);
        self.positions.write().insert(key.clone(), position.clone());
        Ok(position)
    }

    /// Unrealized PnL at the current mark
    pub async fn calculate_unrealized_pnl(&self, key: &PositionKey) -> PositionResult<Amount> {
        Ok(self.mark_to_market(key).await?.unrealized_pnl)
    }

    /// Revalue every position, optionally only one strategy's.
    ///
    /// Positions that cannot be marked keep their previous valuation.
    pub async fn mark_all(&self, strategy_id: Option<&str>) -> Vec<Position> {
        let keys = self.keys(strategy_id);
        let mut marked = Vec::with_capacity(keys.len());
        for key in keys {
            match self.mark_to_market(&key).await {
                Ok(position) => marked.push(position),
                Err(e) => {
                    warn!("Could not mark {}: {}", key, e);
                    if let Some(position) = self.find_position(&key) {
                        marked.push(position);
                    }
                }
            }
        }
        marked
    }

    /// Realize open PnL at the current mark and go flat. A failed journal
    /// write leaves the position closed in memory and is returned as
    /// [`PositionError::Persistence`].
    pub async fn close_position(&self, key: &PositionKey) -> PositionResult<Position> {
        let _guard = self.locks.lock(key).await;
        let mut position = self.existing(key)?;
        if position.is_flat() {
            return Ok(position);
        }

        let (mark, source) = self.valuation(&position)?;
        let at = Utc::now();
        let pnl = position.close_at(mark, at);
        position.mark_price = mark;
        position.mark_source = source;
        self.counters.positions_closed.fetch_add(1, Ordering::Relaxed);
        info!("Closed {} at {} realizing {}", key, mark, pnl);

        self.positions.write().insert(key.clone(), position.clone());
        self.persist(key, &[PositionChange::Closed { mark, at }], &position, true)
            .await
            .map_err(|source| Self::persistence(key, source))?;
        Ok(position)
    }

    /// All positions, optionally only one strategy's, ordered by key
    #[must_use]
    pub fn get_all_positions(&self, strategy_id: Option<&str>) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| strategy_id.is_none_or(|s| p.key.strategy_id == s))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.key.cmp(&b.key));
        positions
    }

    /// PnL totals at last marks
    #[must_use]
    pub fn pnl_summary(&self, strategy_id: Option<&str>) -> PnlSummary {
        self.get_all_positions(strategy_id)
            .iter()
            .fold(PnlSummary::default(), |mut acc, p| {
                acc.realized += p.realized_pnl;
                acc.unrealized += p.unrealized_pnl;
                acc.total = acc.realized + acc.unrealized;
                acc.positions += 1;
                if !p.is_flat() {
                    acc.open_positions += 1;
                }
                acc
            })
    }

    /// Rebuild every position from the event store
    pub async fn recover(&self) -> PositionResult<usize> {
        let started = Instant::now();
        let ids = self.store.aggregate_ids(AGGREGATE_PREFIX).await?;
        let mut recovered = FxHashMap::default();
        for id in &ids {
            if let Some(loaded) = load_aggregate::<Position>(self.store.as_ref(), id).await? {
                debug!(
                    "Recovered {} at v{} ({} events, snapshot: {})",
                    id, loaded.version, loaded.replayed, loaded.from_snapshot
                );
                let mut position = loaded.state;
                position.update_margin(self.rates);
                recovered.insert(position.key.clone(), position);
            }
        }
        let count = recovered.len();
        self.positions.write().extend(recovered);
        info!("Recovered {} positions in {:?}", count, started.elapsed());
        Ok(count)
    }

    /// Retry queued event store writes. Returns how many positions were
    /// fully flushed.
    pub async fn flush_outbox(&self) -> usize {
        let keys: Vec<PositionKey> = self.outbox.lock().keys().cloned().collect();
        let mut flushed = 0;
        for key in keys {
            let _guard = self.locks.lock(&key).await;
            let Some(position) = self.find_position(&key) else {
                continue;
            };
            if self.persist(&key, &[], &position, false).await.is_ok() {
                flushed += 1;
            }
        }
        flushed
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            fills_applied: self.counters.fills_applied.load(Ordering::Relaxed),
            duplicate_fills: self.counters.duplicate_fills.load(Ordering::Relaxed),
            positions_opened: self.counters.positions_opened.load(Ordering::Relaxed),
            positions_closed: self.counters.positions_closed.load(Ordering::Relaxed),
            mark_fallbacks: self.counters.mark_fallbacks.load(Ordering::Relaxed),
            persistence_failures: self.counters.persistence_failures.load(Ordering::Relaxed),
            pending_writes: self.outbox.lock().len(),
        }
    }

    /// Existing position, or a new flat one plus the `Opened` change the
    /// caller must journal. Caller must hold the key lock.
    fn ensure(&self, key: &PositionKey) -> (Position, Option<PositionChange>) {
        if let Some(position) = self.find_position(key) {
            return (position, None);
        }
        let at = Utc::now();
        let position = Position::flat(key.clone(), at);
        self.positions.write().insert(key.clone(), position.clone());
        self.counters.positions_opened.fetch_add(1, Ordering::Relaxed);
        info!("Opened position {}", key);
        (position, Some(PositionChange::Opened { key: key.clone(), at }))
    }

    fn persistence(key: &PositionKey, source: StorageError) -> PositionError {
        PositionError::Persistence {
            key: key.to_string(),
            source,
        }
    }

    fn existing(&self, key: &PositionKey) -> PositionResult<Position> {
        self.find_position(key).ok_or_else(|| PositionError::NotFound { key: key.to_string() })
    }

    fn keys(&self, strategy_id: Option<&str>) -> Vec<PositionKey> {
        let mut keys: Vec<PositionKey> = self
            .positions
            .read()
            .keys()
            .filter(|k| strategy_id.is_none_or(|s| k.strategy_id == s))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Mark price for a position under the configured fallback policy
    fn valuation(&self, position: &Position) -> PositionResult<(Px, MarkSource)> {
        let key = &position.key;
        match self.prices.quote(&key.symbol, &key.exchange) {
            PriceQuote::Fresh(price) => Ok((price, MarkSource::Live)),
            PriceQuote::Stale { price, age } => {
                self.counters.mark_fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!("Stale price for {} ({:?} old), marking at {}", key, age, price);
                Ok((price, MarkSource::Stale))
            }
            PriceQuote::Missing => match self.config.mark_fallback {
                MarkFallback::LastMark if position.mark_source != MarkSource::None => {
                    self.counters.mark_fallbacks.fetch_add(1, Ordering::Relaxed);
                    warn!("No price for {}, reusing last mark {}", key, position.mark_price);
                    Ok((position.mark_price, MarkSource::LastMark))
                }
                MarkFallback::LastMark | MarkFallback::EntryPrice => {
                    self.counters.mark_fallbacks.fetch_add(1, Ordering::Relaxed);
                    warn!("No price for {}, marking at entry {}", key, position.entry_price);
                    Ok((position.entry_price, MarkSource::Entry))
                }
                MarkFallback::Reject => Err(PositionError::PriceUnavailable {
                    symbol: key.symbol.clone(),
                    exchange: key.exchange.clone(),
                }),
            },
        }
    }

    /// Append queued plus new events. Caller must hold the key lock and
    /// `state` must already include `changes`. Store failures are queued for
    /// [`flush_outbox`](Self::flush_outbox).
    async fn persist(
        &self,
        key: &PositionKey,
        changes: &[PositionChange],
        state: &Position,
        force_snapshot: bool,
    ) -> StorageResult<()> {
        let encoded: StorageResult<Vec<NewEvent>> = changes.iter().map(PositionChange::to_event).collect();
        let encoded = encoded.inspect_err(|e| {
            error!("Cannot encode change for {}: {}", key, e);
            self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
        })?;

        let mut batch = self.outbox.lock().remove(key).unwrap_or_default();
        batch.extend(encoded);
        if batch.is_empty() {
            return Ok(());
        }

        let aggregate_id = key.aggregate_id();
        match self.store.save_events(&aggregate_id, batch.clone()).await {
            Ok(stored) => {
                if let (Some(first), Some(last)) = (stored.first(), stored.last()) {
                    if force_snapshot || self.snapshots.due(first.version - 1, last.version) {
                        self.snapshot(&aggregate_id, state, last.version).await;
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!("Persisting {} events for {} failed, queued: {}", batch.len(), key, e);
                self.outbox.lock().insert(key.clone(), batch);
                Err(e)
            }
        }
    }

    async fn snapshot(&self, aggregate_id: &str, state: &Position, version: u64) {
        let result = match Snapshot::of(aggregate_id, &state.durable(), version) {
            Ok(snapshot) => self.store.save_snapshot(snapshot).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Snapshot {} at v{}", aggregate_id, version),
            Err(e) => warn!("Snapshot {} at v{} failed: {}", aggregate_id, version, e),
        }
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("positions", &self.positions.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

//! Order manager
//!
//! Owns the active-order index and the per-strategy history, routes through
//! the adapter registry and journals every transition.
//!
//! Operations on one order are serialized with a keyed async lock held for
//! the whole operation, exchange round-trip included. The index locks are
//! synchronous and never held across an await.

use crate::adapter::{AdapterError, AdapterRegistry, ExchangeAdapter, SubmitAck};
use crate::error::{OmsError, OmsResult};
use crate::events::OrderChange;
use crate::lifecycle::OrderLifecycleManager;
use crate::order::{Order, OrderRequest, OrderStatus, aggregate_id};
use crate::retry::{Attempted, Retrier, RetryFailure};
use crate::{OmsConfig, OmsMetrics, OmsMetricsSnapshot, OrderEvent};
use chrono::{DateTime, Utc};
use common::{KeyedLocks, Px, Qty};
use parking_lot::{Mutex, RwLock};
use perf::{LatencyPoint, LatencyTracker};
use positions::Fill;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use storage::{EventStore, NewEvent, Snapshot, SnapshotPolicy};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a successful placement
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    /// Order after acknowledgement
    pub order: Order,
    /// Routing attempts, including the successful one
    pub attempts: u32,
}

/// Result of applying a fill
#[derive(Debug, Clone)]
pub struct FillOutcome {
    /// Order after the fill
    pub order: Order,
    /// Trade id was already applied; nothing changed
    pub duplicate: bool,
    /// This fill moved the order to Filled
    pub completed: bool,
    /// The fill was journaled; false means it is queued in the outbox
    pub persisted: bool,
}

/// Venue-reported order status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusUpdate {
    /// Order the report is about
    pub order_id: Uuid,
    /// Reported status
    pub status: OrderStatus,
    /// Venue reason, if any
    pub reason: Option<String>,
    /// Report time
    pub timestamp: DateTime<Utc>,
}

impl OrderStatusUpdate {
    /// Report stamped now
    pub fn new(order_id: Uuid, status: OrderStatus) -> Self {
        Self {
            order_id,
            status,
            reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal orders, bounded per strategy
#[derive(Debug, Default)]
pub(crate) struct OrderHistory {
    pub(crate) orders: FxHashMap<Uuid, Order>,
    by_strategy: FxHashMap<String, VecDeque<Uuid>>,
}

impl OrderHistory {
    pub(crate) fn insert(&mut self, order: Order, per_strategy: usize) {
        let ids = self.by_strategy.entry(order.strategy_id.clone()).or_default();
        if !self.orders.contains_key(&order.id) {
            ids.push_back(order.id);
        }
        self.orders.insert(order.id, order);
        while ids.len() > per_strategy {
            if let Some(evicted) = ids.pop_front() {
                self.orders.remove(&evicted);
            }
        }
    }

    fn for_strategy(&self, strategy_id: &str) -> impl Iterator<Item = &Order> {
        self.by_strategy
            .get(strategy_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.orders.get(id))
    }
}

/// In-memory change plus the outcome of journaling it
struct Committed {
    order: Order,
    persist_error: Option<OmsError>,
}

impl Committed {
    fn into_result(self) -> OmsResult<Order> {
        match self.persist_error {
            Some(e) => Err(e),
            None => Ok(self.order),
        }
    }
}

/// Order lifecycle manager
pub struct OrderManager {
    pub(crate) config: OmsConfig,
    lifecycle: OrderLifecycleManager,
    adapters: AdapterRegistry,
    retrier: Retrier,
    snapshots: SnapshotPolicy,
    pub(crate) store: Arc<dyn EventStore>,
    latency: Option<Arc<LatencyTracker>>,
    pub(crate) active: RwLock<FxHashMap<Uuid, Order>>,
    pub(crate) history: RwLock<OrderHistory>,
    locks: KeyedLocks<Uuid>,
    outbox: Mutex<FxHashMap<Uuid, Vec<NewEvent>>>,
    events: broadcast::Sender<OrderEvent>,
    pub(crate) metrics: OmsMetrics,
}

impl OrderManager {
    /// Create a manager over an adapter registry and an event store
    pub fn new(config: OmsConfig, adapters: AdapterRegistry, store: Arc<dyn EventStore>) -> OmsResult<Self> {
        config.validate()?;
        let retrier = Retrier::new(config.retry.clone(), config.routing_timeout());
        let snapshots = SnapshotPolicy {
            every: config.snapshot_every,
        };
        let (events, _) = broadcast::channel(config.event_buffer_size);
        info!(
            "Order manager ready for exchanges {:?} (max_attempts={}, timeout={:?})",
            adapters.exchanges(),
            config.retry.max_attempts,
            config.routing_timeout()
        );
        Ok(Self {
            config,
            lifecycle: OrderLifecycleManager::new(),
            adapters,
            retrier,
            snapshots,
            store,
            latency: None,
            active: RwLock::new(FxHashMap::default()),
            history: RwLock::new(OrderHistory::default()),
            locks: KeyedLocks::new(),
            outbox: Mutex::new(FxHashMap::default()),
            events,
            metrics: OmsMetrics::default(),
        })
    }

    /// Record order-path latency points into `tracker`
    #[must_use]
    pub fn with_latency_tracker(mut self, tracker: Arc<LatencyTracker>) -> Self {
        self.latency = Some(tracker);
        self
    }

    /// Replace the retryable-error predicate
    #[must_use]
    pub fn with_retry_classifier(mut self, classifier: impl Fn(&AdapterError) -> bool + Send + Sync + 'static) -> Self {
        self.retrier = self.retrier.with_classifier(classifier);
        self
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &OmsConfig {
        &self.config
    }

    /// Subscribe to order events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }

    /// Validate, journal and route a new order.
    ///
    /// Routing failure leaves the order `Rejected` with `error_message` set,
    /// journals the rejection and returns [`OmsError::Routing`].
    #[instrument(skip(self, request), fields(strategy = %request.strategy_id, symbol = %request.symbol))]
    pub async fn place_order(&self, request: OrderRequest) -> OmsResult<PlacedOrder> {
        let entered = Instant::now();
        if let Err(e) = self.lifecycle.validate_request(&request) {
            self.metrics.validation_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Order request refused: {}", e);
            return Err(e);
        }

        let order = Order::from_request(request, Utc::now());
        let order_id = order.id;
        let trace = order_id.to_string();
        self.trace_start(&trace);
        self.trace(&trace, LatencyPoint::OrderCreated);
        self.trace(&trace, LatencyPoint::OrderValidated);

        let _guard = self.locks.lock(&order_id).await;
        if self.lookup(order_id).is_some() {
            self.metrics.validation_failures.fetch_add(1, Ordering::Relaxed);
            return Err(OmsError::validation(format!("Order id {order_id} already exists")));
        }

        // Nothing is routed unless creation is durable
        let created = OrderChange::Created {
            order: Box::new(order.clone()),
        };
        let event = created.to_event().map_err(|source| OmsError::Persistence {
            order_id,
            stage: "created",
            source,
        })?;
        if let Err(source) = self.store.save_events(&aggregate_id(order_id), vec![event]).await {
            self.metrics.persistence_failures.fetch_add(1, Ordering::Relaxed);
            error!("Could not journal order {}, not routing: {}", order_id, source);
            return Err(OmsError::Persistence {
                order_id,
                stage: "created",
                source,
            });
        }
        self.store_order(order.clone());
        self.metrics.orders_created.fetch_add(1, Ordering::Relaxed);
        self.publish(OrderEvent::Created(order.clone()));
        debug!(
            "Order {} created: {} {} {} @ {:?}",
            order_id, order.side, order.quantity, order.symbol, order.price
        );

        let Some(adapter) = self.adapters.get(&order.exchange) else {
            let reason = format!("no adapter for exchange {}", order.exchange);
            self.reject(order_id, reason).await;
            return Err(OmsError::UnknownExchange {
                exchange: order.exchange,
            });
        };

        self.trace(&trace, LatencyPoint::OrderSent);
        let routed = self
            .route("submit", |_| adapter.submit(&order))
            .await;

        match routed {
            Ok(Attempted {
                value: SubmitAck::Accepted { exchange_order_id },
                attempts,
                ..
            }) => {
                let latency = entered.elapsed();
                self.metrics.record_ack(latency);
                self.trace(&trace, LatencyPoint::OrderAcknowledged);
                self.lifecycle.validate_transition(&order, OrderStatus::New)?;

                let change = OrderChange::Accepted {
                    exchange_order_id: exchange_order_id.clone(),
                    latency,
                    at: Utc::now(),
                };
                let committed = self.commit(order_id, change, "accepted").await?;
                info!(
                    "Order {} accepted by {} as {} in {:?} ({} attempts)",
                    order_id, order.exchange, exchange_order_id, latency, attempts
                );
                self.publish(OrderEvent::Accepted(committed.order.clone()));
                let order = committed.into_result()?;
                Ok(PlacedOrder { order, attempts })
            }
            Ok(Attempted {
                value: SubmitAck::Rejected { reason },
                attempts,
                ..
            }) => {
                error!("Order {} rejected by {}: {}", order_id, order.exchange, reason);
                self.reject(order_id, reason.clone()).await;
                self.trace_end(&trace);
                Err(OmsError::Routing {
                    order_id,
                    stage: "submit",
                    attempts,
                    source: AdapterError::Rejected(reason),
                })
            }
            Err(RetryFailure { error, attempts, .. }) => {
                error!(
                    "Order {} routing to {} failed after {} attempts: {}",
                    order_id, order.exchange, attempts, error
                );
                self.reject(order_id, error.to_string()).await;
                self.trace_end(&trace);
                Err(OmsError::Routing {
                    order_id,
                    stage: "submit",
                    attempts,
                    source: error,
                })
            }
        }
    }

    /// Cancel a working order. Local status changes only after the venue
    /// acknowledges.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid) -> OmsResult<Order> {
        let _guard = self.locks.lock(&order_id).await;
        let order = self.lookup(order_id).ok_or(OmsError::OrderNotFound { order_id })?;
        if !self.lifecycle.can_cancel(&order) {
            return Err(OmsError::InvalidOrderState {
                order_id,
                operation: "canceled",
                status: order.status,
            });
        }
        let (adapter, exchange_order_id) = self.venue_for(&order, "canceled")?;

        self.route("cancel", |_| adapter.cancel(&exchange_order_id))
            .await
            .map_err(|failure| self.routing_failed(order_id, "cancel", failure))?;

        let committed = self
            .commit(order_id, OrderChange::Canceled { at: Utc::now() }, "canceled")
            .await?;
        self.metrics.orders_canceled.fetch_add(1, Ordering::Relaxed);
        info!("Order {} canceled with {} filled", order_id, committed.order.filled_quantity);
        self.publish(OrderEvent::Canceled(committed.order.clone()));
        self.archive_trace(order_id);
        committed.into_result()
    }

    /// Change price and/or total quantity of a working order. Local state
    /// changes only after the venue acknowledges.
    #[instrument(skip(self))]
    pub async fn modify_order(&self, order_id: Uuid, new_price: Option<Px>, new_quantity: Option<Qty>) -> OmsResult<Order> {
        let _guard = self.locks.lock(&order_id).await;
        let order = self.lookup(order_id).ok_or(OmsError::OrderNotFound { order_id })?;
        if !self.lifecycle.can_modify(&order) {
            return Err(OmsError::InvalidOrderState {
                order_id,
                operation: "modified",
                status: order.status,
            });
        }
        if let Err(e) = self
            .lifecycle
            .validate_modification(&order, new_price, new_quantity)
        {
            self.metrics.validation_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Modification of {} refused: {}", order_id, e);
            return Err(e);
        }
        let (adapter, exchange_order_id) = self.venue_for(&order, "modified")?;

        let quantity = new_quantity.unwrap_or(order.quantity);
        let price = new_price.or(order.price);
        self.route("modify", |_| adapter.modify(&exchange_order_id, price, quantity))
            .await
            .map_err(|failure| self.routing_failed(order_id, "modify", failure))?;

        let change = OrderChange::Modified {
            price: new_price,
            quantity,
            at: Utc::now(),
        };
        let committed = self.commit(order_id, change, "modified").await?;
        info!("Order {} modified to {} @ {:?}", order_id, quantity, price);
        self.publish(OrderEvent::Modified(committed.order.clone()));
        committed.into_result()
    }

    /// Apply an execution report. Idempotent by trade id.
    #[instrument(skip(self, fill), fields(order_id = %fill.order_id, trade_id = %fill.trade_id))]
    pub async fn apply_fill(&self, fill: Fill) -> OmsResult<FillOutcome> {
        let order_id = fill.order_id;
        let _guard = self.locks.lock(&order_id).await;
        let order = self.lookup(order_id).ok_or(OmsError::OrderNotFound { order_id })?;

        if order.has_trade(&fill.trade_id) {
            self.metrics.duplicate_fills.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate fill {} on order {} ignored", fill.trade_id, order_id);
            return Ok(FillOutcome {
                order,
                duplicate: true,
                completed: false,
                persisted: true,
            });
        }
        if matches!(
            order.status,
            OrderStatus::Pending | OrderStatus::Filled | OrderStatus::Rejected
        ) {
            error!("Fill {} for order {} in state {}", fill.trade_id, order_id, order.status);
            return Err(OmsError::InvalidOrderState {
                order_id,
                operation: "filled",
                status: order.status,
            });
        }
        if fill.symbol != order.symbol || fill.exchange != order.exchange || fill.side != order.side {
            return Err(OmsError::validation(format!(
                "Fill {} ({} {} on {}) does not match order {}",
                fill.trade_id, fill.side, fill.symbol, fill.exchange, order_id
            )));
        }
        if !fill.quantity.is_positive() {
            return Err(OmsError::validation(format!(
                "Fill {} quantity must be positive",
                fill.trade_id
            )));
        }
        if fill.quantity > order.remaining_quantity {
            error!(
                "Fill {} of {} overfills order {} with {} remaining",
                fill.trade_id, fill.quantity, order_id, order.remaining_quantity
            );
            return Err(OmsError::Overfill {
                order_id,
                fill_quantity: fill.quantity,
                remaining: order.remaining_quantity,
            });
        }

        let previous = order.status;
        let committed = self
            .commit(order_id, OrderChange::Filled { fill: fill.clone() }, "filled")
            .await?;
        let updated = committed.order;
        self.metrics.total_fills.fetch_add(1, Ordering::Relaxed);

        let completed = previous != OrderStatus::Filled && updated.status == OrderStatus::Filled;
        if completed {
            self.metrics.orders_filled.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .record_fill_time((Utc::now() - updated.created_at).to_std().unwrap_or_default());
            self.trace(&order_id.to_string(), LatencyPoint::OrderFilled);
            self.archive_trace(order_id);
            info!(
                "Order {} filled: {} @ {} avg",
                order_id, updated.filled_quantity, updated.avg_fill_price
            );
        } else {
            debug!(
                "Order {} fill {} {} @ {}, {} remaining",
                order_id, fill.trade_id, fill.quantity, fill.price, updated.remaining_quantity
            );
        }
        if previous == OrderStatus::Canceled {
            warn!("Fill {} booked on canceled order {}", fill.trade_id, order_id);
        }

        self.publish(OrderEvent::Filled {
            order: updated.clone(),
            fill,
        });
        Ok(FillOutcome {
            order: updated,
            duplicate: false,
            completed,
            persisted: committed.persist_error.is_none(),
        })
    }

    /// Apply a venue status report. Returns `None` when the report does not
    /// change the order.
    #[instrument(skip(self, update), fields(order_id = %update.order_id, status = %update.status))]
    pub async fn apply_status_update(&self, update: OrderStatusUpdate) -> OmsResult<Option<Order>> {
        let order_id = update.order_id;
        let _guard = self.locks.lock(&order_id).await;
        let order = self.lookup(order_id).ok_or(OmsError::OrderNotFound { order_id })?;

        let Some(target) = self.lifecycle.reconcile_report(&order, update.status) else {
            debug!("Status report {} for order {} in {} ignored", update.status, order_id, order.status);
            return Ok(None);
        };

        let change = OrderChange::StatusChanged {
            status: target,
            reason: update.reason.clone(),
            at: update.timestamp,
        };
        let committed = self.commit(order_id, change, "status").await?;
        match target {
            OrderStatus::Canceled => {
                self.metrics.orders_canceled.fetch_add(1, Ordering::Relaxed);
            }
            OrderStatus::Rejected => {
                self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed);
            }
            OrderStatus::Filled => {
                self.metrics.orders_filled.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record_fill_time((Utc::now() - order.created_at).to_std().unwrap_or_default());
            }
            _ => {}
        }
        if target.is_terminal() {
            self.archive_trace(order_id);
        }
        info!("Order {} moved {} -> {} by venue report", order_id, order.status, target);
        self.publish(OrderEvent::StatusChanged {
            order: committed.order.clone(),
            old_status: order.status,
            timestamp: update.timestamp,
        });
        committed.into_result().map(Some)
    }

    /// Order by id, active or archived
    pub fn get_order(&self, order_id: Uuid) -> OmsResult<Order> {
        self.lookup(order_id).ok_or(OmsError::OrderNotFound { order_id })
    }

    /// Orders working at the venue (New or PartiallyFilled), oldest first
    #[must_use]
    pub fn get_active_orders(&self, strategy_id: Option<&str>) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .active
            .read()
            .values()
            .filter(|o| matches!(o.status, OrderStatus::New | OrderStatus::PartiallyFilled))
            .filter(|o| strategy_id.is_none_or(|s| o.strategy_id == s))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    /// A strategy's orders, most recent first
    #[must_use]
    pub fn get_order_history(&self, strategy_id: &str, limit: usize) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .active
            .read()
            .values()
            .filter(|o| o.strategy_id == strategy_id)
            .cloned()
            .collect();
        orders.extend(self.history.read().for_strategy(strategy_id).cloned());
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit);
        orders
    }

    /// Orders whose events are waiting in the outbox
    #[must_use]
    pub fn pending_reconciliation(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.outbox.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Retry every queued write. Returns how many orders were flushed.
    pub async fn flush_outbox(&self) -> usize {
        let mut flushed = 0;
        for order_id in self.pending_reconciliation() {
            let _guard = self.locks.lock(&order_id).await;
            let Some(order) = self.lookup(order_id) else {
                continue;
            };
            if self.persist(&order, None, "outbox").await.is_ok() {
                info!("Flushed queued events for order {}", order_id);
                flushed += 1;
            }
        }
        flushed
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> OmsMetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.active_orders = self.active.read().len();
        snapshot.pending_reconciliation = self.outbox.lock().len();
        snapshot
    }

    /// Drop per-order locks nobody holds
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    pub(crate) fn lookup(&self, order_id: Uuid) -> Option<Order> {
        if let Some(order) = self.active.read().get(&order_id) {
            return Some(order.clone());
        }
        self.history.read().orders.get(&order_id).cloned()
    }

    /// Put `order` in the active index or the history, by status
    pub(crate) fn store_order(&self, order: Order) {
        if order.is_terminal() {
            self.active.write().remove(&order.id);
            self.history
                .write()
                .insert(order, self.config.max_history_per_strategy);
        } else {
            self.active.write().insert(order.id, order);
        }
    }

    fn venue_for(&self, order: &Order, operation: &'static str) -> OmsResult<(Arc<dyn ExchangeAdapter>, String)> {
        let adapter = self
            .adapters
            .get(&order.exchange)
            .ok_or_else(|| OmsError::UnknownExchange {
                exchange: order.exchange.clone(),
            })?;
        let exchange_order_id = order
            .exchange_order_id
            .clone()
            .ok_or(OmsError::InvalidOrderState {
                order_id: order.id,
                operation,
                status: order.status,
            })?;
        Ok((adapter, exchange_order_id))
    }

    async fn route<T, F, Fut>(&self, operation: &str, call: F) -> Result<Attempted<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let result = self.retrier.run(operation, call).await;
        let attempts = match &result {
            Ok(attempted) => attempted.attempts,
            Err(failure) => failure.attempts,
        };
        self.metrics
            .routing_retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
        result
    }

    fn routing_failed(&self, order_id: Uuid, stage: &'static str, failure: RetryFailure) -> OmsError {
        error!(
            "{} for order {} failed after {} attempts: {}",
            stage, order_id, failure.attempts, failure.error
        );
        OmsError::Routing {
            order_id,
            stage,
            attempts: failure.attempts,
            source: failure.error,
        }
    }

    /// Terminalize as Rejected. Journal failures are logged; the routing
    /// error is what the caller sees.
    async fn reject(&self, order_id: Uuid, reason: String) {
        let change = OrderChange::Rejected { reason, at: Utc::now() };
        match self.commit(order_id, change, "rejected").await {
            Ok(committed) => {
                self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed);
                self.publish(OrderEvent::Rejected(committed.order));
            }
            Err(e) => error!("Could not reject order {}: {}", order_id, e),
        }
    }

    /// Apply `change` in memory, then journal it. Caller holds the order lock.
    async fn commit(&self, order_id: Uuid, change: OrderChange, stage: &'static str) -> OmsResult<Committed> {
        let event = change.to_event().map_err(|source| OmsError::Persistence {
            order_id,
            stage,
            source,
        })?;
        let mut order = self.lookup(order_id).ok_or(OmsError::OrderNotFound { order_id })?;
        order.apply_change(&change);
        self.store_order(order.clone());

        let persist_error = self.persist(&order, Some(event), stage).await.err();
        Ok(Committed { order, persist_error })
    }

    /// Write queued events plus `event`. On failure everything goes back to
    /// the outbox.
    async fn persist(&self, order: &Order, event: Option<NewEvent>, stage: &'static str) -> OmsResult<()> {
        let mut batch = self.outbox.lock().remove(&order.id).unwrap_or_default();
        batch.extend(event);
        if batch.is_empty() {
            return Ok(());
        }

        let aggregate = aggregate_id(order.id);
        match self.store.save_events(&aggregate, batch.clone()).await {
            Ok(stored) => {
                if let (Some(first), Some(last)) = (stored.first(), stored.last()) {
                    if order.is_terminal() || self.snapshots.due(first.version - 1, last.version) {
                        self.snapshot(&aggregate, order, last.version).await;
                    }
                }
                Ok(())
            }
            Err(source) => {
                self.metrics.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Persisting {} for order {} failed, {} events queued: {}",
                    stage,
                    order.id,
                    batch.len(),
                    source
                );
                self.outbox.lock().insert(order.id, batch);
                Err(OmsError::Persistence {
                    order_id: order.id,
                    stage,
                    source,
                })
            }
        }
    }

    async fn snapshot(&self, aggregate: &str, order: &Order, version: u64) {
        let result = match Snapshot::of(aggregate, order, version) {
            Ok(snapshot) => self.store.save_snapshot(snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Snapshot of {} at v{} failed: {}", aggregate, version, e);
        }
    }

    fn publish(&self, event: OrderEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn trace_start(&self, trace: &str) {
        if let Some(tracker) = &self.latency {
            tracker.start_trace(trace);
        }
    }

    fn trace(&self, trace: &str, point: LatencyPoint) {
        if let Some(tracker) = &self.latency {
            tracker.record(trace, point);
        }
    }

    fn trace_end(&self, trace: &str) {
        if let Some(tracker) = &self.latency {
            tracker.end_trace(trace);
        }
    }

    fn archive_trace(&self, order_id: Uuid) {
        self.trace_end(&order_id.to_string());
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("adapters", &self.adapters)
            .field("retrier", &self.retrier)
            .field("active_orders", &self.active.read().len())
            .finish_non_exhaustive()
    }
}

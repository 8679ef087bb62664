//! Execution service orchestration
//!
//! Owns the order manager, the position tracker, the price cache, the object
//! pools and the latency tracker, and connects them through five bounded
//! queues. Each queue has exactly one worker, so ordering holds within a
//! queue and nowhere else.

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::{ServiceMetrics, WorkerCounters};
use crate::queue::{self, QueueDrops, QueueSender};
use common::{Px, Qty};
use oms::{
    AdapterRegistry, Order, OrderEvent, OrderManager, OrderRequest, OrderStatusUpdate, RecoveryStats,
};
use parking_lot::Mutex;
use perf::{
    AffinityManager, LatencyPoint, LatencyTracker, MarketTick, MemoryPools, OrderBookSnapshot, PinnedThread,
    PooledOrder, ThreadManager, WorkloadType,
};
use positions::{Fill, PnlSummary, Position, PositionError, PositionKey, PositionTracker, PriceCache};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use storage::EventStore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SUBSCRIBER_CAPACITY: usize = 1_024;

/// A position to re-mark after a fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    /// Position that changed
    pub key: PositionKey,
    /// Fill that changed it
    pub trade_id: String,
}

/// What `recover` restored
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Order manager rebuild
    pub orders: RecoveryStats,
    /// Positions rebuilt by the tracker
    pub positions: usize,
}

/// Receiving halves, taken once by `start`
struct Receivers {
    order_updates: mpsc::Receiver<OrderStatusUpdate>,
    fills: mpsc::Receiver<Fill>,
    position_updates: mpsc::Receiver<PositionUpdate>,
    ticks: mpsc::Receiver<MarketTick>,
    books: mpsc::Receiver<OrderBookSnapshot>,
}

enum Worker {
    Task(&'static str, JoinHandle<()>),
    Thread(&'static str, PinnedThread<()>),
}

/// State shared by the API and every worker
struct Pipeline {
    oms: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    prices: Arc<PriceCache>,
    pools: Arc<MemoryPools>,
    latency: Arc<LatencyTracker>,
    counters: WorkerCounters,
    order_queue: QueueSender<OrderStatusUpdate>,
    fill_queue: QueueSender<Fill>,
    position_queue: QueueSender<PositionUpdate>,
    tick_queue: QueueSender<MarketTick>,
    book_queue: QueueSender<OrderBookSnapshot>,
    tick_bus: broadcast::Sender<MarketTick>,
    book_bus: broadcast::Sender<OrderBookSnapshot>,
    position_bus: broadcast::Sender<Position>,
}

impl Pipeline {
    fn failed(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    async fn handle_order_update(&self, update: OrderStatusUpdate) {
        self.reconcile(update).await;
        self.counters.order_updates.fetch_add(1, Ordering::Relaxed);
    }

    async fn reconcile(&self, update: OrderStatusUpdate) {
        let order_id = update.order_id;
        let status = update.status;
        match self.oms.apply_status_update(update).await {
            Ok(Some(order)) => debug!("Order {} moved to {} by venue report", order_id, order.status),
            Ok(None) => debug!("Venue report {} for order {} ignored", status, order_id),
            Err(e) => {
                self.failed();
                warn!("Status report for order {} skipped: {}", order_id, e);
            }
        }
    }

    async fn handle_fill(&self, fill: Fill) {
        self.book_fill(fill).await;
        self.counters.fills.fetch_add(1, Ordering::Relaxed);
    }

    async fn book_fill(&self, fill: Fill) {
        let started = Instant::now();

        let outcome = match self.oms.apply_fill(fill.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.failed();
                warn!("Fill {} for order {} skipped: {}", fill.trade_id, fill.order_id, e);
                return;
            }
        };
        if outcome.duplicate {
            debug!("Fill {} already applied to order {}", fill.trade_id, fill.order_id);
            return;
        }
        if !outcome.persisted {
            warn!("Fill {} applied to order {} but not yet journaled", fill.trade_id, fill.order_id);
        }

        match self
            .positions
            .update_position_from_fill(&outcome.order.strategy_id, &fill)
            .await
        {
            Ok(Some(position)) => {
                self.latency.record_duration(LatencyPoint::PositionUpdated, started.elapsed());
                self.position_queue.offer(PositionUpdate {
                    key: position.key.clone(),
                    trade_id: fill.trade_id,
                });
            }
            Ok(None) => debug!("Fill {} already booked to a position", fill.trade_id),
            Err(e @ PositionError::Persistence { .. }) => {
                self.failed();
                error!("Fill {} booked to a position but not yet journaled: {}", fill.trade_id, e);
                self.position_queue.offer(PositionUpdate {
                    key: PositionKey::new(&outcome.order.strategy_id, &fill.symbol, &fill.exchange),
                    trade_id: fill.trade_id,
                });
            }
            Err(e) => {
                self.failed();
                error!("Fill {} on order {} not booked to a position: {}", fill.trade_id, fill.order_id, e);
            }
        }
    }

    async fn handle_position_update(&self, update: PositionUpdate) {
        match self.positions.mark_to_market(&update.key).await {
            Ok(position) => {
                if self.position_bus.receiver_count() > 0 {
                    let _ = self.position_bus.send(position);
                }
            }
            Err(e) => {
                self.failed();
                warn!("Position {} not marked after fill {}: {}", update.key, update.trade_id, e);
            }
        }
        self.counters.position_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_tick(&self, tick: MarketTick) {
        if let Some(px) = tick.mark_price() {
            self.prices.update(&tick.symbol, &tick.exchange, px);
        }
        if self.tick_bus.receiver_count() > 0 {
            let _ = self.tick_bus.send(tick.clone());
        }
        self.pools.ticks.release(tick);
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_book(&self, book: OrderBookSnapshot) {
        if self.book_bus.receiver_count() > 0 {
            let _ = self.book_bus.send(book.clone());
        }
        self.pools.books.release(book);
        self.counters.books.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_drops(&self) -> QueueDrops {
        QueueDrops {
            order_updates: self.order_queue.dropped(),
            fills: self.fill_queue.dropped(),
            position_updates: self.position_queue.dropped(),
            ticks: self.tick_queue.dropped(),
            books: self.book_queue.dropped(),
        }
    }

    fn metrics(&self) -> ServiceMetrics {
        ServiceMetrics::new(
            self.oms.metrics(),
            self.positions.stats(),
            self.counters.snapshot(),
            self.queue_drops(),
            self.pools.stats(),
            self.latency.all_stats(),
            self.latency.dropped_traces(),
        )
    }

    async fn maintain(&self, stale_after: Duration) {
        let stale = self.latency.cleanup_stale(stale_after);
        let orders = self.oms.flush_outbox().await;
        let positions = self.positions.flush_outbox().await;
        let locks = self.oms.prune_locks();
        if stale + orders + positions + locks > 0 {
            debug!(
                "Maintenance: {} stale traces, {} orders and {} positions flushed, {} locks pruned",
                stale, orders, positions, locks
            );
        }

        let m = self.metrics();
        info!(
            "Orders {} total, {} filled, {} canceled, {} rejected, {} active | fills {} | dropped {} | failures {} | avg fill {:?}",
            m.total_orders,
            m.filled_orders,
            m.canceled_orders,
            m.rejected_orders,
            m.oms.active_orders,
            m.workers.fills,
            m.queue_drops.total(),
            m.workers.failures,
            m.avg_fill_time
        );
    }
}

/// Drain `rx` until shutdown, then handle what is already queued
async fn drain<T, F, Fut>(
    name: &'static str,
    mut rx: mpsc::Receiver<T>,
    mut shutdown: broadcast::Receiver<()>,
    mut handle: F,
) where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    info!("{} worker started", name);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            item = rx.recv() => match item {
                Some(item) => handle(item).await,
                None => break,
            },
        }
    }

    let mut remaining = 0usize;
    while let Ok(item) = rx.try_recv() {
        handle(item).await;
        remaining += 1;
    }
    info!("{} worker stopped ({} items drained at shutdown)", name, remaining);
}

/// The execution core behind one in-process API
pub struct ExecutionService {
    config: ServiceConfig,
    pipeline: Arc<Pipeline>,
    threads: ThreadManager,
    receivers: Mutex<Option<Receivers>>,
    workers: Mutex<Vec<Worker>>,
    shutdown: broadcast::Sender<()>,
}

impl ExecutionService {
    /// Wire every component from `config`
    pub fn new(
        config: ServiceConfig,
        adapters: AdapterRegistry,
        store: Arc<dyn EventStore>,
        prices: Arc<PriceCache>,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let latency = Arc::new(LatencyTracker::new(&config.latency));
        let oms = OrderManager::new(config.oms.clone(), adapters, Arc::clone(&store))?
            .with_latency_tracker(Arc::clone(&latency));
        let positions = PositionTracker::new(config.positions.clone(), store, prices.clone());

        let pools = MemoryPools::new(&config.pools);
        pools.preallocate();

        let mut affinity = config.affinity.clone();
        affinity.pin_threads |= config.pin_workers;
        let threads = ThreadManager::new(Arc::new(AffinityManager::detect(affinity)));

        let queues = &config.queues;
        let (order_queue, order_updates) = queue::bounded("order_updates", queues.order_updates);
        let (fill_queue, fills) = queue::bounded("fills", queues.fills);
        let (position_queue, position_updates) = queue::bounded("position_updates", queues.position_updates);
        let (tick_queue, ticks) = queue::bounded("ticks", queues.ticks);
        let (book_queue, books) = queue::bounded("books", queues.books);

        let (tick_bus, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let (book_bus, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let (position_bus, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        info!(
            "Execution service configured: venues {:?}, pin_workers={}",
            config.exchanges, config.pin_workers
        );

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                oms: Arc::new(oms),
                positions: Arc::new(positions),
                prices,
                pools: Arc::new(pools),
                latency,
                counters: WorkerCounters::default(),
                order_queue,
                fill_queue,
                position_queue,
                tick_queue,
                book_queue,
                tick_bus,
                book_bus,
                position_bus,
            }),
            config,
            threads,
            receivers: Mutex::new(Some(Receivers {
                order_updates,
                fills,
                position_updates,
                ticks,
                books,
            })),
            workers: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Rebuild orders and positions from the store. Call before `start`.
    pub async fn recover(&self) -> ServiceResult<RecoveryReport> {
        let orders = self.pipeline.oms.recover().await?;
        let positions = self.pipeline.positions.recover().await?;
        info!(
            "Recovered {} orders ({} active) and {} positions",
            orders.orders_recovered, orders.active_orders, positions
        );
        Ok(RecoveryReport { orders, positions })
    }

    /// Launch the five workers and the monitoring task.
    ///
    /// A service starts once; a stopped service is not restarted.
    pub fn start(&self) -> ServiceResult<()> {
        let receivers = self.receivers.lock().take().ok_or(ServiceError::AlreadyStarted)?;
        let mut workers = Vec::with_capacity(6);

        let p = Arc::clone(&self.pipeline);
        let shutdown = self.shutdown.subscribe();
        workers.push(self.spawn_worker("order-updates", WorkloadType::OrderProcessing, move || {
            drain("order_updates", receivers.order_updates, shutdown, move |update| {
                let p = Arc::clone(&p);
                async move { p.handle_order_update(update).await }
            })
        })?);

        let p = Arc::clone(&self.pipeline);
        let shutdown = self.shutdown.subscribe();
        workers.push(self.spawn_worker("fills", WorkloadType::OrderProcessing, move || {
            drain("fills", receivers.fills, shutdown, move |fill| {
                let p = Arc::clone(&p);
                async move { p.handle_fill(fill).await }
            })
        })?);

        let p = Arc::clone(&self.pipeline);
        let shutdown = self.shutdown.subscribe();
        workers.push(self.spawn_worker("position-updates", WorkloadType::RiskCheck, move || {
            drain("position_updates", receivers.position_updates, shutdown, move |update| {
                let p = Arc::clone(&p);
                async move { p.handle_position_update(update).await }
            })
        })?);

        let p = Arc::clone(&self.pipeline);
        let shutdown = self.shutdown.subscribe();
        workers.push(self.spawn_worker("ticks", WorkloadType::MarketData, move || {
            drain("ticks", receivers.ticks, shutdown, move |tick| {
                p.handle_tick(tick);
                std::future::ready(())
            })
        })?);

        let p = Arc::clone(&self.pipeline);
        let shutdown = self.shutdown.subscribe();
        workers.push(self.spawn_worker("books", WorkloadType::MarketData, move || {
            drain("books", receivers.books, shutdown, move |book| {
                p.handle_book(book);
                std::future::ready(())
            })
        })?);

        workers.push(Worker::Task("monitoring", self.spawn_monitoring()));

        self.workers.lock().extend(workers);
        info!("Execution service started");
        Ok(())
    }

    fn spawn_worker<F, Fut>(&self, name: &'static str, workload: WorkloadType, run: F) -> ServiceResult<Worker>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.config.pin_workers {
            return Ok(Worker::Task(name, tokio::spawn(run())));
        }

        let thread = self.threads.spawn(name, workload, move || {
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime.block_on(run()),
                Err(e) => error!("Worker {} could not build its runtime: {}", name, e),
            }
        })?;
        Ok(Worker::Thread(name, thread))
    }

    fn spawn_monitoring(&self) -> JoinHandle<()> {
        let p = Arc::clone(&self.pipeline);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.monitoring_interval();
        let stale_after = Duration::from_millis(self.config.latency.stale_after_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => p.maintain(stale_after).await,
                }
            }
            debug!("Monitoring task stopped");
        })
    }

    /// Signal every worker and wait for them to finish
    pub async fn stop(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        let _ = self.shutdown.send(());

        for worker in workers {
            match worker {
                Worker::Task(name, handle) => {
                    if let Err(e) = handle.await {
                        error!("Worker {} ended abnormally: {}", name, e);
                    }
                }
                Worker::Thread(name, thread) => {
                    match tokio::task::spawn_blocking(move || thread.join()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Worker {} ended abnormally: {}", name, e),
                        Err(e) => error!("Worker {} could not be joined: {}", name, e),
                    }
                }
            }
        }

        let flushed = self.pipeline.oms.flush_outbox().await + self.pipeline.positions.flush_outbox().await;
        if flushed > 0 {
            info!("Flushed {} aggregates at shutdown", flushed);
        }
        info!("Execution service stopped");
    }

    /// True between `start` and `stop`
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// One maintenance pass, as run by the monitoring task
    pub async fn run_maintenance(&self) {
        let stale_after = Duration::from_millis(self.config.latency.stale_after_ms);
        self.pipeline.maintain(stale_after).await;
    }

    // Orders

    /// Validate, persist and route a new order
    pub async fn place_order(&self, request: OrderRequest) -> ServiceResult<Order> {
        let placed = self.pipeline.oms.place_order(request).await?;
        Ok(placed.order)
    }

    /// Place an order from a pooled ticket; the ticket goes back to the pool
    pub async fn place_ticket(&self, ticket: PooledOrder) -> ServiceResult<Order> {
        let mut request = match ticket.price {
            Some(price) => OrderRequest::limit(
                ticket.strategy_id.as_str(),
                ticket.symbol.as_str(),
                ticket.exchange.as_str(),
                ticket.side,
                ticket.quantity,
                price,
            ),
            None => OrderRequest::market(
                ticket.strategy_id.as_str(),
                ticket.symbol.as_str(),
                ticket.exchange.as_str(),
                ticket.side,
                ticket.quantity,
            ),
        };
        if !ticket.client_order_id.is_empty() {
            request = request.with_client_order_id(ticket.client_order_id.as_str());
        }
        self.pipeline.pools.orders.release(ticket);
        self.place_order(request).await
    }

    /// Cancel at the venue, then locally
    pub async fn cancel_order(&self, order_id: Uuid) -> ServiceResult<Order> {
        Ok(self.pipeline.oms.cancel_order(order_id).await?)
    }

    /// Change price and/or quantity of a working order
    pub async fn modify_order(&self, order_id: Uuid, price: Option<Px>, quantity: Option<Qty>) -> ServiceResult<Order> {
        Ok(self.pipeline.oms.modify_order(order_id, price, quantity).await?)
    }

    /// Order by id, active or archived
    pub fn get_order(&self, order_id: Uuid) -> ServiceResult<Order> {
        Ok(self.pipeline.oms.get_order(order_id)?)
    }

    /// Working orders, optionally for one strategy
    #[must_use]
    pub fn get_active_orders(&self, strategy_id: Option<&str>) -> Vec<Order> {
        self.pipeline.oms.get_active_orders(strategy_id)
    }

    /// Most recent terminal orders of a strategy
    #[must_use]
    pub fn get_order_history(&self, strategy_id: &str, limit: usize) -> Vec<Order> {
        self.pipeline.oms.get_order_history(strategy_id, limit)
    }

    /// Order lifecycle events
    #[must_use]
    pub fn subscribe_orders(&self) -> broadcast::Receiver<OrderEvent> {
        self.pipeline.oms.subscribe()
    }

    // Positions

    /// Position for a strategy, symbol and venue; flat when never traded
    pub async fn get_position(&self, strategy_id: &str, symbol: &str, exchange: &str) -> ServiceResult<Position> {
        Ok(self
            .pipeline
            .positions
            .get_position(&PositionKey::new(strategy_id, symbol, exchange))
            .await?)
    }

    /// Every position, optionally for one strategy
    #[must_use]
    pub fn get_all_positions(&self, strategy_id: Option<&str>) -> Vec<Position> {
        self.pipeline.positions.get_all_positions(strategy_id)
    }

    /// Re-value a position at the current mark
    pub async fn mark_position(&self, strategy_id: &str, symbol: &str, exchange: &str) -> ServiceResult<Position> {
        Ok(self
            .pipeline
            .positions
            .mark_to_market(&PositionKey::new(strategy_id, symbol, exchange))
            .await?)
    }

    /// Aggregate PnL
    #[must_use]
    pub fn pnl_summary(&self, strategy_id: Option<&str>) -> PnlSummary {
        self.pipeline.positions.pnl_summary(strategy_id)
    }

    /// Positions after each fill, marked
    #[must_use]
    pub fn subscribe_positions(&self) -> broadcast::Receiver<Position> {
        self.pipeline.position_bus.subscribe()
    }

    // Intake. Each returns false when the item was dropped.

    /// Venue status report
    pub fn submit_order_update(&self, update: OrderStatusUpdate) -> bool {
        self.pipeline.order_queue.offer(update)
    }

    /// Venue execution report
    pub fn submit_fill(&self, fill: Fill) -> bool {
        self.pipeline.fill_queue.offer(fill)
    }

    /// Ask for a position to be re-marked
    pub fn submit_position_update(&self, update: PositionUpdate) -> bool {
        self.pipeline.position_queue.offer(update)
    }

    /// Market tick, usually taken from [`MemoryPools::ticks`]
    pub fn submit_tick(&self, tick: MarketTick) -> bool {
        self.pipeline.tick_queue.offer(tick)
    }

    /// Book snapshot, usually taken from [`MemoryPools::books`]
    pub fn submit_book(&self, book: OrderBookSnapshot) -> bool {
        self.pipeline.book_queue.offer(book)
    }

    /// Ticks after the price cache saw them
    #[must_use]
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<MarketTick> {
        self.pipeline.tick_bus.subscribe()
    }

    /// Book snapshots
    #[must_use]
    pub fn subscribe_books(&self) -> broadcast::Receiver<OrderBookSnapshot> {
        self.pipeline.book_bus.subscribe()
    }

    // Observability and accessors

    /// Counters across every component
    #[must_use]
    pub fn metrics(&self) -> ServiceMetrics {
        self.pipeline.metrics()
    }

    /// Items dropped per queue
    #[must_use]
    pub fn queue_drops(&self) -> QueueDrops {
        self.pipeline.queue_drops()
    }

    /// Object pools for producers
    #[must_use]
    pub fn pools(&self) -> &Arc<MemoryPools> {
        &self.pipeline.pools
    }

    /// Latency tracker shared with the order manager
    #[must_use]
    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.pipeline.latency
    }

    /// Price cache fed by the tick worker
    #[must_use]
    pub fn prices(&self) -> &Arc<PriceCache> {
        &self.pipeline.prices
    }

    /// Order manager
    #[must_use]
    pub fn oms(&self) -> &Arc<OrderManager> {
        &self.pipeline.oms
    }

    /// Position tracker
    #[must_use]
    pub fn positions(&self) -> &Arc<PositionTracker> {
        &self.pipeline.positions
    }

    /// Effective configuration
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

impl fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionService")
            .field("exchanges", &self.config.exchanges)
            .field("running", &self.is_running())
            .field("queue_drops", &self.queue_drops())
            .finish_non_exhaustive()
    }
}

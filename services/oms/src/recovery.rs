//! Order recovery and reconciliation
//!
//! Rebuilds the active index and the history from the event store after a
//! restart, then checks each recovered order's quantities against its fills.

use crate::error::OmsResult;
use crate::manager::OrderManager;
use crate::order::{AGGREGATE_PREFIX, Order, OrderStatus};
use common::Qty;
use serde::Serialize;
use std::time::Instant;
use storage::load_aggregate;
use tracing::{debug, error, info, warn};

/// Recovery statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Orders rebuilt
    pub orders_recovered: usize,
    /// Of those, still working at the venue or awaiting acknowledgement
    pub active_orders: usize,
    /// Of those, terminal
    pub archived_orders: usize,
    /// Events folded in after snapshots
    pub events_replayed: usize,
    /// Orders that started from a snapshot
    pub from_snapshots: usize,
    /// Orders whose quantities disagree with their fills
    pub discrepancies_found: usize,
    /// Aggregates that could not be rebuilt
    pub failures: usize,
    /// Wall time (ms)
    pub recovery_time_ms: u64,
}

/// Quantity or status inconsistency in a rebuilt order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// Filled quantity differs from the sum of fills
    FilledMismatch {
        /// Order's filled quantity
        recorded: Qty,
        /// Sum of the order's fills
        from_fills: Qty,
    },
    /// `remaining != quantity - filled`
    RemainingMismatch {
        /// Order's remaining quantity
        recorded: Qty,
        /// Expected remaining quantity
        expected: Qty,
    },
    /// Working order whose status disagrees with its quantities
    StatusMismatch {
        /// Recorded status
        recorded: OrderStatus,
        /// Status implied by quantities
        expected: OrderStatus,
    },
}

/// Check an order's bookkeeping against its own fills
#[must_use]
pub fn check_order(order: &Order) -> Vec<Discrepancy> {
    let mut found = Vec::new();
    let from_fills = order
        .fills
        .iter()
        .fold(Qty::ZERO, |total, fill| total + fill.quantity);
    if from_fills != order.filled_quantity {
        found.push(Discrepancy::FilledMismatch {
            recorded: order.filled_quantity,
            from_fills,
        });
    }
    let expected = order.quantity - order.filled_quantity;
    if expected != order.remaining_quantity {
        found.push(Discrepancy::RemainingMismatch {
            recorded: order.remaining_quantity,
            expected,
        });
    }
    if matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled) {
        let implied = order.status_from_quantities();
        if implied != order.status {
            found.push(Discrepancy::StatusMismatch {
                recorded: order.status,
                expected: implied,
            });
        }
    }
    found
}

impl OrderManager {
    /// Rebuild in-memory state from the event store.
    ///
    /// Each order is loaded from its latest snapshot plus the tail of its
    /// history. An aggregate that fails to load is logged and skipped.
    pub async fn recover(&self) -> OmsResult<RecoveryStats> {
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        info!("Starting order recovery");
        let ids = self.store.aggregate_ids(AGGREGATE_PREFIX).await?;

        for id in ids {
            let loaded = match load_aggregate::<Order>(self.store.as_ref(), &id).await {
                Ok(Some(loaded)) => loaded,
                Ok(None) => continue,
                Err(e) => {
                    error!("Could not recover {}: {}", id, e);
                    stats.failures += 1;
                    continue;
                }
            };

            let order = loaded.state;
            let discrepancies = check_order(&order);
            if !discrepancies.is_empty() {
                warn!("Order {} recovered with discrepancies: {:?}", order.id, discrepancies);
                stats.discrepancies_found += discrepancies.len();
            }

            debug!(
                "Recovered order {} at v{} ({} replayed, snapshot={})",
                order.id, loaded.version, loaded.replayed, loaded.from_snapshot
            );
            stats.orders_recovered += 1;
            stats.events_replayed += loaded.replayed;
            if loaded.from_snapshot {
                stats.from_snapshots += 1;
            }
            if order.is_terminal() {
                stats.archived_orders += 1;
            } else {
                stats.active_orders += 1;
            }
            self.store_order(order);
        }

        stats.recovery_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "Recovery completed: {} orders ({} active, {} archived), {} events replayed, {} failures in {}ms",
            stats.orders_recovered,
            stats.active_orders,
            stats.archived_orders,
            stats.events_replayed,
            stats.failures,
            stats.recovery_time_ms
        );
        Ok(stats)
    }
}

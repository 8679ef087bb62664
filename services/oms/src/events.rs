//! Persisted order changes and replay

use crate::order::{Order, OrderStatus};
use chrono::{DateTime, Utc};
use common::{Px, Qty};
use positions::Fill;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use storage::{Aggregate, DomainEvent, NewEvent, StorageError, StorageResult};

/// One state change of an order, as journaled to the event store.
///
/// The live path and replay both go through [`Order::apply_change`], so a
/// replayed order is identical to the one that was in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderChange {
    /// Order accepted for routing
    Created {
        /// Initial state
        order: Box<Order>,
    },
    /// Exchange acknowledged the order
    Accepted {
        /// Venue-assigned id
        exchange_order_id: String,
        /// Submission to acknowledgement
        latency: Duration,
        /// When
        at: DateTime<Utc>,
    },
    /// Refused locally or by the venue
    Rejected {
        /// Why
        reason: String,
        /// When
        at: DateTime<Utc>,
    },
    /// Execution booked
    Filled {
        /// The execution
        fill: Fill,
    },
    /// Cancel acknowledged
    Canceled {
        /// When
        at: DateTime<Utc>,
    },
    /// Modification acknowledged
    Modified {
        /// New limit price, if changed
        price: Option<Px>,
        /// New total quantity
        quantity: Qty,
        /// When
        at: DateTime<Utc>,
    },
    /// Status reported by the venue
    StatusChanged {
        /// New status
        status: OrderStatus,
        /// Venue reason, if any
        reason: Option<String>,
        /// When
        at: DateTime<Utc>,
    },
}

impl OrderChange {
    /// Event type name
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "OrderCreated",
            Self::Accepted { .. } => "OrderAccepted",
            Self::Rejected { .. } => "OrderRejected",
            Self::Filled { .. } => "OrderFilled",
            Self::Canceled { .. } => "OrderCanceled",
            Self::Modified { .. } => "OrderModified",
            Self::StatusChanged { .. } => "OrderStatusChanged",
        }
    }

    /// Encode for the event store
    pub fn to_event(&self) -> StorageResult<NewEvent> {
        let event = NewEvent::from_payload(self.event_type(), self)?;
        Ok(match self.timestamp() {
            Some(at) => event.at(at),
            None => event,
        })
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Created { order } => Some(order.created_at),
            Self::Filled { fill } => Some(fill.timestamp),
            Self::Accepted { at, .. }
            | Self::Rejected { at, .. }
            | Self::Canceled { at }
            | Self::Modified { at, .. }
            | Self::StatusChanged { at, .. } => Some(*at),
        }
    }
}

impl Order {
    /// Apply a journaled change. Transition checks happen before a change
    /// is created, so this never fails.
    pub fn apply_change(&mut self, change: &OrderChange) {
        match change {
            OrderChange::Created { order } => *self = (**order).clone(),
            OrderChange::Accepted {
                exchange_order_id,
                latency,
                at,
            } => {
                self.status = OrderStatus::New;
                self.exchange_order_id = Some(exchange_order_id.clone());
                self.submit_latency = Some(*latency);
                self.updated_at = *at;
            }
            OrderChange::Rejected { reason, at } => {
                self.status = OrderStatus::Rejected;
                self.error_message = Some(reason.clone());
                self.updated_at = *at;
            }
            OrderChange::Filled { fill } => self.book_fill(fill),
            OrderChange::Canceled { at } => {
                self.status = OrderStatus::Canceled;
                self.updated_at = *at;
            }
            OrderChange::Modified { price, quantity, at } => {
                if price.is_some() {
                    self.price = *price;
                }
                self.quantity = *quantity;
                self.remaining_quantity = *quantity - self.filled_quantity;
                self.amendments += 1;
                self.updated_at = *at;
            }
            OrderChange::StatusChanged { status, reason, at } => {
                self.status = *status;
                if reason.is_some() {
                    self.error_message = reason.clone();
                }
                self.updated_at = *at;
            }
        }
    }
}

impl Aggregate for Order {
    fn genesis(event: &DomainEvent) -> StorageResult<Self> {
        match event.payload_as::<OrderChange>()? {
            OrderChange::Created { order } => Ok(*order),
            other => Err(StorageError::corrupt(
                &event.aggregate_id,
                format!("first event is {}", other.event_type()),
            )),
        }
    }

    fn apply(&mut self, event: &DomainEvent) -> StorageResult<()> {
        let change = event.payload_as::<OrderChange>()?;
        if matches!(change, OrderChange::Created { .. }) {
            return Err(StorageError::corrupt(&event.aggregate_id, "created twice"));
        }
        self.apply_change(&change);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderRequest, aggregate_id};
    use common::Side;
    use storage::{EventStore, MemoryEventStore, replay_all};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_replay_reproduces_live_state() -> anyhow::Result<()> {
        let store = MemoryEventStore::new();
        let request = OrderRequest::limit("s1", "BTC-USD", "X", Side::Buy, Qty::from_int(2), Px::from_int(100));
        let mut live = Order::from_request(request, Utc::now());
        let id = aggregate_id(live.id);

        let changes = vec![
            OrderChange::Created {
                order: Box::new(live.clone()),
            },
            OrderChange::Accepted {
                exchange_order_id: "X-1".into(),
                latency: Duration::from_micros(250),
                at: Utc::now(),
            },
            OrderChange::Filled {
                fill: Fill::new(live.id, "t1", "BTC-USD", "X", Side::Buy, Qty::from_int(1), Px::from_int(100)),
            },
            OrderChange::Modified {
                price: Some(Px::from_int(101)),
                quantity: Qty::from_int(3),
                at: Utc::now(),
            },
        ];
        for change in &changes {
            live.apply_change(change);
            store.save_events(&id, vec![change.to_event()?]).await?;
        }

        let replayed = replay_all::<Order>(&store, &id).await?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(replayed.state, live);
        assert_eq!(replayed.version, 4);
        assert_eq!(live.remaining_quantity, Qty::from_int(2));
        assert_eq!(live.status, OrderStatus::PartiallyFilled);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_must_start_with_created() -> anyhow::Result<()> {
        let store = MemoryEventStore::new();
        let id = aggregate_id(Uuid::new_v4());
        let change = OrderChange::Canceled { at: Utc::now() };
        store.save_events(&id, vec![change.to_event()?]).await?;

        let result = replay_all::<Order>(&store, &id).await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        Ok(())
    }
}

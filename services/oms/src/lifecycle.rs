//! Order lifecycle management

use crate::error::{OmsError, OmsResult};
use crate::order::{Order, OrderRequest, OrderStatus, OrderType};
use common::{Px, Qty};
use std::collections::HashMap;
use tracing::debug;

/// Order lifecycle manager
pub struct OrderLifecycleManager {
    /// Valid state transitions
    valid_transitions: HashMap<OrderStatus, Vec<OrderStatus>>,
}

impl Default for OrderLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderLifecycleManager {
    /// Create new lifecycle manager
    #[must_use]
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(OrderStatus::Pending, vec![OrderStatus::New, OrderStatus::Rejected]);

        valid_transitions.insert(
            OrderStatus::New,
            vec![
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::Canceled,
                OrderStatus::Rejected,
            ],
        );

        // PartiallyFilled -> New only when a venue report disagrees on quantities
        valid_transitions.insert(
            OrderStatus::PartiallyFilled,
            vec![
                OrderStatus::PartiallyFilled,
                OrderStatus::New,
                OrderStatus::Filled,
                OrderStatus::Canceled,
            ],
        );

        // Terminal states have no transitions
        valid_transitions.insert(OrderStatus::Filled, vec![]);
        valid_transitions.insert(OrderStatus::Canceled, vec![]);
        valid_transitions.insert(OrderStatus::Rejected, vec![]);

        Self { valid_transitions }
    }

    /// Validate an order request before anything is created
    pub fn validate_request(&self, request: &OrderRequest) -> OmsResult<()> {
        if request.symbol.trim().is_empty() {
            return Err(OmsError::validation("Symbol is required"));
        }
        if request.exchange.trim().is_empty() {
            return Err(OmsError::validation("Exchange is required"));
        }
        if request.strategy_id.trim().is_empty() {
            return Err(OmsError::validation("Strategy is required"));
        }
        if !request.quantity.is_positive() {
            return Err(OmsError::validation(format!(
                "Order quantity must be positive, got {}",
                request.quantity
            )));
        }

        let needs_price = matches!(request.order_type, OrderType::Limit | OrderType::StopLimit);
        let needs_stop = matches!(request.order_type, OrderType::Stop | OrderType::StopLimit);
        if needs_price && !request.price.is_some_and(|p| p.is_positive()) {
            return Err(OmsError::validation(format!(
                "{:?} order requires a positive price",
                request.order_type
            )));
        }
        if needs_stop && !request.stop_price.is_some_and(|p| p.is_positive()) {
            return Err(OmsError::validation(format!(
                "{:?} order requires a positive stop price",
                request.order_type
            )));
        }

        debug!("Order request for {} {} validated", request.strategy_id, request.symbol);
        Ok(())
    }

    /// Validate state transition
    pub fn validate_transition(&self, order: &Order, new_status: OrderStatus) -> OmsResult<()> {
        if self.can_transition(order.status, new_status) {
            debug!("Valid transition: {} -> {}", order.status, new_status);
            return Ok(());
        }
        Err(OmsError::InvalidOrderState {
            order_id: order.id,
            operation: "moved",
            status: order.status,
        })
    }

    /// Is `from -> to` in the transition table
    #[must_use]
    pub fn can_transition(&self, from: OrderStatus, to: OrderStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .is_some_and(|next| next.contains(&to))
    }

    /// Check if order can be canceled
    #[must_use]
    pub const fn can_cancel(&self, order: &Order) -> bool {
        matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    /// Check if order can be modified
    #[must_use]
    pub const fn can_modify(&self, order: &Order) -> bool {
        matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    /// Validate a modification against the order's current fills
    pub fn validate_modification(&self, order: &Order, price: Option<Px>, quantity: Option<Qty>) -> OmsResult<()> {
        if price.is_none() && quantity.is_none() {
            return Err(OmsError::validation("Modification changes nothing"));
        }
        if let Some(price) = price {
            if !price.is_positive() {
                return Err(OmsError::validation(format!("New price must be positive, got {price}")));
            }
            if order.order_type == OrderType::Market {
                return Err(OmsError::validation("Market orders have no price to modify"));
            }
        }
        if let Some(quantity) = quantity {
            if quantity <= order.filled_quantity {
                return Err(OmsError::validation(format!(
                    "New quantity {} must exceed filled quantity {}",
                    quantity, order.filled_quantity
                )));
            }
        }
        Ok(())
    }

    /// Status to adopt for a venue-reported status, if any.
    ///
    /// Working reports are reconciled against local fill quantities,
    /// `Filled` is only accepted when nothing remains, and reports that
    /// would move the order backwards are ignored.
    #[must_use]
    pub fn reconcile_report(&self, order: &Order, reported: OrderStatus) -> Option<OrderStatus> {
        let target = match reported {
            OrderStatus::Pending => return None,
            OrderStatus::New | OrderStatus::PartiallyFilled => order.status_from_quantities(),
            OrderStatus::Filled if !order.remaining_quantity.is_zero() => return None,
            other => other,
        };
        if target == order.status || !self.can_transition(order.status, target) {
            return None;
        }
        Some(target)
    }

    /// Get next valid states
    #[must_use]
    pub fn get_valid_transitions(&self, status: OrderStatus) -> Vec<OrderStatus> {
        self.valid_transitions.get(&status).cloned().unwrap_or_default()
    }
}

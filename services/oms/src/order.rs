//! Order definitions and structures

use chrono::{DateTime, Utc};
use common::{Amount, Px, Qty, Side};
use positions::Fill;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Aggregate id prefix for orders in the event store
pub const AGGREGATE_PREFIX: &str = "order-";

/// Event store aggregate id for an order
#[must_use]
pub fn aggregate_id(order_id: Uuid) -> String {
    format!("{AGGREGATE_PREFIX}{order_id}")
}

/// Order type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute at the best available price
    Market,
    /// Execute at `price` or better
    #[default]
    Limit,
    /// Becomes a market order once `stop_price` trades
    Stop,
    /// Becomes a limit order once `stop_price` trades
    StopLimit,
}

/// Time in force
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Good till canceled
    #[default]
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
    /// Expires at end of session
    Day,
}

/// Order status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged
    #[default]
    Pending,
    /// Working at the exchange
    New,
    /// Some quantity executed
    PartiallyFilled,
    /// Fully executed
    Filled,
    /// Canceled
    Canceled,
    /// Refused locally or by the exchange
    Rejected,
}

impl OrderStatus {
    /// No further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Working or awaiting acknowledgement
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::New => "new",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order request for creating new orders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Caller-chosen order id; generated when absent
    pub id: Option<Uuid>,
    /// Client order ID
    pub client_order_id: Option<String>,
    /// Owning strategy
    pub strategy_id: String,
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
    /// Side
    pub side: Side,
    /// Order type
    pub order_type: OrderType,
    /// Time in force
    pub time_in_force: TimeInForce,
    /// Quantity
    pub quantity: Qty,
    /// Limit price
    pub price: Option<Px>,
    /// Stop trigger price
    pub stop_price: Option<Px>,
}

impl OrderRequest {
    /// GTC limit order
    pub fn limit(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        side: Side,
        quantity: Qty,
        price: Px,
    ) -> Self {
        Self {
            id: None,
            client_order_id: None,
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            exchange: exchange.into(),
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            quantity,
            price: Some(price),
            stop_price: None,
        }
    }

    /// IOC market order
    pub fn market(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        side: Side,
        quantity: Qty,
    ) -> Self {
        Self {
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Ioc,
            price: None,
            ..Self::limit(strategy_id, symbol, exchange, side, quantity, Px::ZERO)
        }
    }

    /// Set the client order id
    #[must_use]
    pub fn with_client_order_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self
    }

    /// Use a caller-chosen order id
    #[must_use]
    pub const fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// Order structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID
    pub id: Uuid,
    /// Client order ID (optional)
    pub client_order_id: Option<String>,
    /// Owning strategy
    pub strategy_id: String,
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
    /// Order side
    pub side: Side,
    /// Order type
    pub order_type: OrderType,
    /// Time in force
    pub time_in_force: TimeInForce,
    /// Order quantity
    pub quantity: Qty,
    /// Limit price (for limit orders)
    pub price: Option<Px>,
    /// Stop price (for stop orders)
    pub stop_price: Option<Px>,
    /// Order status
    pub status: OrderStatus,
    /// Executed quantity
    pub filled_quantity: Qty,
    /// Quantity still working
    pub remaining_quantity: Qty,
    /// Volume-weighted fill price, zero until the first fill
    pub avg_fill_price: Px,
    /// Fees across all fills
    pub commission: Amount,
    /// Exchange-assigned id, set on acknowledgement
    pub exchange_order_id: Option<String>,
    /// Reason for the last rejection
    pub error_message: Option<String>,
    /// Time from submission to acknowledgement
    pub submit_latency: Option<Duration>,
    /// Applied fills, in arrival order
    pub fills: Vec<Fill>,
    /// Accepted modifications
    pub amendments: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Pending order from a request
    #[must_use]
    pub fn from_request(request: OrderRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id.unwrap_or_else(Uuid::new_v4),
            client_order_id: request.client_order_id,
            strategy_id: request.strategy_id,
            symbol: request.symbol,
            exchange: request.exchange,
            side: request.side,
            order_type: request.order_type,
            time_in_force: request.time_in_force,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            status: OrderStatus::Pending,
            filled_quantity: Qty::ZERO,
            remaining_quantity: request.quantity,
            avg_fill_price: Px::ZERO,
            commission: Amount::ZERO,
            exchange_order_id: None,
            error_message: None,
            submit_latency: None,
            fills: Vec::new(),
            amendments: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if order is in terminal state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if order is active
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Has a fill with this trade id been applied
    #[must_use]
    pub fn has_trade(&self, trade_id: &str) -> bool {
        self.fills.iter().any(|f| f.trade_id == trade_id)
    }

    /// Status implied by filled quantity alone
    #[must_use]
    pub fn status_from_quantities(&self) -> OrderStatus {
        if self.remaining_quantity.is_zero() {
            OrderStatus::Filled
        } else if self.filled_quantity.is_positive() {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::New
        }
    }

    /// Fill rate in [0, 1]
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        if self.quantity.is_zero() {
            0.0
        } else {
            self.filled_quantity.as_f64() / self.quantity.as_f64()
        }
    }

    /// Book a fill. Terminal orders keep their status.
    pub(crate) fn book_fill(&mut self, fill: &Fill) {
        self.avg_fill_price = Px::vwap(self.avg_fill_price, self.filled_quantity, fill.price, fill.quantity);
        self.filled_quantity += fill.quantity;
        self.remaining_quantity = self.quantity - self.filled_quantity;
        self.commission += fill.commission;
        self.fills.push(fill.clone());
        if !self.is_terminal() {
            self.status = self.status_from_quantities();
        }
        self.updated_at = fill.timestamp;
    }
}

//! Execution reports

use chrono::{DateTime, Utc};
use common::{Amount, Px, Qty, Side};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single execution against an order. Never revised once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Order the execution belongs to
    pub order_id: Uuid,
    /// Exchange trade id, unique per venue
    pub trade_id: String,
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
    /// Direction
    pub side: Side,
    /// Executed quantity
    pub quantity: Qty,
    /// Execution price
    pub price: Px,
    /// Fee charged for this execution
    pub commission: Amount,
    /// Execution time
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    /// Fill with zero commission stamped now
    pub fn new(
        order_id: Uuid,
        trade_id: impl Into<String>,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        side: Side,
        quantity: Qty,
        price: Px,
    ) -> Self {
        Self {
            order_id,
            trade_id: trade_id.into(),
            symbol: symbol.into(),
            exchange: exchange.into(),
            side,
            quantity,
            price,
            commission: Amount::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// Set the commission
    #[must_use]
    pub fn with_commission(mut self, commission: Amount) -> Self {
        self.commission = commission;
        self
    }
}

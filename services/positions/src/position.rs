//! Position state and fill accounting
//!
//! A position is keyed by (strategy, symbol, exchange) and holds a single
//! net side. Fills move it through four cases:
//!
//! | current | fill                     | result                                          |
//! |---------|--------------------------|-------------------------------------------------|
//! | flat    | any                      | adopt fill side, size and price                 |
//! | long    | buy                      | size grows, entry becomes the VWAP              |
//! | long    | sell, smaller            | size shrinks, realize PnL on the closed part    |
//! | long    | sell, equal or larger    | realize on the whole size, open the remainder   |
//!
//! Shorts mirror longs. Fees are debited from realized PnL when the fill is
//! booked.
//!
//! Mark-derived fields (`mark_price`, `unrealized_pnl`, margins) are
//! recomputed by the tracker and never persisted, so replay from the event
//! log and replay from a snapshot fold to identical state.

use crate::fill::Fill;
use chrono::{DateTime, Utc};
use common::{Amount, Px, Qty, Side};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use storage::{Aggregate, DomainEvent, NewEvent, StorageError, StorageResult};

/// Aggregate id prefix for positions in the event store
pub const AGGREGATE_PREFIX: &str = "position-";

/// Identity of a position
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    /// Owning strategy
    pub strategy_id: String,
    /// Instrument
    pub symbol: String,
    /// Venue
    pub exchange: String,
}

impl PositionKey {
    /// Build a key
    pub fn new(strategy_id: impl Into<String>, symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    /// Event store aggregate id
    #[must_use]
    pub fn aggregate_id(&self) -> String {
        format!("{AGGREGATE_PREFIX}{self}")
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.strategy_id, self.symbol, self.exchange)
    }
}

/// Where the current mark price came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSource {
    /// Never marked
    #[default]
    None,
    /// Fresh feed price
    Live,
    /// Feed price older than the freshness window
    Stale,
    /// Feed had nothing; previous mark reused
    LastMark,
    /// Feed had nothing and no previous mark; entry price used
    Entry,
}

/// Margin rates applied to position notional
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginRates {
    /// Initial margin as a fraction of notional
    pub initial: f64,
    /// Maintenance margin as a fraction of notional
    pub maintenance: f64,
}

/// What a fill did to a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillEffect {
    /// PnL realized on the closed quantity, before fees
    pub realized: Amount,
    /// Quantity that offset existing exposure
    pub closed: Qty,
    /// The position changed side
    pub flipped: bool,
}

/// Net position for one (strategy, symbol, exchange)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Identity
    pub key: PositionKey,
    /// Net side; meaningless while flat
    pub side: Side,
    /// Absolute size, zero when flat
    pub size: Qty,
    /// Average entry price, zero when flat
    pub entry_price: Px,
    /// Last mark price used for valuation
    pub mark_price: Px,
    /// Origin of `mark_price`
    pub mark_source: MarkSource,
    /// Open PnL at `mark_price`
    pub unrealized_pnl: Amount,
    /// Closed PnL net of fees
    pub realized_pnl: Amount,
    /// Fees paid over the position's life
    pub commission_paid: Amount,
    /// Initial margin on current notional
    pub margin: Amount,
    /// Maintenance margin on current notional
    pub maintenance_margin: Amount,
    /// Fills booked
    pub fill_count: u64,
    /// Every trade id booked over the position's life
    pub trade_ids: BTreeSet<String>,
    /// Creation time
    pub opened_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Fresh flat position
    #[must_use]
    pub fn flat(key: PositionKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            side: Side::Buy,
            size: Qty::ZERO,
            entry_price: Px::ZERO,
            mark_price: Px::ZERO,
            mark_source: MarkSource::None,
            unrealized_pnl: Amount::ZERO,
            realized_pnl: Amount::ZERO,
            commission_paid: Amount::ZERO,
            margin: Amount::ZERO,
            maintenance_margin: Amount::ZERO,
            fill_count: 0,
            trade_ids: BTreeSet::new(),
            opened_at: at,
            updated_at: at,
        }
    }

    /// True when size is zero
    #[must_use]
    pub const fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Current notional at entry price
    #[must_use]
    pub fn notional(&self) -> Amount {
        self.size.notional(self.entry_price)
    }

    /// Realized plus unrealized
    #[must_use]
    pub fn total_pnl(&self) -> Amount {
        self.realized_pnl + self.unrealized_pnl
    }

    /// Has this trade id already been booked
    #[must_use]
    pub fn has_trade(&self, trade_id: &str) -> bool {
        self.trade_ids.contains(trade_id)
    }

    /// Open PnL of the current exposure at `mark`
    #[must_use]
    pub fn unrealized_at(&self, mark: Px) -> Amount {
        if self.is_flat() {
            return Amount::ZERO;
        }
        let long = Amount::price_move(self.entry_price, mark, self.size);
        match self.side {
            Side::Buy => long,
            Side::Sell => -long,
        }
    }

    /// Book a fill. Returns `None` if the trade id was already booked.
    pub fn apply_fill(&mut self, fill: &Fill) -> Option<FillEffect> {
        if self.has_trade(&fill.trade_id) {
            return None;
        }

        let mut effect = FillEffect {
            realized: Amount::ZERO,
            closed: Qty::ZERO,
            flipped: false,
        };

        if self.is_flat() {
            self.side = fill.side;
            self.size = fill.quantity;
            self.entry_price = fill.price;
        } else if fill.side == self.side {
            self.entry_price = Px::vwap(self.entry_price, self.size, fill.price, fill.quantity);
            self.size += fill.quantity;
        } else if fill.quantity < self.size {
            effect.closed = fill.quantity;
            effect.realized = self.closing_pnl(fill.price, fill.quantity);
            self.size -= fill.quantity;
        } else {
            effect.closed = self.size;
            effect.realized = self.closing_pnl(fill.price, self.size);
            let remainder = fill.quantity - self.size;
            if remainder.is_zero() {
                self.size = Qty::ZERO;
                self.entry_price = Px::ZERO;
            } else {
                self.side = fill.side;
                self.size = remainder;
                self.entry_price = fill.price;
                effect.flipped = true;
            }
        }

        self.realized_pnl += effect.realized - fill.commission;
        self.commission_paid += fill.commission;
        self.fill_count += 1;
        self.trade_ids.insert(fill.trade_id.clone());
        self.updated_at = fill.timestamp;
        if self.is_flat() {
            self.clear_valuation();
        }
        Some(effect)
    }

    /// Fold open PnL at `mark` into realized and go flat
    pub fn close_at(&mut self, mark: Px, at: DateTime<Utc>) -> Amount {
        let pnl = self.unrealized_at(mark);
        self.realized_pnl += pnl;
        self.size = Qty::ZERO;
        self.entry_price = Px::ZERO;
        self.clear_valuation();
        self.updated_at = at;
        pnl
    }

    /// Recompute mark-derived fields
    pub fn revalue(&mut self, mark: Px, source: MarkSource, rates: MarginRates) {
        self.mark_price = mark;
        self.mark_source = source;
        self.unrealized_pnl = self.unrealized_at(mark);
        self.update_margin(rates);
    }

    /// Recompute margins from notional at entry
    pub fn update_margin(&mut self, rates: MarginRates) {
        let notional = self.notional();
        self.margin = notional.scale_by(rates.initial);
        self.maintenance_margin = notional.scale_by(rates.maintenance);
    }

    /// Copy without mark-derived fields, as stored in snapshots
    #[must_use]
    pub fn durable(&self) -> Self {
        let mut copy = self.clone();
        copy.mark_price = Px::ZERO;
        copy.mark_source = MarkSource::None;
        copy.clear_valuation();
        copy
    }

    fn closing_pnl(&self, exit: Px, qty: Qty) -> Amount {
        let long = Amount::price_move(self.entry_price, exit, qty);
        match self.side {
            Side::Buy => long,
            Side::Sell => -long,
        }
    }

    fn clear_valuation(&mut self) {
        self.unrealized_pnl = Amount::ZERO;
        self.margin = Amount::ZERO;
        self.maintenance_margin = Amount::ZERO;
    }
}

/// Persisted position changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionChange {
    /// Position created flat
    Opened {
        /// Identity
        key: PositionKey,
        /// Creation time
        at: DateTime<Utc>,
    },
    /// Fill booked
    Filled {
        /// The execution
        fill: Fill,
    },
    /// Position closed at a mark
    Closed {
        /// Mark used to realize open PnL
        mark: Px,
        /// Close time
        at: DateTime<Utc>,
    },
}

impl PositionChange {
    /// Event type name
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "PositionOpened",
            Self::Filled { .. } => "PositionFilled",
            Self::Closed { .. } => "PositionClosed",
        }
    }

    /// Encode for the event store
    pub fn to_event(&self) -> StorageResult<NewEvent> {
        NewEvent::from_payload(self.event_type(), self)
    }
}

impl Aggregate for Position {
    fn genesis(event: &DomainEvent) -> StorageResult<Self> {
        match event.payload_as::<PositionChange>()? {
            PositionChange::Opened { key, at } => Ok(Self::flat(key, at)),
            other => Err(StorageError::corrupt(
                &event.aggregate_id,
                format!("first event is {}", other.event_type()),
            )),
        }
    }

    fn apply(&mut self, event: &DomainEvent) -> StorageResult<()> {
        match event.payload_as::<PositionChange>()? {
            PositionChange::Opened { .. } => {
                return Err(StorageError::corrupt(&event.aggregate_id, "opened twice"));
            }
            PositionChange::Filled { fill } => {
                self.apply_fill(&fill);
            }
            PositionChange::Closed { mark, at } => {
                self.close_at(mark, at);
            }
        }
        Ok(())
    }
}

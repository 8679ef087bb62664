//! Position and PnL tracking
//!
//! Fills are the only inputs that change position state. Each change is
//! journaled to the event store under `position-<strategy>:<symbol>:<exchange>`
//! and the in-memory book is rebuilt from that journal on restart.
//!
//! Valuation reads marks from a [`PriceFeed`]. When the feed has no price
//! the tracker follows [`MarkFallback`] and logs every fallback.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod fill;
pub mod position;
pub mod price;
pub mod tracker;

pub use error::{PositionError, PositionResult};
pub use fill::Fill;
pub use position::{FillEffect, MarginRates, MarkSource, Position, PositionChange, PositionKey};
pub use price::{NoPrices, PriceCache, PriceFeed, PriceQuote};
pub use tracker::{PnlSummary, PositionTracker, TrackerStats};

use serde::{Deserialize, Serialize};

/// What to mark at when the price feed has nothing for an instrument
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkFallback {
    /// Previous mark, else entry price
    #[default]
    LastMark,
    /// Entry price
    EntryPrice,
    /// Refuse to value
    Reject,
}

/// Position tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// Initial margin as a fraction of notional
    pub initial_margin_rate: f64,
    /// Maintenance margin as a fraction of notional
    pub maintenance_margin_rate: f64,
    /// Feed prices older than this are stale
    pub price_max_age_ms: u64,
    /// Policy when the feed has no price
    pub mark_fallback: MarkFallback,
    /// Snapshot every N events per position, 0 disables
    pub snapshot_every: u64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            initial_margin_rate: 0.1,
            maintenance_margin_rate: 0.05,
            price_max_age_ms: 5_000,
            mark_fallback: MarkFallback::LastMark,
            snapshot_every: 50,
        }
    }
}

impl PositionConfig {
    /// Check rates and bounds
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.initial_margin_rate) {
            return Err(format!("initial_margin_rate {} outside [0, 1]", self.initial_margin_rate));
        }
        if !(0.0..=self.initial_margin_rate).contains(&self.maintenance_margin_rate) {
            return Err(format!(
                "maintenance_margin_rate {} must be within [0, initial_margin_rate]",
                self.maintenance_margin_rate
            ));
        }
        if self.price_max_age_ms == 0 {
            return Err("price_max_age_ms must be positive".to_string());
        }
        Ok(())
    }
}

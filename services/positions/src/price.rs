//! Mark price sources

use common::Px;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Answer from a price source. A zero price is a valid quote and is
/// distinct from `Missing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceQuote {
    /// Within the freshness window
    Fresh(Px),
    /// Known but older than the freshness window
    Stale {
        /// Last known price
        price: Px,
        /// Time since it was observed
        age: Duration,
    },
    /// Never observed
    Missing,
}

/// Source of mark prices for valuation
pub trait PriceFeed: Send + Sync {
    /// Current mark for an instrument on a venue
    fn quote(&self, symbol: &str, exchange: &str) -> PriceQuote;
}

/// Latest-price cache fed from market data
#[derive(Debug)]
pub struct PriceCache {
    prices: DashMap<(String, String), (Px, Instant)>,
    max_age: Duration,
}

impl PriceCache {
    /// Cache whose quotes go stale after `max_age`
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            prices: DashMap::new(),
            max_age,
        }
    }

    /// Record an observed price
    pub fn update(&self, symbol: &str, exchange: &str, price: Px) {
        self.prices
            .insert((symbol.to_string(), exchange.to_string()), (price, Instant::now()));
    }

    /// Number of instruments with a price
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// True if nothing has been observed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PriceFeed for PriceCache {
    fn quote(&self, symbol: &str, exchange: &str) -> PriceQuote {
        match self.prices.get(&(symbol.to_string(), exchange.to_string())) {
            Some(entry) => {
                let (price, seen) = *entry.value();
                let age = seen.elapsed();
                if age <= self.max_age {
                    PriceQuote::Fresh(price)
                } else {
                    PriceQuote::Stale { price, age }
                }
            }
            None => PriceQuote::Missing,
        }
    }
}

/// Feed that never has a price
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrices;

impl PriceFeed for NoPrices {
    fn quote(&self, _symbol: &str, _exchange: &str) -> PriceQuote {
        PriceQuote::Missing
    }
}

//! Shared primitives for the execution core
//!
//! - [`types`]: fixed-point [`Px`], [`Qty`], [`Amount`] and [`Side`]
//! - [`sync`]: [`KeyedLocks`] for per-aggregate serialization

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod sync;
pub mod types;

pub use sync::KeyedLocks;
pub use types::{Amount, DECIMALS, ParseDecimalError, Px, Qty, SCALE, Side};

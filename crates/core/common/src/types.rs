//! Core numeric types for the execution core
//!
//! Prices, quantities and money are fixed-point `i64` values with 8 decimal
//! places. Products are computed in `i128` and divided back with
//! half-away-from-zero rounding, so every replay of the same inputs produces
//! the same bits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;
use thiserror::Error;

/// Number of fixed-point units in 1.0
pub const SCALE: i64 = 100_000_000;

/// Decimal places carried by [`Px`], [`Qty`] and [`Amount`]
pub const DECIMALS: u32 = 8;

/// Divide rounding half away from zero
#[must_use]
pub const fn div_round(numerator: i128, denominator: i128) -> i128 {
    if denominator == 0 {
        return 0;
    }
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) == (denominator < 0) {
            quotient + 1
        } else {
            quotient - 1
        }
    } else {
        quotient
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn saturate(value: i128) -> i64 {
    if value > i64::MAX as i128 {
        i64::MAX
    } else if value < i64::MIN as i128 {
        i64::MIN
    } else {
        value as i64
    }
}

/// Error parsing a decimal string into a fixed-point value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDecimalError {
    /// Input was empty
    #[error("empty decimal string")]
    Empty,
    /// Input contained something other than digits, sign and a single dot
    #[error("invalid decimal '{0}'")]
    Invalid(String),
    /// More fractional digits than the fixed-point scale can hold
    #[error("decimal '{0}' has more than 8 fractional digits")]
    TooPrecise(String),
    /// Value does not fit in i64 units
    #[error("decimal '{0}' is out of range")]
    Overflow(String),
}

fn parse_units(input: &str) -> Result<i64, ParseDecimalError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ParseDecimalError::Empty);
    }
    let (negative, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(ParseDecimalError::Invalid(input.to_string()));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseDecimalError::Invalid(input.to_string()));
    }
    if frac_part.len() > DECIMALS as usize {
        return Err(ParseDecimalError::TooPrecise(input.to_string()));
    }

    let overflow = || ParseDecimalError::Overflow(input.to_string());
    let whole: i128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| overflow())?
    };
    let mut frac: i128 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().map_err(|_| overflow())?
    };
    for _ in frac_part.len()..DECIMALS as usize {
        frac *= 10;
    }

    let mut units = whole
        .checked_mul(i128::from(SCALE))
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(overflow)?;
    if negative {
        units = -units;
    }
    i64::try_from(units).map_err(|_| overflow())
}

fn fmt_units(units: i64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let sign = if units < 0 { "-" } else { "" };
    let abs = units.unsigned_abs();
    let scale = SCALE.unsigned_abs();
    write!(f, "{sign}{}.{:08}", abs / scale, abs % scale)
}

macro_rules! fixed_point {
    ($name:ident, $what:literal) => {
        impl $name {
            #[doc = concat!("Zero ", $what)]
            pub const ZERO: Self = Self(0);

            #[doc = concat!("Create a ", $what, " from f64 (rounded to 8 decimals)")]
            #[must_use]
            #[allow(clippy::cast_possible_truncation)]
            pub fn new(value: f64) -> Self {
                Self((value * SCALE as f64).round() as i64)
            }

            #[doc = concat!("Get the ", $what, " as f64")]
            #[must_use]
            #[allow(clippy::cast_precision_loss)]
            pub fn as_f64(&self) -> f64 {
                self.0 as f64 / SCALE as f64
            }

            /// Raw fixed-point units
            #[must_use]
            pub const fn as_i64(&self) -> i64 {
                self.0
            }

            /// Create from raw fixed-point units
            #[must_use]
            pub const fn from_i64(units: i64) -> Self {
                Self(units)
            }

            /// Create from a whole number
            #[must_use]
            pub const fn from_int(value: i64) -> Self {
                Self(value.saturating_mul(SCALE))
            }

            /// Check if the value is zero
            #[must_use]
            pub const fn is_zero(&self) -> bool {
                self.0 == 0
            }

            /// Check if the value is strictly positive
            #[must_use]
            pub const fn is_positive(&self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt_units(self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ParseDecimalError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_units(s).map(Self)
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0.saturating_add(rhs.0))
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0.saturating_sub(rhs.0))
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                *self = *self + rhs;
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, rhs: Self) {
                *self = *self - rhs;
            }
        }
    };
}

/// Price (8 decimal places)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64);

fixed_point!(Px, "price");

impl Px {
    /// Volume-weighted average of two (price, quantity) legs
    #[must_use]
    pub fn vwap(a: Self, a_qty: Qty, b: Self, b_qty: Qty) -> Self {
        let total = i128::from(a_qty.0) + i128::from(b_qty.0);
        if total == 0 {
            return Self::ZERO;
        }
        let value = i128::from(a.0) * i128::from(a_qty.0) + i128::from(b.0) * i128::from(b_qty.0);
        Self(saturate(div_round(value, total)))
    }
}

/// Quantity (8 decimal places)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qty(i64);

fixed_point!(Qty, "quantity");

impl Qty {
    /// Notional value of this quantity at a price
    #[must_use]
    pub fn notional(self, price: Px) -> Amount {
        Amount(saturate(div_round(
            i128::from(price.0) * i128::from(self.0),
            i128::from(SCALE),
        )))
    }
}

/// Signed money amount (PnL, commission, margin), 8 decimal places
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(i64);

fixed_point!(Amount, "amount");

impl Amount {
    /// PnL of `qty` units moving from `entry` to `exit` for a long holding
    #[must_use]
    pub fn price_move(entry: Px, exit: Px, qty: Qty) -> Self {
        let diff = i128::from(exit.0) - i128::from(entry.0);
        Self(saturate(div_round(diff * i128::from(qty.0), i128::from(SCALE))))
    }

    /// Scale by a rate expressed as a fraction (0.1 == 10%)
    #[must_use]
    pub fn scale_by(self, rate: f64) -> Self {
        Self::new(self.as_f64() * rate)
    }
}

impl Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

/// Order / fill / position side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Buy (long)
    #[default]
    Buy,
    /// Sell (short)
    Sell,
}

impl Side {
    /// The other side
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("50000", 50_000 * SCALE)]
    #[case("0.00000001", 1)]
    #[case("-1.5", -150_000_000)]
    #[case(".25", 25_000_000)]
    #[case("+7.", 7 * SCALE)]
    fn test_parse_decimal(#[case] input: &str, #[case] units: i64) {
        assert_eq!(input.parse::<Px>(), Ok(Px::from_i64(units)));
    }

    #[rstest]
    #[case("")]
    #[case("1.2.3")]
    #[case("abc")]
    #[case("0.000000001")]
    #[case("99999999999999999999")]
    fn test_parse_rejects(#[case] input: &str) {
        assert!(input.parse::<Qty>().is_err());
    }

    #[test]
    fn test_display_is_exact() {
        assert_eq!(Px::from_int(105).to_string(), "105.00000000");
        assert_eq!(Amount::from_i64(-1).to_string(), "-0.00000001");
    }

    #[test]
    fn test_div_round_half_away_from_zero() {
        assert_eq!(div_round(5, 2), 3);
        assert_eq!(div_round(-5, 2), -3);
        assert_eq!(div_round(4, 3), 1);
        assert_eq!(div_round(7, 0), 0);
    }

    #[test]
    fn test_vwap() {
        let px = Px::vwap(Px::from_int(100), Qty::from_int(5), Px::from_int(110), Qty::from_int(5));
        assert_eq!(px, Px::from_int(105));
    }

    #[test]
    fn test_price_move_sign() {
        let pnl = Amount::price_move(Px::from_int(100), Px::from_int(110), Qty::from_int(10));
        assert_eq!(pnl, Amount::from_int(100));
        assert_eq!(-pnl, Amount::from_int(-100));
    }

    #[test]
    fn test_serde_is_raw_units() -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&Qty::from_int(2))?;
        assert_eq!(json, "200000000");
        let side: Side = serde_json::from_str("\"sell\"")?;
        assert_eq!(side, Side::Sell);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(units in -1_000_000_000_000_000i64..1_000_000_000_000_000i64) {
            let px = Px::from_i64(units);
            prop_assert_eq!(px.to_string().parse::<Px>(), Ok(px));
        }

        #[test]
        fn prop_vwap_within_bounds(a in 1i64..1_000_000, b in 1i64..1_000_000, qa in 1i64..10_000, qb in 1i64..10_000) {
            let px = Px::vwap(Px::from_int(a), Qty::from_int(qa), Px::from_int(b), Qty::from_int(qb));
            prop_assert!(px >= Px::from_int(a.min(b)) && px <= Px::from_int(a.max(b)));
        }
    }
}

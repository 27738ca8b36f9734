//! Fixed-point money and percentage primitives.
//!
//! All amounts are integral minor units. Percentages are basis points, so
//! `4.99 %` is stored as `499`. Applying a rate goes through [`apply_rate`],
//! which divides with the single crate-wide [`ROUNDING_MODE`]. Original fee
//! computation and audit recomputation must share this constant, otherwise
//! the auditor would report divergences that are only rounding noise.

use crate::error::PayoutError;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Basis points in one hundred percent.
pub const BPS_SCALE: u32 = 10_000;

/// Rounding used whenever a rate is applied to an amount.
pub const ROUNDING_MODE: RoundingMode = RoundingMode::HalfUp;

/// Integral division rounding strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Ties round away from zero.
    HalfUp,
    /// Ties round to the even neighbour.
    HalfEven,
    /// Always toward negative infinity.
    Floor,
}

/// Amount in minor currency units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }

    /// Clamp at zero. Used only where a floor is part of the business rule.
    pub fn floor_zero(self) -> Money {
        Money(self.0.max(0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

/// A percentage in `[0, 100]`, held as basis points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(u32);

impl Rate {
    pub const ZERO: Rate = Rate(0);

    /// Build a rate from basis points, rejecting anything above 100 %.
    pub fn from_bps(bps: u32) -> Result<Self, PayoutError> {
        if bps > BPS_SCALE {
            return Err(PayoutError::Configuration(format!(
                "percentage {} is outside [0, 100]",
                format_bps(bps)
            )));
        }
        Ok(Self(bps))
    }

    /// Compile-time constructor for constants known to be in range.
    pub(crate) const fn const_bps(bps: u32) -> Self {
        Self(bps)
    }

    pub const fn bps(self) -> u32 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `round(amount * rate)` under [`ROUNDING_MODE`].
    pub fn apply(self, amount: Money) -> Money {
        apply_rate(amount, self, ROUNDING_MODE)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_bps(self.0))
    }
}

impl FromStr for Rate {
    type Err = PayoutError;

    /// Parse decimal percent text such as `"4.99"`, `"10"` or `"0.5"`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_end_matches('%').trim();
        let invalid = || PayoutError::Configuration(format!("invalid percentage '{value}'"));

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        // Trailing zeros beyond basis-point precision are harmless ("4.990").
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > 2 {
            return Err(PayoutError::Configuration(format!(
                "percentage '{value}' has more precision than a basis point"
            )));
        }

        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let fraction_bps: u32 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u32>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };

        let bps = whole
            .checked_mul(100)
            .and_then(|bps| bps.checked_add(fraction_bps))
            .ok_or_else(invalid)?;
        Rate::from_bps(bps)
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_bps(self.0))
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RateVisitor;

        impl<'de> Visitor<'de> for RateVisitor {
            type Value = Rate;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a percentage between 0 and 100, as a number or decimal string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Rate, E> {
                value.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Rate, E> {
                self.visit_str(&value.to_string())
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Rate, E> {
                self.visit_str(&value.to_string())
            }

            // Shortest round-trip formatting keeps literals such as 4.99 exact.
            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Rate, E> {
                if !value.is_finite() || value < 0.0 {
                    return Err(E::custom(format!("invalid percentage {value}")));
                }
                self.visit_str(&value.to_string())
            }
        }

        deserializer.deserialize_any(RateVisitor)
    }
}

fn format_bps(bps: u32) -> String {
    let whole = bps / 100;
    let fraction = bps % 100;
    if fraction == 0 {
        whole.to_string()
    } else if fraction % 10 == 0 {
        format!("{whole}.{}", fraction / 10)
    } else {
        format!("{whole}.{fraction:02}")
    }
}

/// `amount * rate / 10000` with explicit rounding. Computed in `i128` so the
/// intermediate product cannot overflow.
pub fn apply_rate(amount: Money, rate: Rate, mode: RoundingMode) -> Money {
    let numerator = amount.minor() as i128 * rate.bps() as i128;
    let rounded = divide_rounded(numerator, BPS_SCALE as i128, mode);
    Money(rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
}

fn divide_rounded(numerator: i128, denominator: i128, mode: RoundingMode) -> i128 {
    let quotient = numerator.div_euclid(denominator);
    let remainder = numerator.rem_euclid(denominator);
    if remainder == 0 {
        return quotient;
    }

    match mode {
        RoundingMode::Floor => quotient,
        RoundingMode::HalfUp => {
            let twice = remainder * 2;
            if twice > denominator || (twice == denominator && numerator > 0) {
                quotient + 1
            } else {
                quotient
            }
        }
        RoundingMode::HalfEven => {
            let twice = remainder * 2;
            if twice > denominator || (twice == denominator && quotient % 2 != 0) {
                quotient + 1
            } else {
                quotient
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(text: &str) -> Rate {
        text.parse().unwrap()
    }

    #[test]
    fn parses_decimal_percentages_as_basis_points() {
        assert_eq!(rate("4.99").bps(), 499);
        assert_eq!(rate("10").bps(), 1000);
        assert_eq!(rate("0.5").bps(), 50);
        assert_eq!(rate("4.990").bps(), 499);
        assert_eq!(rate("100").bps(), 10_000);
        assert_eq!(rate("5.00%").bps(), 500);
    }

    #[test]
    fn rejects_out_of_range_and_overprecise_percentages() {
        assert!("100.01".parse::<Rate>().is_err());
        assert!("-1".parse::<Rate>().is_err());
        assert!("4.999".parse::<Rate>().is_err());
        assert!("abc".parse::<Rate>().is_err());
        assert!(".5".parse::<Rate>().is_err());
        assert!(Rate::from_bps(10_001).is_err());
    }

    #[test]
    fn deserializes_from_numbers_and_strings() {
        let from_number: Rate = serde_json::from_str("4.99").unwrap();
        let from_string: Rate = serde_json::from_str("\"4.99\"").unwrap();
        let from_integer: Rate = serde_json::from_str("10").unwrap();
        assert_eq!(from_number.bps(), 499);
        assert_eq!(from_string.bps(), 499);
        assert_eq!(from_integer.bps(), 1000);
        assert!(serde_json::from_str::<Rate>("101").is_err());
        assert_eq!(serde_json::to_string(&from_number).unwrap(), "\"4.99\"");
    }

    #[test]
    fn half_up_rounds_ties_away_from_zero() {
        // 50 * 1% = 0.5 -> 1
        assert_eq!(
            apply_rate(Money::from_minor(50), rate("1"), RoundingMode::HalfUp).minor(),
            1
        );
        // 149 * 1% = 1.49 -> 1
        assert_eq!(
            apply_rate(Money::from_minor(149), rate("1"), RoundingMode::HalfUp).minor(),
            1
        );
    }

    #[test]
    fn half_even_and_floor_differ_on_ties() {
        let amount = Money::from_minor(250); // 2.5 at 1%
        assert_eq!(apply_rate(amount, rate("1"), RoundingMode::HalfUp).minor(), 3);
        assert_eq!(apply_rate(amount, rate("1"), RoundingMode::HalfEven).minor(), 2);
        assert_eq!(apply_rate(amount, rate("1"), RoundingMode::Floor).minor(), 2);
    }

    #[test]
    fn exact_products_are_unaffected_by_mode() {
        let amount = Money::from_minor(10_000);
        for mode in [RoundingMode::HalfUp, RoundingMode::HalfEven, RoundingMode::Floor] {
            assert_eq!(apply_rate(amount, rate("4.99"), mode).minor(), 499);
        }
    }

    #[test]
    fn money_sums_and_floors() {
        let total: Money = [100, 250, -50].into_iter().map(Money::from_minor).sum();
        assert_eq!(total.minor(), 300);
        assert_eq!(Money::from_minor(-5).floor_zero(), Money::ZERO);
        assert_eq!(
            Money::from_minor(10).saturating_sub(Money::from_minor(25)).minor(),
            -15
        );
    }
}

//! Integer cent amounts with deterministic rounding.
//!
//! All balances and postings are carried as whole cents in an `i64`. Dollar
//! amounts coming from upstream callers (policy inputs, contribution feeds)
//! are converted through their decimal representation and rounded half away
//! from zero, so `1.005` always becomes `101` cents regardless of how the
//! binary float happens to round.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when converting external amounts into cents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MoneyError {
    /// The amount was NaN or infinite.
    #[error("amount is not a finite number")]
    NotFinite,

    /// The amount string could not be parsed as a decimal number.
    #[error("invalid decimal amount: '{input}'")]
    Malformed {
        /// The rejected input.
        input: String,
    },

    /// The amount does not fit in a signed 64-bit cent value.
    #[error("amount out of range: '{input}'")]
    OutOfRange {
        /// The rejected input.
        input: String,
    },
}

/// A signed amount of Australian cents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(i64);

impl Cents {
    /// Zero cents.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw cent count.
    #[must_use]
    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns the raw cent count.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Converts a dollar amount into cents.
    ///
    /// The conversion goes through the shortest decimal representation of
    /// the float, so the result matches what a human reading the number
    /// would expect.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::NotFinite`] for NaN or infinities and
    /// [`MoneyError::OutOfRange`] when the value exceeds `i64` cents.
    pub fn from_dollars(amount: f64) -> Result<Self, MoneyError> {
        if !amount.is_finite() {
            return Err(MoneyError::NotFinite);
        }
        Self::parse_dollars(&amount.to_string())
    }

    /// Parses a decimal dollar string such as `"-12.345"`.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Malformed`] when the string is not a plain
    /// decimal number and [`MoneyError::OutOfRange`] when it overflows.
    pub fn parse_dollars(input: &str) -> Result<Self, MoneyError> {
        let malformed = || MoneyError::Malformed {
            input: input.to_string(),
        };
        let out_of_range = || MoneyError::OutOfRange {
            input: input.to_string(),
        };

        let trimmed = input.trim();
        let (negative, digits) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            Some(_) => (false, trimmed),
            None => return Err(malformed()),
        };

        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(malformed());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        let mut cents: i64 = 0;
        for b in whole.bytes() {
            cents = cents
                .checked_mul(10)
                .and_then(|c| c.checked_add(i64::from(b - b'0')))
                .ok_or_else(out_of_range)?;
        }
        cents = cents.checked_mul(100).ok_or_else(out_of_range)?;

        let mut frac_digits = frac.bytes().map(|b| i64::from(b - b'0'));
        let tenths = frac_digits.next().unwrap_or(0);
        let hundredths = frac_digits.next().unwrap_or(0);
        let round_up = frac_digits.next().is_some_and(|d| d >= 5);

        cents = cents
            .checked_add(tenths * 10 + hundredths + i64::from(round_up))
            .ok_or_else(out_of_range)?;

        Ok(Self(if negative { -cents } else { cents }))
    }

    /// Returns the amount in dollars as a float, for display and policy
    /// evaluation only.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Checked addition.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked subtraction.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns `true` if the amount is strictly positive.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl From<i64> for Cents {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for Cents {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_dollars(s)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_whole_and_fractional_dollars() {
        assert_eq!(Cents::parse_dollars("12").unwrap(), Cents::new(1200));
        assert_eq!(Cents::parse_dollars("12.3").unwrap(), Cents::new(1230));
        assert_eq!(Cents::parse_dollars("12.34").unwrap(), Cents::new(1234));
        assert_eq!(Cents::parse_dollars(".5").unwrap(), Cents::new(50));
        assert_eq!(Cents::parse_dollars("-0.01").unwrap(), Cents::new(-1));
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        assert_eq!(Cents::parse_dollars("0.005").unwrap(), Cents::new(1));
        assert_eq!(Cents::parse_dollars("0.0049").unwrap(), Cents::new(0));
        assert_eq!(Cents::parse_dollars("-0.005").unwrap(), Cents::new(-1));
        assert_eq!(Cents::parse_dollars("2.675").unwrap(), Cents::new(268));
    }

    #[test]
    fn test_float_conversion_uses_decimal_representation() {
        // 1.005 * 100.0 == 100.49999999999999 in binary floating point.
        assert_eq!(Cents::from_dollars(1.005).unwrap(), Cents::new(101));
        assert_eq!(Cents::from_dollars(123.45).unwrap(), Cents::new(12345));
        assert_eq!(Cents::from_dollars(-7.0).unwrap(), Cents::new(-700));
    }

    #[test]
    fn test_rejects_non_finite_and_malformed() {
        assert_eq!(Cents::from_dollars(f64::NAN), Err(MoneyError::NotFinite));
        assert_eq!(
            Cents::from_dollars(f64::INFINITY),
            Err(MoneyError::NotFinite)
        );
        assert!(matches!(
            Cents::parse_dollars("1e5"),
            Err(MoneyError::Malformed { .. })
        ));
        assert!(matches!(
            Cents::parse_dollars(""),
            Err(MoneyError::Malformed { .. })
        ));
        assert!(matches!(
            Cents::parse_dollars("-"),
            Err(MoneyError::Malformed { .. })
        ));
        assert!(matches!(
            Cents::parse_dollars("99999999999999999999"),
            Err(MoneyError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_displays_with_two_decimals() {
        assert_eq!(Cents::new(1234).to_string(), "12.34");
        assert_eq!(Cents::new(-5).to_string(), "-0.05");
        assert_eq!(Cents::ZERO.to_string(), "0.00");
    }
}

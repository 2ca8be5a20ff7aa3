#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

mod canonical;

pub use canonical::canonical_json;
pub use canonical::payload_hash;
pub use canonical::scope_hash;
pub use canonical::sha256_hex;

pub type MoneyResult<T> = Result<T, MoneyError>;

/// Largest magnitude representable in minor units. Leaves headroom for
/// treasury-wide aggregates while staying far away from i64 overflow.
pub const MAX_MINOR: i64 = 100_000_000_000_000 - 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount {0} exceeds the representable range")]
    OutOfRange(i64),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("invalid amount literal: {0}")]
    Parse(String),
    #[error("unsupported currency: {0}")]
    UnknownCurrency(String),
}

/// Fixed-point monetary amount with exactly two decimal places, stored as
/// signed minor units (cents). All arithmetic is exact and checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount {
    minor: i64,
}

impl Amount {
    pub const ZERO: Amount = Amount { minor: 0 };

    pub fn from_minor(minor: i64) -> MoneyResult<Self> {
        if minor.abs() > MAX_MINOR {
            return Err(MoneyError::OutOfRange(minor));
        }
        Ok(Self { minor })
    }

    #[must_use]
    pub fn minor(self) -> i64 {
        self.minor
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.minor == 0
    }

    #[must_use]
    pub fn is_positive(self) -> bool {
        self.minor > 0
    }

    #[must_use]
    pub fn is_negative(self) -> bool {
        self.minor < 0
    }

    #[must_use]
    pub fn abs(self) -> Self {
        Self {
            minor: self.minor.abs(),
        }
    }

    pub fn checked_add(self, other: Amount) -> MoneyResult<Self> {
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Self::from_minor(minor)
    }

    pub fn checked_sub(self, other: Amount) -> MoneyResult<Self> {
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Self::from_minor(minor)
    }

    /// Multiplies by `numerator / denominator` with HALF_UP rounding on the
    /// final minor unit. Used for fee shares and commission splits.
    pub fn mul_div_half_up(self, numerator: i64, denominator: i64) -> MoneyResult<Self> {
        if denominator <= 0 {
            return Err(MoneyError::Parse(format!(
                "denominator must be positive, got {denominator}"
            )));
        }
        let scaled = i128::from(self.minor)
            .checked_mul(i128::from(numerator))
            .ok_or(MoneyError::Overflow)?;
        let denom = i128::from(denominator);
        let half = denom / 2;
        let rounded = if scaled >= 0 {
            (scaled + half) / denom
        } else {
            (scaled - half) / denom
        };
        let minor = i64::try_from(rounded).map_err(|_| MoneyError::Overflow)?;
        Self::from_minor(minor)
    }

    /// Splits the amount into `(share, remainder)` where the share is
    /// `numerator / denominator` of the total, HALF_UP. The two parts always
    /// sum back to the original amount exactly.
    pub fn split_half_up(self, numerator: i64, denominator: i64) -> MoneyResult<(Self, Self)> {
        let share = self.mul_div_half_up(numerator, denominator)?;
        let remainder = self.checked_sub(share)?;
        Ok((share, remainder))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.minor < 0 { "-" } else { "" };
        let magnitude = self.minor.unsigned_abs();
        write!(f, "{sign}{}.{:02}", magnitude / 100, magnitude % 100)
    }
}

impl FromStr for Amount {
    type Err = MoneyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if digits.is_empty() {
            return Err(MoneyError::Parse(input.into()));
        }
        let (units_part, cents_part) = match digits.split_once('.') {
            Some((units, cents)) => (units, cents),
            None => (digits, ""),
        };
        if units_part.is_empty()
            || cents_part.len() > 2
            || !units_part.chars().all(|ch| ch.is_ascii_digit())
            || !cents_part.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(MoneyError::Parse(input.into()));
        }
        let units = units_part
            .parse::<i64>()
            .map_err(|_| MoneyError::Parse(input.into()))?;
        let cents = match cents_part.len() {
            0 => 0,
            1 => {
                cents_part
                    .parse::<i64>()
                    .map_err(|_| MoneyError::Parse(input.into()))?
                    * 10
            }
            _ => cents_part
                .parse::<i64>()
                .map_err(|_| MoneyError::Parse(input.into()))?,
        };
        let minor = units
            .checked_mul(100)
            .and_then(|scaled| scaled.checked_add(cents))
            .ok_or(MoneyError::Overflow)?;
        Self::from_minor(if negative { -minor } else { minor })
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Currencies the platform settles in. The set is closed on purpose; any
/// other ISO code is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Currency {
    Bbd,
    Usd,
}

impl Currency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Bbd => "BBD",
            Currency::Usd => "USD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "BBD" => Ok(Currency::Bbd),
            "USD" => Ok(Currency::Usd),
            other => Err(MoneyError::UnknownCurrency(other.into())),
        }
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

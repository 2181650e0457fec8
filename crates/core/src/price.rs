//! Fixed-point order price.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A strictly positive price held as integer cents.
///
/// Aggregation sums these integers exactly; floating point only appears when a
/// price or an average is rendered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Price(u64);

impl Price {
    /// Number of cents per major currency unit.
    pub const SCALE: u64 = 100;

    pub fn from_cents(cents: u64) -> DomainResult<Self> {
        if cents == 0 {
            return Err(DomainError::invalid_price("price must be positive"));
        }
        Ok(Self(cents))
    }

    /// Convert a major-unit amount (e.g. `12.345`) to cents, rounding half away from zero.
    pub fn from_major(amount: f64) -> DomainResult<Self> {
        if !amount.is_finite() {
            return Err(DomainError::invalid_price(format!("{amount} is not finite")));
        }
        let cents = (amount * Self::SCALE as f64).round();
        if cents < 1.0 {
            return Err(DomainError::invalid_price(format!(
                "{amount} rounds to less than one cent"
            )));
        }
        if cents >= u64::MAX as f64 {
            return Err(DomainError::invalid_price(format!("{amount} is out of range")));
        }
        Ok(Self(cents as u64))
    }

    pub fn cents(&self) -> u64 {
        self.0
    }

    pub fn as_major(&self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl TryFrom<u64> for Price {
    type Error = DomainError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_cents(value)
    }
}

impl From<Price> for u64 {
    fn from(value: Price) -> Self {
        value.0
    }
}

impl core::fmt::Display for Price {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

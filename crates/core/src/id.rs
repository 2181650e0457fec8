//! Strongly-typed order identity.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identity of an order (the message key on every stream).
///
/// Unique per logical order. Retries, dead-lettering and partitioning are all keyed
/// on this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

impl OrderId {
    /// Create a fresh identifier of the form `ORDER-<uuid>`.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(format!("ORDER-{}", Uuid::now_v7()))
    }

    /// Wrap an existing key, rejecting empty or whitespace-only values.
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id("OrderId: must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<OrderId> for String {
    fn from(value: OrderId) -> Self {
        value.0
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let a = OrderId::new();
        let b = OrderId::new();
        assert!(a.as_str().starts_with("ORDER-"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(matches!(OrderId::parse("  "), Err(DomainError::InvalidId(_))));
        assert!("".parse::<OrderId>().is_err());
    }

    #[test]
    fn serde_rejects_empty_ids() {
        let ok: OrderId = serde_json::from_str("\"ORDER-1\"").unwrap();
        assert_eq!(ok.as_str(), "ORDER-1");
        assert!(serde_json::from_str::<OrderId>("\"\"").is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::OrderId;
use crate::price::Price;

/// A unit of work: one order placed for a product at a price.
///
/// Orders are immutable once built. They are moved through the pipeline, never
/// shared for mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OrderRecord", into = "OrderRecord")]
pub struct Order {
    order_id: OrderId,
    product: String,
    price: Price,
    timestamp: DateTime<Utc>,
}

impl Order {
    pub fn new(
        order_id: OrderId,
        product: impl Into<String>,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let product = product.into();
        if product.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "order {order_id}: product must not be empty"
            )));
        }
        Ok(Self {
            order_id,
            product,
            price,
            timestamp,
        })
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Category label of the order.
    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn price(&self) -> Price {
        self.price
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Wire form of an order; every field is re-validated on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderRecord {
    order_id: OrderId,
    product: String,
    price_cents: Price,
    timestamp: DateTime<Utc>,
}

impl TryFrom<OrderRecord> for Order {
    type Error = DomainError;

    fn try_from(r: OrderRecord) -> Result<Self, Self::Error> {
        Order::new(r.order_id, r.product, r.price_cents, r.timestamp)
    }
}

impl From<Order> for OrderRecord {
    fn from(o: Order) -> Self {
        Self {
            order_id: o.order_id,
            product: o.product,
            price_cents: o.price,
            timestamp: o.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_order() -> Order {
        Order::new(
            OrderId::parse("ORDER-1").unwrap(),
            "Item3",
            Price::from_cents(12_999).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn empty_product_is_rejected() {
        let err = Order::new(
            OrderId::new(),
            " ",
            Price::from_cents(100).unwrap(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn wire_format_uses_price_cents() {
        let json = serde_json::to_value(test_order()).unwrap();
        assert_eq!(json["order_id"], "ORDER-1");
        assert_eq!(json["product"], "Item3");
        assert_eq!(json["price_cents"], 12_999);

        let back: Order = serde_json::from_value(json).unwrap();
        assert_eq!(back, test_order());
    }

    #[test]
    fn invalid_wire_records_are_rejected() {
        let zero_price = serde_json::json!({
            "order_id": "ORDER-2",
            "product": "Item1",
            "price_cents": 0,
            "timestamp": "2024-03-01T12:00:00Z"
        });
        assert!(serde_json::from_value::<Order>(zero_price).is_err());

        let no_product = serde_json::json!({
            "order_id": "ORDER-2",
            "product": "",
            "price_cents": 10,
            "timestamp": "2024-03-01T12:00:00Z"
        });
        assert!(serde_json::from_value::<Order>(no_product).is_err());
    }
}

//! Order types and identifiers.

use meshbook_markets::{Pair, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use uuid::Uuid;

/// Unique order identifier, assigned by the originating node.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Resting with no fills yet
    Pending,
    /// Resting with at least one fill
    Partial,
    /// Fully consumed by matching
    Filled,
    /// Removed by the owner before being filled
    Cancelled,
}

impl OrderStatus {
    /// Whether the order can still trade or be cancelled.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Partial)
    }
}

/// A limit order.
///
/// `amount` is the remaining unfilled amount; matching decrements it in
/// place and an order with zero remaining amount never rests in the book.
/// An order is exclusively owned by the book of the originating user's
/// node; replicas elsewhere mutate only by replaying the owner's events or
/// by matching against the order locally.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user: SmolStr,
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
    pub pair: Pair,
    pub status: OrderStatus,
    /// Monotonic nanoseconds on the originating node.
    pub created_at_ns: u64,
}

impl Order {
    /// Materialise a local [`OrderRequest`] into an order with a fresh id
    /// and creation timestamp.
    pub fn open(request: OrderRequest, created_at_ns: u64) -> Self {
        Self {
            id: OrderId::random(),
            user: request.user,
            side: request.side,
            amount: request.amount,
            price: request.price,
            pair: request.pair,
            status: OrderStatus::Pending,
            created_at_ns,
        }
    }
}

/// Validated input for placing a new order on the local book.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, derive_more::Constructor)]
pub struct OrderRequest {
    pub user: SmolStr,
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
    pub pair: Pair,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: Side) -> OrderRequest {
        OrderRequest::new(
            SmolStr::new("alice"),
            side,
            dec!(1.5),
            dec!(50000),
            "BTC/USD".parse().unwrap(),
        )
    }

    #[test]
    fn test_open_assigns_identity_and_pending_status() {
        let a = Order::open(request(Side::Buy), 1);
        let b = Order::open(request(Side::Buy), 2);
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, OrderStatus::Pending);
        assert_eq!(a.created_at_ns, 1);
    }

    #[test]
    fn test_status_openness() {
        assert!(OrderStatus::Pending.is_open());
        assert!(OrderStatus::Partial.is_open());
        assert!(!OrderStatus::Filled.is_open());
        assert!(!OrderStatus::Cancelled.is_open());
    }
}

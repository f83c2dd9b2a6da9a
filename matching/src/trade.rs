//! Executed trade types and identifiers.

use crate::order::OrderId;
use chrono::{DateTime, Utc};
use meshbook_markets::Pair;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for deriving [`TradeId`]s from the matched order pair.
const TRADE_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6d, 0x65, 0x73, 0x68, 0x62, 0x6f, 0x6f, 0x6b, 0x2d, 0x74, 0x72, 0x61, 0x64, 0x65, 0x00,
    0x01,
]);

/// Unique trade identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub Uuid);

impl TradeId {
    /// Derive the identifier from the matched `(buy, sell)` order pair.
    ///
    /// A given pair of orders can match at most once (the taker only rests
    /// after every crossing maker is consumed), so the derivation is
    /// collision-free — and every node replaying the same events derives
    /// the same id, letting trade replicas deduplicate naturally.
    pub fn derive(buy: OrderId, sell: OrderId) -> Self {
        let mut name = [0u8; 32];
        name[..16].copy_from_slice(buy.0.as_bytes());
        name[16..].copy_from_slice(sell.0.as_bytes());
        Self(Uuid::new_v5(&TRADE_ID_NAMESPACE, &name))
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An executed trade. Immutable once produced.
///
/// `price` is always the resting (maker) order's price.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub buy_order: OrderId,
    pub sell_order: OrderId,
    pub amount: Decimal,
    pub price: Decimal,
    pub pair: Pair,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        buy_order: OrderId,
        sell_order: OrderId,
        amount: Decimal,
        price: Decimal,
        pair: Pair,
    ) -> Self {
        Self {
            id: TradeId::derive(buy_order, sell_order),
            buy_order,
            sell_order,
            amount,
            price,
            pair,
            executed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_id_is_deterministic() {
        let buy = OrderId::random();
        let sell = OrderId::random();
        assert_eq!(TradeId::derive(buy, sell), TradeId::derive(buy, sell));
        assert_ne!(TradeId::derive(buy, sell), TradeId::derive(sell, buy));
    }

    #[test]
    fn test_trade_carries_maker_price() {
        let pair: Pair = "BTC/USD".parse().unwrap();
        let trade = Trade::new(
            OrderId::random(),
            OrderId::random(),
            dec!(0.6),
            dec!(50000),
            pair,
        );
        assert_eq!(trade.id, TradeId::derive(trade.buy_order, trade.sell_order));
        assert_eq!(trade.price, dec!(50000));
    }
}

//! Price-time priority limit order book.
//!
//! One [`OrderBook`] per trading pair. Each side keeps a map of price →
//! FIFO queue of resting orders plus an id index for O(log n) cancels; a
//! bounded ring of recently executed trades rides along for queries.
//!
//! The book is a plain synchronous structure: matching never suspends, and
//! the surrounding engine guarantees at most one mutation at a time.

use crate::{
    order::{Order, OrderId, OrderStatus},
    trade::Trade,
};
use fnv::FnvHashMap;
use meshbook_markets::{Pair, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Default capacity of the recent-trade ring.
pub const DEFAULT_RECENT_TRADES: usize = 1_000;

/// Aggregated view of one price level.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    pub price: Decimal,
    pub amount: Decimal,
    pub orders: usize,
}

/// Depth snapshot of the book: bids best-first, asks best-first.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: Pair,
    pub bids: Vec<LevelSnapshot>,
    pub asks: Vec<LevelSnapshot>,
}

/// Outcome of applying one order to the book.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MatchOutcome {
    /// The incoming order's final state: `Filled`, `Partial` (resting with
    /// fills), or `Pending` (resting, no fills).
    pub order: Order,
    /// Trades produced, in execution order. Maker price wins.
    pub trades: Vec<Trade>,
    /// Post-fill state of every resting order touched by this match.
    pub makers: Vec<Order>,
}

/// Price-time priority limit order book for a single [`Pair`].
#[derive(Debug)]
pub struct OrderBook {
    pair: Pair,
    bids: BTreeMap<Decimal, VecDeque<Order>>,
    asks: BTreeMap<Decimal, VecDeque<Order>>,
    /// Resting orders only: id → (side, price level). Every entry appears
    /// in exactly one side's queue; removal is transactional.
    index: FnvHashMap<OrderId, (Side, Decimal)>,
    recent_trades: VecDeque<Trade>,
    max_recent_trades: usize,
}

impl OrderBook {
    pub fn new(pair: Pair) -> Self {
        Self::with_trade_capacity(pair, DEFAULT_RECENT_TRADES)
    }

    pub fn with_trade_capacity(pair: Pair, max_recent_trades: usize) -> Self {
        Self {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: FnvHashMap::default(),
            recent_trades: VecDeque::new(),
            max_recent_trades: max_recent_trades.max(1),
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    /// Number of resting orders across both sides.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Match `taker` against the opposite side, then rest any remnant.
    ///
    /// Traverses opposite price levels from best to worst, stopping when
    /// the taker's limit is violated or its amount is exhausted; within a
    /// level, makers fill strictly FIFO and every trade executes at the
    /// maker's price.
    pub fn process_order(&mut self, mut taker: Order) -> MatchOutcome {
        let mut trades = Vec::new();
        let mut makers = Vec::new();
        let mut remaining = taker.amount;

        while remaining > Decimal::ZERO {
            let Some(level_price) = self.best_crossing_level(taker.side, taker.price) else {
                break;
            };
            let opposite = match taker.side {
                Side::Buy => &mut self.asks,
                Side::Sell => &mut self.bids,
            };
            let Some(level) = opposite.get_mut(&level_price) else {
                break;
            };

            while remaining > Decimal::ZERO {
                let Some(maker) = level.front_mut() else {
                    break;
                };
                let fill = remaining.min(maker.amount);
                remaining -= fill;
                maker.amount -= fill;

                let (buy_order, sell_order) = match taker.side {
                    Side::Buy => (taker.id, maker.id),
                    Side::Sell => (maker.id, taker.id),
                };
                trades.push(Trade::new(
                    buy_order,
                    sell_order,
                    fill,
                    maker.price,
                    self.pair.clone(),
                ));

                if maker.amount == Decimal::ZERO {
                    maker.status = OrderStatus::Filled;
                    makers.push(maker.clone());
                    let filled = maker.id;
                    level.pop_front();
                    self.index.remove(&filled);
                } else {
                    maker.status = OrderStatus::Partial;
                    makers.push(maker.clone());
                }
            }

            if level.is_empty() {
                opposite.remove(&level_price);
            }
        }

        taker.amount = remaining;
        taker.status = if remaining == Decimal::ZERO {
            OrderStatus::Filled
        } else if trades.is_empty() {
            OrderStatus::Pending
        } else {
            OrderStatus::Partial
        };

        if remaining > Decimal::ZERO {
            self.rest(taker.clone());
        }

        for trade in &trades {
            self.record_trade(trade.clone());
        }

        debug!(
            order = %taker.id,
            side = %taker.side,
            trades = trades.len(),
            remaining = %remaining,
            "order processed"
        );

        MatchOutcome {
            order: taker,
            trades,
            makers,
        }
    }

    /// Remove a resting order. Succeeds only while the order is `Pending`
    /// or `Partial`; returns the cancelled order's final state.
    pub fn cancel_order(&mut self, id: OrderId) -> Option<Order> {
        let (side, price) = self.index.remove(&id)?;
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let level = levels.get_mut(&price)?;
        let position = level.iter().position(|order| order.id == id)?;
        let mut order = level.remove(position)?;
        if level.is_empty() {
            levels.remove(&price);
        }
        order.status = OrderStatus::Cancelled;
        debug!(order = %id, "order cancelled");
        Some(order)
    }

    /// Look up a resting order by id.
    pub fn get(&self, id: OrderId) -> Option<&Order> {
        let (side, price) = self.index.get(&id)?;
        let level = match side {
            Side::Buy => self.bids.get(price)?,
            Side::Sell => self.asks.get(price)?,
        };
        level.iter().find(|order| order.id == id)
    }

    /// Resting orders belonging to `user`, oldest first.
    pub fn user_orders(&self, user: &str) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .bids
            .values()
            .chain(self.asks.values())
            .flatten()
            .filter(|order| order.user == user)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.created_at_ns);
        orders
    }

    /// Aggregated depth, best-first on both sides, at most `depth` levels
    /// per side (`0` = unlimited).
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let take = if depth == 0 { usize::MAX } else { depth };
        let level = |(price, queue): (&Decimal, &VecDeque<Order>)| LevelSnapshot {
            price: *price,
            amount: queue.iter().map(|order| order.amount).sum(),
            orders: queue.len(),
        };
        BookSnapshot {
            pair: self.pair.clone(),
            bids: self.bids.iter().rev().take(take).map(level).collect(),
            asks: self.asks.iter().take(take).map(level).collect(),
        }
    }

    /// Most recent trades, newest first, at most `limit` (`0` = all
    /// retained).
    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        let take = if limit == 0 { usize::MAX } else { limit };
        self.recent_trades.iter().rev().take(take).cloned().collect()
    }

    /// `(best bid, best ask)` prices.
    pub fn best_prices(&self) -> (Option<Decimal>, Option<Decimal>) {
        (
            self.bids.keys().next_back().copied(),
            self.asks.keys().next().copied(),
        )
    }

    /// `best ask − best bid` when both sides are populated.
    pub fn spread(&self) -> Option<Decimal> {
        match self.best_prices() {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Append an externally executed trade to the recent ring.
    pub fn record_trade(&mut self, trade: Trade) {
        if self.recent_trades.len() == self.max_recent_trades {
            self.recent_trades.pop_front();
        }
        self.recent_trades.push_back(trade);
    }

    fn rest(&mut self, order: Order) {
        let levels = match order.side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        self.index.insert(order.id, (order.side, order.price));
        levels.entry(order.price).or_default().push_back(order);
    }

    /// Best opposite-side level that crosses `limit`, if any.
    fn best_crossing_level(&self, side: Side, limit: Decimal) -> Option<Decimal> {
        match side {
            Side::Buy => self
                .asks
                .keys()
                .next()
                .copied()
                .filter(|&ask| ask <= limit),
            Side::Sell => self
                .bids
                .keys()
                .next_back()
                .copied()
                .filter(|&bid| bid >= limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderRequest;
    use rust_decimal_macros::dec;
    use smol_str::SmolStr;

    fn pair() -> Pair {
        "BTC/USD".parse().unwrap()
    }

    fn order(user: &str, side: Side, amount: Decimal, price: Decimal, ts: u64) -> Order {
        Order::open(
            OrderRequest::new(SmolStr::new(user), side, amount, price, pair()),
            ts,
        )
    }

    #[test]
    fn test_simple_cross_partial_maker() {
        let mut book = OrderBook::new(pair());
        let sell = order("a", Side::Sell, dec!(1.0), dec!(50000), 1);
        let sell_id = sell.id;
        book.process_order(sell);

        let outcome = book.process_order(order("b", Side::Buy, dec!(0.6), dec!(50000), 2));
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].amount, dec!(0.6));
        assert_eq!(outcome.trades[0].price, dec!(50000));
        assert_eq!(outcome.order.status, OrderStatus::Filled);

        let remaining = book.get(sell_id).unwrap();
        assert_eq!(remaining.amount, dec!(0.4));
        assert_eq!(remaining.status, OrderStatus::Partial);

        let snapshot = book.snapshot(0);
        assert!(snapshot.bids.is_empty());
        assert_eq!(snapshot.asks.len(), 1);
        assert_eq!(snapshot.asks[0].amount, dec!(0.4));
        assert_eq!(snapshot.asks[0].orders, 1);
    }

    #[test]
    fn test_price_time_priority_within_level() {
        let mut book = OrderBook::new(pair());
        let first = order("a", Side::Sell, dec!(1.0), dec!(50000), 1);
        let second = order("b", Side::Sell, dec!(1.0), dec!(50000), 2);
        let (first_id, second_id) = (first.id, second.id);
        book.process_order(first);
        book.process_order(second);

        let outcome = book.process_order(order("c", Side::Buy, dec!(1.5), dec!(50000), 3));
        assert_eq!(outcome.trades.len(), 2);
        assert_eq!(outcome.trades[0].sell_order, first_id);
        assert_eq!(outcome.trades[0].amount, dec!(1.0));
        assert_eq!(outcome.trades[1].sell_order, second_id);
        assert_eq!(outcome.trades[1].amount, dec!(0.5));

        assert!(book.get(first_id).is_none());
        assert_eq!(book.get(second_id).unwrap().amount, dec!(0.5));
    }

    #[test]
    fn test_walk_the_book_across_levels() {
        let mut book = OrderBook::new(pair());
        book.process_order(order("a", Side::Sell, dec!(0.2), dec!(49500), 1));
        book.process_order(order("b", Side::Sell, dec!(0.5), dec!(50000), 2));
        book.process_order(order("c", Side::Sell, dec!(0.4), dec!(50500), 3));

        let outcome = book.process_order(order("d", Side::Buy, dec!(1.0), dec!(50500), 4));
        let fills: Vec<_> = outcome
            .trades
            .iter()
            .map(|t| (t.price, t.amount))
            .collect();
        assert_eq!(
            fills,
            vec![
                (dec!(49500), dec!(0.2)),
                (dec!(50000), dec!(0.5)),
                (dec!(50500), dec!(0.3)),
            ]
        );
        assert_eq!(outcome.order.status, OrderStatus::Filled);

        let snapshot = book.snapshot(0);
        assert!(snapshot.bids.is_empty());
        assert_eq!(snapshot.asks, vec![LevelSnapshot {
            price: dec!(50500),
            amount: dec!(0.1),
            orders: 1,
        }]);
    }

    #[test]
    fn test_no_cross_rests_and_spreads() {
        let mut book = OrderBook::new(pair());
        book.process_order(order("a", Side::Sell, dec!(1.0), dec!(50100), 1));
        let outcome = book.process_order(order("b", Side::Buy, dec!(1.0), dec!(50000), 2));

        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.order.status, OrderStatus::Pending);
        assert_eq!(book.best_prices(), (Some(dec!(50000)), Some(dec!(50100))));
        assert_eq!(book.spread(), Some(dec!(100)));
    }

    #[test]
    fn test_cancel_is_transactional_and_idempotent() {
        let mut book = OrderBook::new(pair());
        let outcome = book.process_order(order("a", Side::Buy, dec!(1.0), dec!(50000), 1));
        let id = outcome.order.id;

        let cancelled = book.cancel_order(id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(book.is_empty());
        assert!(book.snapshot(0).bids.is_empty());
        assert!(book.cancel_order(id).is_none());
    }

    #[test]
    fn test_exact_decimal_fills_no_drift() {
        let mut book = OrderBook::new(pair());
        book.process_order(order(
            "a",
            Side::Sell,
            dec!(0.00000001),
            dec!(49999.99999998),
            1,
        ));
        let outcome = book.process_order(order(
            "b",
            Side::Buy,
            dec!(0.00000001),
            dec!(49999.99999999),
            2,
        ));

        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].price, dec!(49999.99999998));
        assert_eq!(outcome.trades[0].amount, dec!(0.00000001));
        assert!(book.is_empty());
    }

    #[test]
    fn test_zero_remnant_never_rests() {
        let mut book = OrderBook::new(pair());
        book.process_order(order("a", Side::Sell, dec!(1.0), dec!(50000), 1));
        let outcome = book.process_order(order("b", Side::Buy, dec!(1.0), dec!(50000), 2));
        assert_eq!(outcome.order.status, OrderStatus::Filled);
        assert!(book.is_empty());
        assert_eq!(book.best_prices(), (None, None));
    }

    #[test]
    fn test_recent_trades_ring_is_bounded() {
        let mut book = OrderBook::with_trade_capacity(pair(), 2);
        for i in 0..4u64 {
            book.process_order(order("a", Side::Sell, dec!(1.0), dec!(50000), i * 2));
            book.process_order(order("b", Side::Buy, dec!(1.0), dec!(50000), i * 2 + 1));
        }
        assert_eq!(book.recent_trades(0).len(), 2);
        assert_eq!(book.recent_trades(1).len(), 1);
    }
}

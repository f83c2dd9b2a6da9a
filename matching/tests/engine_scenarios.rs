//! End-to-end matching scenarios driven through the engine surface: place,
//! match, cancel, and query exactly as the node does.

use meshbook_markets::{Pair, Side};
use meshbook_matching::{EngineConfig, MatchingEngine, OrderRequest, OrderStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smol_str::SmolStr;

fn pair() -> Pair {
    "BTC/USD".parse().unwrap()
}

fn engine(node: &str) -> MatchingEngine {
    MatchingEngine::new(node, pair(), EngineConfig::default())
}

fn request(user: &str, side: Side, amount: Decimal, price: Decimal) -> OrderRequest {
    OrderRequest::new(SmolStr::new(user), side, amount, price, pair())
}

#[tokio::test]
async fn test_simple_cross() {
    let engine = engine("n1");
    engine
        .add_order(request("a", Side::Sell, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    let result = engine
        .add_order(request("b", Side::Buy, dec!(0.6), dec!(50000)))
        .await
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].amount, dec!(0.6));
    assert_eq!(result.trades[0].price, dec!(50000));
    assert_eq!(result.order.status, OrderStatus::Filled);

    let snapshot = engine.snapshot(0);
    assert!(snapshot.bids.is_empty());
    assert_eq!(snapshot.asks.len(), 1);
    assert_eq!(snapshot.asks[0].price, dec!(50000));
    assert_eq!(snapshot.asks[0].amount, dec!(0.4));
    assert_eq!(snapshot.asks[0].orders, 1);
}

#[tokio::test]
async fn test_price_time_priority() {
    let engine = engine("n1");
    let first = engine
        .add_order(request("a", Side::Sell, dec!(1.0), dec!(50000)))
        .await
        .unwrap();
    let second = engine
        .add_order(request("b", Side::Sell, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    let result = engine
        .add_order(request("c", Side::Buy, dec!(1.5), dec!(50000)))
        .await
        .unwrap();

    assert_eq!(result.trades.len(), 2);
    assert_eq!(result.trades[0].sell_order, first.order.id);
    assert_eq!(result.trades[0].amount, dec!(1.0));
    assert_eq!(result.trades[1].sell_order, second.order.id);
    assert_eq!(result.trades[1].amount, dec!(0.5));

    let resting = engine.order(second.order.id).unwrap();
    assert_eq!(resting.amount, dec!(0.5));
    assert_eq!(resting.status, OrderStatus::Partial);
}

#[tokio::test]
async fn test_walk_the_book() {
    let engine = engine("n1");
    for (amount, price) in [
        (dec!(0.2), dec!(49500)),
        (dec!(0.5), dec!(50000)),
        (dec!(0.4), dec!(50500)),
    ] {
        engine
            .add_order(request("maker", Side::Sell, amount, price))
            .await
            .unwrap();
    }

    let result = engine
        .add_order(request("taker", Side::Buy, dec!(1.0), dec!(50500)))
        .await
        .unwrap();

    let fills: Vec<_> = result.trades.iter().map(|t| (t.price, t.amount)).collect();
    assert_eq!(
        fills,
        vec![
            (dec!(49500), dec!(0.2)),
            (dec!(50000), dec!(0.5)),
            (dec!(50500), dec!(0.3)),
        ]
    );
    assert_eq!(result.order.status, OrderStatus::Filled);

    let snapshot = engine.snapshot(0);
    assert!(snapshot.bids.is_empty());
    assert_eq!(snapshot.asks.len(), 1);
    assert_eq!(snapshot.asks[0].price, dec!(50500));
    assert_eq!(snapshot.asks[0].amount, dec!(0.1));
}

#[tokio::test]
async fn test_no_cross_spread() {
    let engine = engine("n1");
    engine
        .add_order(request("a", Side::Sell, dec!(1.0), dec!(50100)))
        .await
        .unwrap();
    let result = engine
        .add_order(request("b", Side::Buy, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    assert!(result.trades.is_empty());
    assert_eq!(result.order.status, OrderStatus::Pending);

    let snapshot = engine.snapshot(0);
    assert_eq!(snapshot.bids.len(), 1);
    assert_eq!(snapshot.bids[0].amount, dec!(1.0));
    assert_eq!(snapshot.bids[0].orders, 1);
    assert_eq!(engine.spread(), Some(dec!(100)));
}

#[tokio::test]
async fn test_cancel_then_recancel() {
    let engine = engine("n1");
    let placed = engine
        .add_order(request("a", Side::Buy, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    assert_eq!(engine.cancel_order(placed.order.id), Ok(true));
    assert!(engine.snapshot(0).bids.is_empty());
    assert_eq!(
        engine.order(placed.order.id).unwrap().status,
        OrderStatus::Cancelled
    );
    assert_eq!(engine.cancel_order(placed.order.id), Ok(false));
}

#[tokio::test]
async fn test_cancel_filled_order_is_false() {
    let engine = engine("n1");
    engine
        .add_order(request("a", Side::Sell, dec!(1.0), dec!(50000)))
        .await
        .unwrap();
    let taker = engine
        .add_order(request("b", Side::Buy, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    assert_eq!(taker.order.status, OrderStatus::Filled);
    assert_eq!(engine.cancel_order(taker.order.id), Ok(false));
}

#[tokio::test]
async fn test_decimal_precision_exact() {
    let engine = engine("n1");
    engine
        .add_order(request(
            "a",
            Side::Sell,
            dec!(0.00000001),
            dec!(49999.99999998),
        ))
        .await
        .unwrap();
    let result = engine
        .add_order(request(
            "b",
            Side::Buy,
            dec!(0.00000001),
            dec!(49999.99999999),
        ))
        .await
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].price, dec!(49999.99999998));
    assert_eq!(result.trades[0].amount, dec!(0.00000001));
    assert_eq!(engine.snapshot(0).asks.len(), 0);
    assert_eq!(engine.snapshot(0).bids.len(), 0);
}

#[tokio::test]
async fn test_subscribers_observe_updates() {
    let engine = engine("n1");
    let mut updates = engine.subscribe();

    engine
        .add_order(request("a", Side::Sell, dec!(1.0), dec!(50000)))
        .await
        .unwrap();
    let taker = engine
        .add_order(request("b", Side::Buy, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    let first = updates.recv().await.unwrap();
    assert!(first.trades.is_empty());
    let second = updates.recv().await.unwrap();
    assert_eq!(second.order.id, taker.order.id);
    assert_eq!(second.trades.len(), 1);
}

#[tokio::test]
async fn test_user_orders_and_histories() {
    let engine = engine("n1");
    engine
        .add_order(request("alice", Side::Sell, dec!(1.0), dec!(50100)))
        .await
        .unwrap();
    engine
        .add_order(request("bob", Side::Buy, dec!(1.0), dec!(50000)))
        .await
        .unwrap();

    let alice = engine.user_orders("alice");
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].user, "alice");

    assert_eq!(engine.order_history().len(), 2);
    assert!(engine.trade_history().is_empty());
    assert!(engine.recent_trades(0).is_empty());
}

#[tokio::test]
async fn test_pair_mismatch_rejected() {
    let engine = engine("n1");
    let other: Pair = "ETH/USD".parse().unwrap();
    let err = engine
        .add_order(OrderRequest::new(
            SmolStr::new("a"),
            Side::Buy,
            dec!(1),
            dec!(10),
            other,
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        meshbook_matching::BookError::PairMismatch { .. }
    ));
}

//! The asynchronous matching engine facade: event queue + book + history.
//!
//! [`MatchingEngine`] is what the node talks to. Placing an order enqueues
//! an event and resolves to its [`MatchResult`] once dispatched; replayed
//! peer events enter the same queue, so local and remote mutations share
//! one deterministic path into the book. Subscribers observe every applied
//! order together with the trades it produced.

use crate::{
    book::{BookSnapshot, OrderBook},
    clock::{MonotonicTimestamps, VectorClock},
    error::BookError,
    order::{Order, OrderId, OrderRequest},
    queue::{EventHandler, EventOrigin, EventQueue, EventQueueConfig, MatchResult},
    trade::{Trade, TradeId},
};
use fnv::{FnvHashMap, FnvHashSet};
use meshbook_markets::Pair;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};
use tokio::{sync::broadcast, task::JoinHandle};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue: EventQueueConfig,
    /// Capacity of the book's recent-trade ring.
    pub max_recent_trades: usize,
    /// Retained order/trade history entries.
    pub max_history: usize,
    /// Buffered [`BookUpdate`]s per subscriber.
    pub update_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: EventQueueConfig::default(),
            max_recent_trades: 1_000,
            max_history: 10_000,
            update_buffer: 256,
        }
    }
}

/// Published to subscribers after every applied order event, before the
/// originating `add_order` call returns.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub origin: EventOrigin,
    /// Final state of the applied order.
    pub order: Order,
    /// Trades the application produced.
    pub trades: Vec<Trade>,
    /// The event's vector-clock stamp.
    pub clock: VectorClock,
}

/// Matching engine for a single trading pair.
#[derive(Debug)]
pub struct MatchingEngine {
    node_id: SmolStr,
    pair: Pair,
    queue: EventQueue,
    book: Arc<RwLock<OrderBook>>,
    history: Arc<RwLock<History>>,
    updates: broadcast::Sender<BookUpdate>,
    timestamps: MonotonicTimestamps,
    processing: Arc<AtomicBool>,
    _worker: JoinHandle<()>,
}

impl MatchingEngine {
    pub fn new(node_id: &str, pair: Pair, config: EngineConfig) -> Self {
        let book = Arc::new(RwLock::new(OrderBook::with_trade_capacity(
            pair.clone(),
            config.max_recent_trades,
        )));
        let history = Arc::new(RwLock::new(History::new(config.max_history)));
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        let processing = Arc::new(AtomicBool::new(false));

        let core = EngineCore {
            book: Arc::clone(&book),
            history: Arc::clone(&history),
            updates: updates.clone(),
            processing: Arc::clone(&processing),
        };
        let (queue, worker) = EventQueue::spawn(node_id, core, config.queue);

        Self {
            node_id: SmolStr::new(node_id),
            pair,
            queue,
            book,
            history,
            updates,
            timestamps: MonotonicTimestamps::new(),
            processing,
            _worker: worker,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    /// Place a validated local order: assigns identity, enqueues the order
    /// event, and resolves once the event has been matched.
    pub async fn add_order(&self, request: OrderRequest) -> Result<MatchResult, BookError> {
        self.check_pair(&request.pair)?;
        let order = Order::open(request, self.timestamps.next());
        let receiver = self
            .queue
            .enqueue_order(order, None, EventOrigin::Local)?;
        receiver.await.map_err(|_| BookError::QueueClosed)
    }

    /// Replay an order received from a peer, keeping its origin stamp.
    ///
    /// Fire and forget: the outcome is observable via [`Self::subscribe`].
    pub fn replay_order(&self, order: Order, clock: VectorClock) -> Result<(), BookError> {
        self.check_pair(&order.pair)?;
        self.queue
            .enqueue_order(order, Some(clock), EventOrigin::Remote)
            .map(drop)
    }

    /// Record a trade replica received from a peer. Never re-matches.
    pub fn record_remote_trade(
        &self,
        trade: Trade,
        clock: VectorClock,
    ) -> Result<(), BookError> {
        self.check_pair(&trade.pair)?;
        self.queue
            .enqueue_trade(trade, Some(clock), EventOrigin::Remote)
    }

    /// Cancel a resting order. `Ok(true)` iff the order was still open;
    /// fails with `Busy` while an order application holds the book.
    pub fn cancel_order(&self, id: OrderId) -> Result<bool, BookError> {
        let cancelled = {
            let mut book = self.book.try_write().ok_or(BookError::Busy)?;
            book.cancel_order(id)
        };
        match cancelled {
            Some(order) => {
                self.history.write().record_order(order);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current state of an order: resting book entry, else history.
    pub fn order(&self, id: OrderId) -> Option<Order> {
        if let Some(order) = self.book.read().get(id) {
            return Some(order.clone());
        }
        self.history.read().orders.get(&id).cloned()
    }

    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        self.book.read().snapshot(depth)
    }

    /// Resting orders belonging to `user`.
    pub fn user_orders(&self, user: &str) -> Vec<Order> {
        self.book.read().user_orders(user)
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.book.read().recent_trades(limit)
    }

    /// Every order this node has seen, oldest first.
    pub fn order_history(&self) -> Vec<Order> {
        self.history.read().orders_in_sequence()
    }

    /// Every trade this node has recorded, oldest first.
    pub fn trade_history(&self) -> Vec<Trade> {
        self.history.read().trades.iter().cloned().collect()
    }

    pub fn best_prices(&self) -> (Option<Decimal>, Option<Decimal>) {
        self.book.read().best_prices()
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.book.read().spread()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookUpdate> {
        self.updates.subscribe()
    }

    /// Snapshot of the engine's vector clock.
    pub fn clock(&self) -> VectorClock {
        self.queue.clock()
    }

    /// Whether an order application currently holds the book.
    pub fn is_processing(&self) -> bool {
        self.processing.load(AtomicOrdering::Relaxed)
    }

    fn check_pair(&self, pair: &Pair) -> Result<(), BookError> {
        if pair != &self.pair {
            return Err(BookError::PairMismatch {
                expected: self.pair.clone(),
                got: pair.clone(),
            });
        }
        Ok(())
    }
}

/// The queue's event handler: applies events to the book, records history,
/// and publishes updates.
struct EngineCore {
    book: Arc<RwLock<OrderBook>>,
    history: Arc<RwLock<History>>,
    updates: broadcast::Sender<BookUpdate>,
    processing: Arc<AtomicBool>,
}

impl EventHandler for EngineCore {
    fn on_order(&mut self, order: Order, clock: &VectorClock, origin: EventOrigin) -> MatchResult {
        self.processing.store(true, AtomicOrdering::SeqCst);
        let outcome = self.book.write().process_order(order);
        self.processing.store(false, AtomicOrdering::SeqCst);

        {
            let mut history = self.history.write();
            history.record_order(outcome.order.clone());
            for maker in &outcome.makers {
                history.record_order(maker.clone());
            }
            for trade in &outcome.trades {
                history.record_trade(trade.clone());
            }
        }

        // Subscribers observe the event before the caller's future resolves.
        let _ = self.updates.send(BookUpdate {
            origin,
            order: outcome.order.clone(),
            trades: outcome.trades.clone(),
            clock: clock.clone(),
        });

        MatchResult {
            order: outcome.order,
            trades: outcome.trades,
            clock: clock.clone(),
        }
    }

    fn on_trade(&mut self, trade: Trade, _clock: &VectorClock, origin: EventOrigin) {
        // A replica of a trade another node executed. When this node has
        // already produced the trade by replaying the same orders, the
        // derived id makes the replica a duplicate and it is dropped.
        let fresh = self.history.write().record_trade(trade.clone());
        if fresh && origin == EventOrigin::Remote {
            self.book.write().record_trade(trade);
        }
    }
}

/// Bounded order/trade history with id-deduplicated trades.
#[derive(Debug)]
struct History {
    orders: FnvHashMap<OrderId, Order>,
    order_seq: VecDeque<OrderId>,
    trades: VecDeque<Trade>,
    trade_ids: FnvHashSet<TradeId>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            orders: FnvHashMap::default(),
            order_seq: VecDeque::new(),
            trades: VecDeque::new(),
            trade_ids: FnvHashSet::default(),
            capacity: capacity.max(1),
        }
    }

    fn record_order(&mut self, order: Order) {
        let id = order.id;
        if self.orders.insert(id, order).is_none() {
            self.order_seq.push_back(id);
            if self.order_seq.len() > self.capacity {
                if let Some(evicted) = self.order_seq.pop_front() {
                    self.orders.remove(&evicted);
                }
            }
        }
    }

    fn orders_in_sequence(&self) -> Vec<Order> {
        self.order_seq
            .iter()
            .filter_map(|id| self.orders.get(id).cloned())
            .collect()
    }

    fn record_trade(&mut self, trade: Trade) -> bool {
        if !self.trade_ids.insert(trade.id) {
            return false;
        }
        if self.trades.len() == self.capacity {
            if let Some(evicted) = self.trades.pop_front() {
                self.trade_ids.remove(&evicted.id);
            }
        }
        self.trades.push_back(trade);
        true
    }
}

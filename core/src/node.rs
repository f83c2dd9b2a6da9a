//! The node facade wiring matching and transport together.
//!
//! One [`Node`] is one exchange participant: it owns the matching engine
//! for its pair, the TCP connection service, the peer manager, the
//! broadcast router and discovery, and runs the event loops that glue
//! them. Client calls go rate-limit → validate → book → broadcast; peer
//! frames go fingerprint-dedup → causal queue → book, with locally
//! produced trades broadcast exactly once.

use crate::{
    config::Config,
    error::{ErrorKind, NodeError},
    rate_limit::{RateCategory, RateLimitConfig, RateLimiter},
    validate::validate_order_input,
};
use meshbook_markets::{DecimalBounds, Pair, Side};
use meshbook_matching::{
    clock::StampedClock, BookSnapshot, BookUpdate, EngineConfig, EventOrigin, MatchResult,
    MatchingEngine, Order, OrderId, OrderRequest, OrderStatus, Trade,
};
use meshbook_p2p::{
    breaker::CircuitBreakerConfig,
    connection::{ConnectionConfig, ConnectionEvent},
    discovery::{DiscoveryConfig, DiscoveryEvent},
    peer::{Peer, PeerEvent, PeerManagerConfig},
    CircuitBreaker, CircuitState, DirectConnectionService, Message, MessageRouter, PeerDiscovery,
    PeerManager, RouterConfig,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-visible result of an order placement.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub trades: Vec<Trade>,
    /// Unfilled remnant resting in the book, when any.
    pub remaining: Option<Decimal>,
}

/// Point-in-time node diagnostics.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: SmolStr,
    pub pair: Pair,
    pub connected_inbound: usize,
    pub connected_outbound: usize,
    pub known_peers: usize,
    pub queued_retries: usize,
    pub breaker: CircuitState,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

/// A full Meshbook exchange participant.
#[derive(Debug)]
pub struct Node {
    node_id: SmolStr,
    /// The local trading identity; one user per node instance.
    user: SmolStr,
    config: Config,
    pair: Pair,
    bounds: DecimalBounds,
    engine: Arc<MatchingEngine>,
    service: Arc<DirectConnectionService>,
    manager: Arc<PeerManager>,
    router: Arc<MessageRouter>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    discovery: Mutex<Option<Arc<PeerDiscovery>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    peer_events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    /// Build every component from configuration. Nothing runs until
    /// [`Node::start`].
    pub fn new(config: Config) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let pair = config.pair()?;
        let node_id = SmolStr::new(Uuid::new_v4().to_string());
        let bounds = DecimalBounds {
            max_amount: config.performance.max_order_amount,
            max_price: config.performance.max_order_price,
        };

        let breaker = Arc::new(CircuitBreaker::new(
            "p2p-transport",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker.failure_threshold,
                reset_timeout: config.circuit_breaker.reset_timeout(),
            },
        ));

        let engine = Arc::new(MatchingEngine::new(
            &node_id,
            pair.clone(),
            EngineConfig::default(),
        ));

        let (service, inbox) = DirectConnectionService::new(
            node_id.clone(),
            ConnectionConfig {
                host: config.p2p.host.clone(),
                port: config.p2p_port(),
                ..Default::default()
            },
            Arc::clone(&breaker),
        );

        let (manager, peer_events) = PeerManager::new(PeerManagerConfig {
            max_inbound: config.p2p.max_inbound,
            max_outbound: config.p2p.max_outbound,
            storage_path: config.p2p.peer_storage_path.clone(),
            ..Default::default()
        });

        let router = MessageRouter::new(
            Arc::clone(&service),
            Arc::clone(&manager),
            RouterConfig::default(),
        );

        let limiter = RateLimiter::new(
            config.security.enable_rate_limit,
            RateLimitConfig {
                orders_per_minute: config.security.orders_per_minute,
                requests_per_second: config.security.requests_per_second,
                messages_per_minute: config.security.messages_per_minute,
            },
        );

        Ok(Arc::new(Self {
            user: node_id.clone(),
            node_id,
            config,
            pair,
            bounds,
            engine,
            service,
            manager,
            router,
            breaker,
            limiter,
            discovery: Mutex::new(None),
            inbox: Mutex::new(Some(inbox)),
            peer_events: Mutex::new(Some(peer_events)),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    /// The port peers can dial; meaningful after [`Node::start`].
    pub fn listen_port(&self) -> u16 {
        self.config.p2p_port()
    }

    /// Bind the listener, load persisted peers, and spawn every loop.
    /// A listener-bind failure is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<u16, NodeError> {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return Err(NodeError::new(ErrorKind::Busy, "node already started"));
        }

        let (local, listen_task) = self.service.listen().await.map_err(|error| {
            NodeError::fatal(format!("listener bind failed: {error}"))
                .with_context("host", self.config.p2p.host.clone())
                .with_context("port", self.config.p2p_port().to_string())
        })?;

        if let Err(error) = self.manager.load() {
            warn!(%error, "persisted peer table unusable, starting empty");
        }

        let mut tasks = vec![listen_task];
        tasks.extend(self.manager.spawn_loops());
        tasks.push(self.router.spawn_retry_loop());

        // Discovery wants the real bound port for its LAN announcements.
        let (discovery, discovery_rx) = PeerDiscovery::new(
            self.node_id.clone(),
            local.port(),
            DiscoveryConfig {
                bootstrap_peers: self.config.p2p.bootstrap_peers.clone(),
                enable_lan: self.config.p2p.enable_mdns,
                enable_peer_exchange: self.config.p2p.enable_peer_exchange,
                ..Default::default()
            },
        );
        match discovery.spawn().await {
            Ok(handles) => tasks.extend(handles),
            Err(error) => warn!(%error, "discovery loops unavailable"),
        }
        discovery.emit_bootstrap();
        *self.discovery.lock() = Some(Arc::clone(&discovery));

        let inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| NodeError::fatal("node restarted after shutdown"))?;
        let peer_events = self
            .peer_events
            .lock()
            .take()
            .ok_or_else(|| NodeError::fatal("node restarted after shutdown"))?;

        let node = Arc::clone(self);
        tasks.push(tokio::spawn(node.run_ingest(inbox)));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(node.run_peer_events(peer_events)));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(node.run_discovery(discovery_rx)));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(node.run_book_updates()));

        *self.tasks.lock() = tasks;
        info!(
            node = %self.node_id,
            pair = %self.pair,
            port = local.port(),
            "node started"
        );
        Ok(local.port())
    }

    /// Stop loops, announce the shutdown to peers, persist the table.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, AtomicOrdering::SeqCst) {
            return;
        }
        self.service.shutdown("node shutdown");
        // Let the farewell frames drain before sockets drop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(error) = self.manager.persist_now() {
            warn!(%error, "final peer table save failed");
        }
        info!(node = %self.node_id, "node stopped");
    }

    /// Place a buy order for the node's user.
    pub async fn place_buy(&self, amount: &str, price: &str) -> Result<OrderOutcome, NodeError> {
        self.place(Side::Buy, amount, price).await
    }

    /// Place a sell order for the node's user.
    pub async fn place_sell(&self, amount: &str, price: &str) -> Result<OrderOutcome, NodeError> {
        self.place(Side::Sell, amount, price).await
    }

    async fn place(
        &self,
        side: Side,
        amount: &str,
        price: &str,
    ) -> Result<OrderOutcome, NodeError> {
        let started = Instant::now();
        if !self.limiter.allow(&self.user, RateCategory::Orders, 1) {
            return Err(NodeError::rate_limited(&self.user, "orders"));
        }
        let (amount, price) = validate_order_input(&self.user, amount, price, &self.bounds)?;
        let request = OrderRequest::new(self.user.clone(), side, amount, price, self.pair.clone());
        let result = self.engine.add_order(request).await?;

        // Propagation is best effort; the local result stands regardless.
        self.broadcast_placement(&result);

        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(self.config.performance.threshold_ms) {
            warn!(
                order = %result.order.id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.performance.threshold_ms,
                "slow order placement"
            );
        }

        Ok(OrderOutcome {
            order_id: result.order.id,
            status: result.order.status,
            remaining: (result.order.amount > Decimal::ZERO).then_some(result.order.amount),
            trades: result.trades,
        })
    }

    /// Cancel one of this node's orders. `Ok(true)` iff it was still open.
    pub fn cancel(&self, order_id: OrderId) -> Result<bool, NodeError> {
        if !self.limiter.allow(&self.user, RateCategory::Requests, 1) {
            return Err(NodeError::rate_limited(&self.user, "requests"));
        }
        let cancelled = self.engine.cancel_order(order_id)?;
        if cancelled {
            let message = Message::CancelOrder {
                node_id: self.node_id.clone(),
                timestamp: Message::now_ms(),
                order_id,
            };
            self.router.broadcast(&message);
        }
        Ok(cancelled)
    }

    pub fn orderbook(&self, depth: usize) -> BookSnapshot {
        self.engine.snapshot(depth)
    }

    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.engine.order(id)
    }

    /// This node's resting orders.
    pub fn user_orders(&self) -> Vec<Order> {
        self.engine.user_orders(&self.user)
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.engine.recent_trades(limit)
    }

    pub fn order_history(&self) -> Vec<Order> {
        self.engine.order_history()
    }

    pub fn trade_history(&self) -> Vec<Trade> {
        self.engine.trade_history()
    }

    pub fn best_prices(&self) -> (Option<Decimal>, Option<Decimal>) {
        self.engine.best_prices()
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.engine.spread()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.manager.all_peers()
    }

    pub fn status(&self) -> NodeStatus {
        let (connected_inbound, connected_outbound) = self.manager.connection_counts();
        let (best_bid, best_ask) = self.engine.best_prices();
        NodeStatus {
            node_id: self.node_id.clone(),
            pair: self.pair.clone(),
            connected_inbound,
            connected_outbound,
            known_peers: self.manager.all_peers().len(),
            queued_retries: self.router.queued(),
            breaker: self.breaker.state(),
            best_bid,
            best_ask,
        }
    }

    /// Dial a specific endpoint now (used by the CLI and tests).
    pub async fn connect_to(&self, address: &str, port: u16) -> Result<SmolStr, NodeError> {
        self.service.dial(address, port).await.map_err(NodeError::from)
    }

    /// Broadcast the original submitted order plus the trades it produced.
    fn broadcast_placement(&self, result: &MatchResult) {
        let filled: Decimal = result.trades.iter().map(|trade| trade.amount).sum();
        let mut original = result.order.clone();
        original.amount += filled;
        original.status = OrderStatus::Pending;

        let stamp = StampedClock::from(result.clock.clone());
        let order_message = Message::Order {
            node_id: self.node_id.clone(),
            timestamp: Message::now_ms(),
            order: original,
            clock: stamp.clone(),
        };
        let outcome = self.router.broadcast(&order_message);
        debug!(
            order = %result.order.id,
            sent = outcome.sent.len(),
            failed = outcome.failed.len(),
            "order broadcast"
        );
        self.broadcast_trades(&result.trades, &stamp);
    }

    fn broadcast_trades(&self, trades: &[Trade], stamp: &StampedClock) {
        for trade in trades {
            let message = Message::Trade {
                node_id: self.node_id.clone(),
                timestamp: Message::now_ms(),
                trade: trade.clone(),
                clock: stamp.clone(),
            };
            self.router.broadcast(&message);
        }
    }

    /// Connection-service events: registrations, frames, closures.
    async fn run_ingest(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = inbox.recv().await {
            match event {
                ConnectionEvent::PeerConnected(info) => {
                    if let Err(error) = self.manager.register_connected(&info) {
                        warn!(peer = %info.node_id, %error, "refusing connection");
                        self.service.disconnect(&info.node_id, "connection quota exhausted");
                    }
                }
                ConnectionEvent::Message {
                    peer,
                    message,
                    bytes,
                } => {
                    self.manager.record_received(&peer, bytes);
                    self.handle_peer_message(peer, message);
                }
                ConnectionEvent::PeerDisconnected { peer, reason } => {
                    self.manager.mark_disconnected(&peer, &reason);
                }
            }
        }
    }

    fn handle_peer_message(&self, peer: SmolStr, message: Message) {
        if !self.limiter.allow(&peer, RateCategory::Messages, 1) {
            debug!(peer = %peer, "dropping message, peer over rate limit");
            return;
        }
        match message {
            Message::HeartbeatAck { .. } => self.manager.record_heartbeat(&peer),
            Message::HandshakeAck { .. } => {}
            Message::PeerExchangeRequest { .. } => {
                let reply = Message::PeerExchange {
                    node_id: self.node_id.clone(),
                    timestamp: Message::now_ms(),
                    peers: self.manager.peers_for_sharing(),
                };
                if let Err(error) = self.router.send_to_peer(&peer, reply) {
                    debug!(peer = %peer, %error, "peer exchange reply queued/failed");
                }
            }
            Message::PeerExchange { ref peers, .. } => {
                if let Some(discovery) = self.discovery.lock().as_ref() {
                    discovery.handle_peer_exchange(peers);
                }
            }
            Message::Error { code, message, .. } => {
                warn!(peer = %peer, code, message, "peer reported protocol error");
            }
            replicated @ (Message::Order { .. }
            | Message::Trade { .. }
            | Message::CancelOrder { .. }) => {
                if !self.router.mark_seen(&replicated) {
                    debug!(peer = %peer, kind = replicated.kind(), "duplicate replica dropped");
                    return;
                }
                self.apply_replica(&peer, replicated);
            }
            // Heartbeat, Disconnect and Handshake are routed inside the
            // connection service and never reach this point.
            other => debug!(peer = %peer, kind = other.kind(), "ignoring unexpected frame"),
        }
    }

    fn apply_replica(&self, peer: &SmolStr, message: Message) {
        match message {
            Message::Order { order, clock, .. } => {
                let id = order.id;
                if let Err(error) = self.engine.replay_order(order, clock.into()) {
                    warn!(peer = %peer, order = %id, %error, "remote order rejected");
                }
            }
            Message::Trade { trade, clock, .. } => {
                let id = trade.id;
                if let Err(error) = self.engine.record_remote_trade(trade, clock.into()) {
                    warn!(peer = %peer, trade = %id, %error, "remote trade rejected");
                }
            }
            Message::CancelOrder { order_id, .. } => {
                match self.engine.cancel_order(order_id) {
                    Ok(cancelled) => {
                        debug!(peer = %peer, order = %order_id, cancelled, "remote cancel applied")
                    }
                    Err(error) => {
                        warn!(peer = %peer, order = %order_id, %error, "remote cancel failed")
                    }
                }
            }
            _ => {}
        }
    }

    /// Peer-manager events: probes, evictions, reconnect requests.
    async fn run_peer_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::HeartbeatNeeded(peer) => {
                    let probe = Message::Heartbeat {
                        node_id: self.node_id.clone(),
                        timestamp: Message::now_ms(),
                    };
                    if let Err(error) = self.service.send(&peer, probe) {
                        debug!(peer = %peer, %error, "heartbeat probe failed");
                    } else {
                        self.manager.record_sent(&peer, 0);
                    }
                }
                PeerEvent::Evicted { peer, reason } => {
                    self.service.disconnect(&peer, &reason);
                }
                PeerEvent::ReconnectRequested {
                    peer,
                    address,
                    port,
                } => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        match node.service.dial(&address, port).await {
                            Ok(connected) => {
                                debug!(peer = %connected, "reconnect succeeded")
                            }
                            Err(error) => {
                                debug!(peer = %peer, %error, "reconnect failed");
                                node.manager.reconnect_failed(&peer);
                            }
                        }
                    });
                }
            }
        }
    }

    /// Discovery events: candidate endpoints and peer-exchange prompts.
    async fn run_discovery(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::Peer(found) => {
                    if let Some(node_id) = &found.node_id {
                        if node_id == &self.node_id || self.service.is_connected(node_id) {
                            continue;
                        }
                    }
                    debug!(
                        address = %found.address,
                        port = found.port,
                        source = ?found.source,
                        "dialing discovered peer"
                    );
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(error) = node.service.dial(&found.address, found.port).await {
                            debug!(address = %found.address, %error, "discovery dial failed");
                            if let Some(node_id) = &found.node_id {
                                node.manager.record_failed_connection(node_id);
                            }
                        }
                    });
                }
                DiscoveryEvent::PeerExchangeDue => {
                    let request = Message::PeerExchangeRequest {
                        node_id: self.node_id.clone(),
                        timestamp: Message::now_ms(),
                    };
                    for (peer, outcome) in self.service.broadcast(&request) {
                        if let Err(error) = outcome {
                            debug!(peer = %peer, %error, "peer exchange request failed");
                        }
                    }
                }
            }
        }
    }

    /// Book updates: broadcast trades this node produced from replayed
    /// remote orders, exactly once per trade fingerprint.
    async fn run_book_updates(self: Arc<Self>) {
        let mut updates = self.engine.subscribe();
        loop {
            let update: BookUpdate = match updates.recv().await {
                Ok(update) => update,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "book update stream lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if update.origin == EventOrigin::Remote && !update.trades.is_empty() {
                let stamp = StampedClock::from(update.clock);
                self.broadcast_trades(&update.trades, &stamp);
            }
        }
    }
}

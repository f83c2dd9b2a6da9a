//! Deduplicating broadcast router with bounded retry queue.
//!
//! The router is the outbound application path: `send_to_peer` falls back
//! to a bounded retry queue on failure, `broadcast` fans out to healthy
//! peers exactly once per message fingerprint. The same fingerprint cache
//! gates inbound order/trade messages so the book's event queue never sees
//! a replica twice within the dedup window.

use crate::{
    connection::DirectConnectionService,
    error::P2pError,
    peer::PeerManager,
    protocol::Message,
};
use fnv::{FnvHashMap, FnvHasher};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{
    collections::VecDeque,
    hash::Hasher,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Retry queue bound; overflow drops the oldest entry.
    pub max_queued: usize,
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// Fingerprint cache bound.
    pub dedup_capacity: usize,
    /// Soft lifetime of a fingerprint.
    pub dedup_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_queued: 1_000,
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(60),
        }
    }
}

/// Per-peer outcome of one broadcast.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOutcome {
    pub sent: Vec<SmolStr>,
    pub failed: Vec<(SmolStr, String)>,
    /// The fingerprint was already seen; nothing was sent.
    pub duplicate: bool,
}

#[derive(Debug)]
struct QueuedMessage {
    peer: SmolStr,
    message: Message,
    attempts: u32,
    last_attempt: Instant,
}

/// Outbound application router.
#[derive(Debug)]
pub struct MessageRouter {
    service: Arc<DirectConnectionService>,
    manager: Arc<PeerManager>,
    config: RouterConfig,
    seen: Mutex<FingerprintCache>,
    queue: Mutex<VecDeque<QueuedMessage>>,
}

impl MessageRouter {
    pub fn new(
        service: Arc<DirectConnectionService>,
        manager: Arc<PeerManager>,
        config: RouterConfig,
    ) -> Arc<Self> {
        let seen = FingerprintCache::new(config.dedup_capacity, config.dedup_ttl);
        Arc::new(Self {
            service,
            manager,
            config,
            seen: Mutex::new(seen),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// 64-bit fingerprint over the message identity: type, origin node,
    /// origin timestamp, and the order/trade id when present.
    pub fn fingerprint(message: &Message) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(message.kind().as_bytes());
        hasher.write(message.node_id().as_bytes());
        hasher.write(&message.timestamp().to_be_bytes());
        match message {
            Message::Order { order, .. } => hasher.write(order.id.0.as_bytes()),
            Message::Trade { trade, .. } => hasher.write(trade.id.0.as_bytes()),
            Message::CancelOrder { order_id, .. } => hasher.write(order_id.0.as_bytes()),
            _ => {}
        }
        hasher.finish()
    }

    /// Record a message as observed. `true` when it was fresh; `false`
    /// when it was already inside the dedup window. Used both before
    /// broadcasting and as the inbound replica gate.
    pub fn mark_seen(&self, message: &Message) -> bool {
        self.seen.lock().check_and_insert(Self::fingerprint(message))
    }

    /// Direct send with retry-queue fallback.
    pub fn send_to_peer(&self, peer: &str, message: Message) -> Result<(), P2pError> {
        match self.service.send(peer, message.clone()) {
            Ok(()) => {
                self.manager.record_sent(peer, 0);
                Ok(())
            }
            Err(error) if error.is_retryable() => {
                debug!(peer = %peer, %error, "send failed, queueing for retry");
                self.enqueue_retry(SmolStr::new(peer), message);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Fan out to healthy peers, once per fingerprint.
    ///
    /// Healthy means connected with a live heartbeat. With zero peers the
    /// outcome is an empty success set, returned promptly.
    pub fn broadcast(&self, message: &Message) -> BroadcastOutcome {
        if !self.mark_seen(message) {
            debug!(kind = message.kind(), "suppressing duplicate broadcast");
            return BroadcastOutcome {
                duplicate: true,
                ..Default::default()
            };
        }

        let mut outcome = BroadcastOutcome::default();
        for peer in self.manager.healthy_peers() {
            match self.service.send(&peer, message.clone()) {
                Ok(()) => {
                    self.manager.record_sent(&peer, 0);
                    outcome.sent.push(peer);
                }
                Err(error) => {
                    if error.is_retryable() {
                        self.enqueue_retry(peer.clone(), message.clone());
                    }
                    outcome.failed.push((peer, error.to_string()));
                }
            }
        }
        outcome
    }

    /// Queue depth, for diagnostics.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Spawn the retry loop. Retry order is not guaranteed.
    pub fn spawn_retry_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.retry_delay);
            loop {
                ticker.tick().await;
                router.retry_tick();
            }
        })
    }

    /// One retry pass over due entries.
    pub fn retry_tick(&self) {
        let due: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock();
            let mut rest = VecDeque::new();
            let mut due = Vec::new();
            while let Some(entry) = queue.pop_front() {
                if entry.last_attempt.elapsed() >= self.config.retry_delay {
                    due.push(entry);
                } else {
                    rest.push_back(entry);
                }
            }
            *queue = rest;
            due
        };

        for mut entry in due {
            match self.service.send(&entry.peer, entry.message.clone()) {
                Ok(()) => {
                    self.manager.record_sent(&entry.peer, 0);
                    debug!(peer = %entry.peer, "queued message delivered");
                }
                Err(_) => {
                    entry.attempts += 1;
                    entry.last_attempt = Instant::now();
                    if entry.attempts >= self.config.max_retries {
                        warn!(
                            peer = %entry.peer,
                            kind = entry.message.kind(),
                            attempts = entry.attempts,
                            "dropping message after retry cap"
                        );
                    } else {
                        self.push_bounded(entry);
                    }
                }
            }
        }
    }

    fn enqueue_retry(&self, peer: SmolStr, message: Message) {
        self.push_bounded(QueuedMessage {
            peer,
            message,
            attempts: 1,
            last_attempt: Instant::now(),
        });
    }

    fn push_bounded(&self, entry: QueuedMessage) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queued {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    peer = %dropped.peer,
                    kind = dropped.message.kind(),
                    "retry queue full, dropping oldest entry"
                );
            }
        }
        queue.push_back(entry);
    }
}

/// Bounded fingerprint cache with soft TTL expiry.
#[derive(Debug)]
struct FingerprintCache {
    entries: FnvHashMap<u64, Instant>,
    order: VecDeque<u64>,
    capacity: usize,
    ttl: Duration,
}

impl FingerprintCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: FnvHashMap::default(),
            order: VecDeque::new(),
            capacity: capacity.max(10),
            ttl,
        }
    }

    /// Insert if unseen. Expired entries do not count as seen.
    fn check_and_insert(&mut self, fingerprint: u64) -> bool {
        self.expire_front();
        if let Some(at) = self.entries.get(&fingerprint) {
            if at.elapsed() < self.ttl {
                return false;
            }
            self.entries.remove(&fingerprint);
        }
        self.entries.insert(fingerprint, Instant::now());
        self.order.push_back(fingerprint);
        if self.entries.len() > self.capacity {
            // Oldest 10% first, then whatever it takes to get under cap.
            let bulk = (self.capacity / 10).max(1);
            for _ in 0..bulk {
                self.evict_oldest();
            }
            while self.entries.len() > self.capacity {
                self.evict_oldest();
            }
        }
        true
    }

    fn expire_front(&mut self) {
        while let Some(&front) = self.order.front() {
            let expired = self
                .entries
                .get(&front)
                .map(|at| at.elapsed() >= self.ttl)
                // Stale order entry for an already-evicted fingerprint.
                .unwrap_or(true);
            if expired {
                self.order.pop_front();
                self.entries.remove(&front);
            } else {
                break;
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        breaker::{CircuitBreaker, CircuitBreakerConfig},
        connection::ConnectionConfig,
        peer::PeerManagerConfig,
    };

    fn router() -> Arc<MessageRouter> {
        let breaker = Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default()));
        let (service, _events) =
            DirectConnectionService::new("n1", ConnectionConfig::default(), breaker);
        let (manager, _peer_events) = PeerManager::new(PeerManagerConfig::default());
        MessageRouter::new(service, manager, RouterConfig::default())
    }

    fn heartbeat(ts: i64) -> Message {
        Message::Heartbeat {
            node_id: SmolStr::new("n1"),
            timestamp: ts,
        }
    }

    #[test]
    fn test_send_to_unconnected_peer_queues_for_retry() {
        let router = router();
        let err = router.send_to_peer("ghost", heartbeat(1)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(router.queued(), 1);

        // Not due yet: the entry waits out the retry delay.
        router.retry_tick();
        assert_eq!(router.queued(), 1);
    }

    #[test]
    fn test_broadcast_dedups_by_fingerprint() {
        let router = router();
        let message = heartbeat(42);
        let first = router.broadcast(&message);
        assert!(!first.duplicate);
        assert!(first.sent.is_empty(), "no peers yet");

        let second = router.broadcast(&message);
        assert!(second.duplicate);
    }

    #[test]
    fn test_fingerprint_stable_and_discriminating() {
        let a = Message::Heartbeat {
            node_id: SmolStr::new("n1"),
            timestamp: 42,
        };
        let b = Message::Heartbeat {
            node_id: SmolStr::new("n1"),
            timestamp: 43,
        };
        let c = Message::HeartbeatAck {
            node_id: SmolStr::new("n1"),
            timestamp: 42,
        };
        assert_eq!(MessageRouter::fingerprint(&a), MessageRouter::fingerprint(&a));
        assert_ne!(MessageRouter::fingerprint(&a), MessageRouter::fingerprint(&b));
        assert_ne!(MessageRouter::fingerprint(&a), MessageRouter::fingerprint(&c));
    }

    #[test]
    fn test_cache_dedups_within_ttl() {
        let mut cache = FingerprintCache::new(100, Duration::from_secs(60));
        assert!(cache.check_and_insert(7));
        assert!(!cache.check_and_insert(7));
        assert!(cache.check_and_insert(8));
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let mut cache = FingerprintCache::new(100, Duration::from_millis(10));
        assert!(cache.check_and_insert(7));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.check_and_insert(7));
    }

    #[test]
    fn test_cache_bounded_with_bulk_eviction() {
        let mut cache = FingerprintCache::new(10, Duration::from_secs(60));
        for fp in 0..11u64 {
            assert!(cache.check_and_insert(fp));
        }
        assert!(cache.entries.len() <= 10);
        // The oldest fingerprint went first.
        assert!(cache.check_and_insert(0));
    }
}

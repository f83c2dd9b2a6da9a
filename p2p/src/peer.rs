//! Canonical peer table, heartbeat/reconnect loops and persistence.
//!
//! The [`PeerManager`] owns every [`Peer`] record; other components read
//! through accessors and never mutate. Peers are created on handshake
//! completion (or loaded from the persisted blob as disconnected) and are
//! never deleted while the process runs, so connection statistics survive
//! for reputation-informed reconnection.
//!
//! The manager performs no I/O on sockets itself: its loops emit
//! [`PeerEvent`]s and the node reacts by sending probes or dialing.

use crate::{connection::PeerInfo, error::P2pError, protocol::PeerAddr};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// Version tag of the persisted blob.
const STORE_VERSION: u32 = 1;

/// Peer connection status.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

/// Lifetime transfer and connection counters for one peer.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub reconnect_attempts: u32,
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: SmolStr,
    pub address: String,
    pub port: u16,
    pub status: PeerStatus,
    pub inbound: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: PeerStats,
}

impl Peer {
    /// Reputation score in `[0, 1]`: successful over attempted
    /// connections, zero when untried.
    pub fn score(&self) -> f64 {
        let attempts = self.stats.successful_connections + self.stats.failed_connections;
        if attempts == 0 {
            return 0.0;
        }
        self.stats.successful_connections as f64 / attempts as f64
    }

    /// Loopback endpoints are never persisted or shared.
    pub fn is_loopback(&self) -> bool {
        matches!(self.address.as_str(), "localhost")
            || self
                .address
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }

    /// Most recent sign of life for heartbeat accounting.
    fn liveness(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.connected_at)
    }
}

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_multiplier: u32,
    pub max_reconnect_backoff: Duration,
    pub max_shared_peers: usize,
    /// Debounce between dirty-table saves.
    pub persist_interval: Duration,
    /// Opaque blob path; `None` disables persistence.
    pub storage_path: Option<PathBuf>,
    /// Stored entries older than this are dropped on load.
    pub max_stored_age: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            max_inbound: 50,
            max_outbound: 50,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_multiplier: 2,
            max_reconnect_backoff: Duration::from_secs(60),
            max_shared_peers: 20,
            persist_interval: Duration::from_secs(2),
            storage_path: None,
            max_stored_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Emitted by the manager's loops; the node reacts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PeerEvent {
    /// Time to probe this established peer.
    HeartbeatNeeded(SmolStr),
    /// Peer evicted; the node should close its socket.
    Evicted { peer: SmolStr, reason: String },
    /// Backoff has elapsed; the node should dial.
    ReconnectRequested {
        peer: SmolStr,
        address: String,
        port: u16,
    },
}

/// Persisted blob layout.
#[derive(Debug, Serialize, Deserialize)]
struct PeerStore {
    version: u32,
    saved_at: DateTime<Utc>,
    peers: Vec<Peer>,
}

/// Owner of the canonical peer table.
#[derive(Debug)]
pub struct PeerManager {
    config: PeerManagerConfig,
    peers: RwLock<FnvHashMap<SmolStr, Peer>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    dirty: AtomicBool,
}

impl PeerManager {
    pub fn new(config: PeerManagerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                peers: RwLock::new(FnvHashMap::default()),
                events,
                dirty: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn config(&self) -> &PeerManagerConfig {
        &self.config
    }

    /// Load the persisted table, pruning stale entries. All loaded peers
    /// start disconnected.
    pub fn load(&self) -> Result<usize, P2pError> {
        let Some(path) = &self.config.storage_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read(path).map_err(|e| P2pError::Persistence(e.to_string()))?;
        let store: PeerStore =
            serde_json::from_slice(&raw).map_err(|e| P2pError::Persistence(e.to_string()))?;
        if store.version != STORE_VERSION {
            return Err(P2pError::Persistence(format!(
                "unsupported store version {}",
                store.version
            )));
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_stored_age)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let mut loaded = 0;
        let mut peers = self.peers.write();
        for mut peer in store.peers {
            let fresh = peer
                .last_seen
                .or(peer.disconnected_at)
                .map(|at| at > cutoff)
                .unwrap_or(false);
            if !fresh || peer.is_loopback() {
                continue;
            }
            peer.status = PeerStatus::Disconnected;
            peer.stats.reconnect_attempts = 0;
            peers.insert(peer.node_id.clone(), peer);
            loaded += 1;
        }
        info!(loaded, "peer table loaded");
        Ok(loaded)
    }

    /// Register a handshake-completed peer, enforcing direction quotas.
    pub fn register_connected(&self, info: &PeerInfo) -> Result<(), P2pError> {
        let mut peers = self.peers.write();
        let (inbound_connected, outbound_connected) = counts_of(&peers);
        let known = peers
            .get(&info.node_id)
            .map(|peer| peer.status == PeerStatus::Connected)
            .unwrap_or(false);
        if !known {
            if info.inbound && inbound_connected >= self.config.max_inbound {
                warn!(
                    peer = %info.node_id,
                    limit = self.config.max_inbound,
                    "refusing inbound peer, quota exhausted"
                );
                return Err(P2pError::QuotaExceeded {
                    inbound: true,
                    limit: self.config.max_inbound,
                });
            }
            if !info.inbound && outbound_connected >= self.config.max_outbound {
                warn!(
                    peer = %info.node_id,
                    limit = self.config.max_outbound,
                    "refusing outbound peer, quota exhausted"
                );
                return Err(P2pError::QuotaExceeded {
                    inbound: false,
                    limit: self.config.max_outbound,
                });
            }
        }

        let now = Utc::now();
        let entry = peers.entry(info.node_id.clone()).or_insert_with(|| Peer {
            node_id: info.node_id.clone(),
            address: info.address.clone(),
            port: info.port,
            status: PeerStatus::Connecting,
            inbound: info.inbound,
            capabilities: info.capabilities.clone(),
            last_seen: None,
            last_heartbeat: None,
            connected_at: None,
            disconnected_at: None,
            stats: PeerStats::default(),
        });
        entry.address = info.address.clone();
        entry.port = info.port;
        entry.inbound = info.inbound;
        entry.capabilities = info.capabilities.clone();
        entry.status = PeerStatus::Connected;
        entry.connected_at = Some(now);
        entry.last_seen = Some(now);
        entry.stats.successful_connections += 1;
        entry.stats.reconnect_attempts = 0;
        drop(peers);
        self.mark_dirty();
        debug!(peer = %info.node_id, inbound = info.inbound, "peer registered");
        Ok(())
    }

    /// Record a socket close. Statistics are preserved; the entry is never
    /// purged.
    pub fn mark_disconnected(&self, node_id: &str, reason: &str) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(node_id) {
            if peer.status != PeerStatus::Disconnected {
                peer.status = PeerStatus::Disconnected;
                peer.disconnected_at = Some(Utc::now());
                debug!(peer = %node_id, reason, "peer disconnected");
            }
        }
        drop(peers);
        self.mark_dirty();
    }

    pub fn record_heartbeat(&self, node_id: &str) {
        let now = Utc::now();
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(node_id) {
            peer.last_heartbeat = Some(now);
            peer.last_seen = Some(now);
        }
    }

    pub fn record_sent(&self, node_id: &str, bytes: usize) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(node_id) {
            peer.stats.messages_sent += 1;
            peer.stats.bytes_sent += bytes as u64;
        }
    }

    pub fn record_received(&self, node_id: &str, bytes: usize) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(node_id) {
            peer.stats.messages_received += 1;
            peer.stats.bytes_received += bytes as u64;
            peer.last_seen = Some(Utc::now());
        }
    }

    pub fn record_failed_connection(&self, node_id: &str) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(node_id) {
            peer.stats.failed_connections += 1;
        }
        drop(peers);
        self.mark_dirty();
    }

    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.status == PeerStatus::Connected)
            .cloned()
            .collect()
    }

    /// `(connected inbound, connected outbound)`.
    pub fn connection_counts(&self) -> (usize, usize) {
        counts_of(&self.peers.read())
    }

    /// Connected peers whose heartbeat is inside the timeout window.
    pub fn healthy_peers(&self) -> Vec<SmolStr> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.peers
            .read()
            .values()
            .filter(|peer| peer.status == PeerStatus::Connected)
            .filter(|peer| peer.liveness().map(|at| at > cutoff).unwrap_or(false))
            .map(|peer| peer.node_id.clone())
            .collect()
    }

    /// Top-K peers by reputation score for `peer_exchange` replies.
    pub fn peers_for_sharing(&self) -> Vec<PeerAddr> {
        let mut candidates: Vec<Peer> = self
            .peers
            .read()
            .values()
            .filter(|peer| !peer.is_loopback())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
            .into_iter()
            .take(self.config.max_shared_peers)
            .map(|peer| PeerAddr {
                node_id: peer.node_id,
                address: peer.address,
                port: peer.port,
                capabilities: peer.capabilities,
            })
            .collect()
    }

    /// One heartbeat pass: evict the silent, probe the rest.
    pub fn heartbeat_tick(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut evicted = Vec::new();
        let mut probes = Vec::new();
        {
            let mut peers = self.peers.write();
            for peer in peers.values_mut() {
                if peer.status != PeerStatus::Connected {
                    continue;
                }
                let alive = peer.liveness().map(|at| at > cutoff).unwrap_or(false);
                if alive {
                    probes.push(peer.node_id.clone());
                } else {
                    peer.status = PeerStatus::Disconnected;
                    peer.disconnected_at = Some(Utc::now());
                    evicted.push(peer.node_id.clone());
                }
            }
        }
        for peer in evicted {
            warn!(peer = %peer, "peer evicted: heartbeat timeout");
            let _ = self.events.send(PeerEvent::Evicted {
                peer,
                reason: "heartbeat_timeout".into(),
            });
            self.mark_dirty();
        }
        for peer in probes {
            let _ = self.events.send(PeerEvent::HeartbeatNeeded(peer));
        }
    }

    /// One reconnect pass: request dials for disconnected peers whose
    /// backoff has elapsed.
    pub fn reconnect_tick(&self) {
        let now = Utc::now();
        let mut requests = Vec::new();
        {
            let mut peers = self.peers.write();
            for peer in peers.values_mut() {
                if peer.status != PeerStatus::Disconnected {
                    continue;
                }
                if peer.stats.reconnect_attempts >= self.config.max_reconnect_attempts {
                    continue;
                }
                let backoff = self.backoff_for(peer.stats.reconnect_attempts);
                let due = peer
                    .disconnected_at
                    .map(|at| {
                        now.signed_duration_since(at)
                            >= chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60))
                    })
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                peer.stats.reconnect_attempts += 1;
                peer.status = PeerStatus::Connecting;
                requests.push(PeerEvent::ReconnectRequested {
                    peer: peer.node_id.clone(),
                    address: peer.address.clone(),
                    port: peer.port,
                });
            }
        }
        for request in requests {
            let _ = self.events.send(request);
        }
    }

    /// Mark a requested reconnect as failed, returning the peer to the
    /// disconnected pool for the next backoff round.
    pub fn reconnect_failed(&self, node_id: &str) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(node_id) {
            if peer.status == PeerStatus::Connecting {
                peer.status = PeerStatus::Disconnected;
                peer.disconnected_at = Some(Utc::now());
            }
            peer.stats.failed_connections += 1;
        }
        drop(peers);
        self.mark_dirty();
    }

    fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = self
            .config
            .reconnect_backoff_multiplier
            .max(1)
            .saturating_pow(attempts);
        self.config
            .reconnect_backoff_base
            .saturating_mul(factor)
            .min(self.config.max_reconnect_backoff)
    }

    /// Spawn the heartbeat, reconnect and persistence loops.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            // Spread nodes started together across the interval.
            let offset = rand::random_range(0..manager.config.heartbeat_interval.as_millis().max(1) as u64);
            tokio::time::sleep(Duration::from_millis(offset)).await;
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                manager.heartbeat_tick();
            }
        }));

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reconnect_delay);
            loop {
                ticker.tick().await;
                manager.reconnect_tick();
            }
        }));

        if self.config.storage_path.is_some() {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.config.persist_interval);
                loop {
                    ticker.tick().await;
                    if manager.dirty.swap(false, AtomicOrdering::AcqRel) {
                        if let Err(error) = manager.persist_now() {
                            warn!(%error, "peer table save failed");
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Write the table to the opaque blob: temp file, then atomic rename.
    /// Loopback peers are excluded.
    pub fn persist_now(&self) -> Result<(), P2pError> {
        let Some(path) = &self.config.storage_path else {
            return Ok(());
        };
        let store = PeerStore {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            peers: self
                .peers
                .read()
                .values()
                .filter(|peer| !peer.is_loopback())
                .cloned()
                .collect(),
        };
        let blob = serde_json::to_vec_pretty(&store)
            .map_err(|e| P2pError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &blob).map_err(|e| P2pError::Persistence(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| P2pError::Persistence(e.to_string()))?;
        debug!(peers = store.peers.len(), "peer table saved");
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, AtomicOrdering::Release);
    }
}

fn counts_of(peers: &FnvHashMap<SmolStr, Peer>) -> (usize, usize) {
    let mut inbound = 0;
    let mut outbound = 0;
    for peer in peers.values() {
        if peer.status == PeerStatus::Connected {
            if peer.inbound {
                inbound += 1;
            } else {
                outbound += 1;
            }
        }
    }
    (inbound, outbound)
}

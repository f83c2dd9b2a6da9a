//! Multi-source peer discovery (bootstrap, LAN multicast, peer exchange).
//!
//! Discovery only *finds* peers: it emits [`DiscoveryEvent`]s and the node
//! decides whether to dial. Sources are a fixed bootstrap list, a UDP
//! multicast announce/listen loop on the local network, and a periodic
//! prompt to run the `peer_exchange` protocol over established
//! connections (the TCP itself belongs to the connection service).

use crate::{error::P2pError, protocol::PeerAddr};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// Where a discovered peer came from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Bootstrap,
    Lan,
    PeerExchange,
}

/// A candidate endpoint worth dialing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveredPeer {
    /// Known for LAN and peer-exchange finds; bootstrap entries are
    /// anonymous until the handshake.
    pub node_id: Option<SmolStr>,
    pub address: String,
    pub port: u16,
    pub source: DiscoverySource,
}

/// Emitted to the node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiscoveryEvent {
    Peer(DiscoveredPeer),
    /// Time to ask established peers for their peer lists.
    PeerExchangeDue,
}

/// LAN announce payload.
#[derive(Debug, Serialize, Deserialize)]
struct LanAnnounce {
    node_id: SmolStr,
    port: u16,
}

/// Discovery tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// `host:port` seeds dialed at startup.
    pub bootstrap_peers: Vec<String>,
    pub enable_lan: bool,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub announce_interval: Duration,
    pub enable_peer_exchange: bool,
    pub exchange_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: vec![],
            enable_lan: true,
            multicast_group: Ipv4Addr::new(239, 255, 42, 99),
            multicast_port: 45999,
            announce_interval: Duration::from_secs(30),
            enable_peer_exchange: true,
            exchange_interval: Duration::from_secs(60),
        }
    }
}

/// Multi-source peer discovery. Performs no TCP.
#[derive(Debug)]
pub struct PeerDiscovery {
    node_id: SmolStr,
    /// Our TCP listener port, announced on the LAN.
    listen_port: u16,
    config: DiscoveryConfig,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl PeerDiscovery {
    pub fn new(
        node_id: impl Into<SmolStr>,
        listen_port: u16,
        config: DiscoveryConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                node_id: node_id.into(),
                listen_port,
                config,
                events,
            }),
            rx,
        )
    }

    /// Emit every configured bootstrap endpoint.
    pub fn emit_bootstrap(&self) {
        for seed in &self.config.bootstrap_peers {
            match parse_host_port(seed) {
                Some((address, port)) => {
                    let _ = self.events.send(DiscoveryEvent::Peer(DiscoveredPeer {
                        node_id: None,
                        address,
                        port,
                        source: DiscoverySource::Bootstrap,
                    }));
                }
                None => warn!(seed = %seed, "ignoring malformed bootstrap peer"),
            }
        }
    }

    /// Feed a `peer_exchange` reply back through discovery.
    pub fn handle_peer_exchange(&self, peers: &[PeerAddr]) {
        for peer in peers {
            if peer.node_id == self.node_id {
                continue;
            }
            let _ = self.events.send(DiscoveryEvent::Peer(DiscoveredPeer {
                node_id: Some(peer.node_id.clone()),
                address: peer.address.clone(),
                port: peer.port,
                source: DiscoverySource::PeerExchange,
            }));
        }
    }

    /// Spawn the enabled background loops: LAN announce, LAN listen, and
    /// the peer-exchange scheduler.
    pub async fn spawn(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, P2pError> {
        let mut handles = Vec::new();

        if self.config.enable_lan {
            handles.push(self.spawn_lan_announce().await?);
            handles.push(self.spawn_lan_listen().await?);
        }
        if self.config.enable_peer_exchange {
            let discovery = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(discovery.config.exchange_interval);
                // The first tick fires immediately; peers are unlikely yet.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let _ = discovery.events.send(DiscoveryEvent::PeerExchangeDue);
                }
            }));
        }
        Ok(handles)
    }

    async fn spawn_lan_announce(self: &Arc<Self>) -> Result<JoinHandle<()>, P2pError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let discovery = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let target = (
                discovery.config.multicast_group,
                discovery.config.multicast_port,
            );
            let announce = LanAnnounce {
                node_id: discovery.node_id.clone(),
                port: discovery.listen_port,
            };
            let payload = match serde_json::to_vec(&announce) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%error, "lan announce payload failed to encode");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(discovery.config.announce_interval);
            loop {
                ticker.tick().await;
                if let Err(error) = socket.send_to(&payload, target).await {
                    debug!(%error, "lan announce failed");
                }
            }
        }))
    }

    async fn spawn_lan_listen(self: &Arc<Self>) -> Result<JoinHandle<()>, P2pError> {
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.multicast_port)).await?;
        socket.join_multicast_v4(self.config.multicast_group, Ipv4Addr::UNSPECIFIED)?;
        info!(
            group = %self.config.multicast_group,
            port = self.config.multicast_port,
            "lan discovery listening"
        );

        let discovery = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    continue;
                };
                let Ok(announce) = serde_json::from_slice::<LanAnnounce>(&buf[..n]) else {
                    debug!(%from, "ignoring malformed lan announce");
                    continue;
                };
                if announce.node_id == discovery.node_id {
                    continue;
                }
                let _ = discovery.events.send(DiscoveryEvent::Peer(DiscoveredPeer {
                    node_id: Some(announce.node_id),
                    address: from.ip().to_string(),
                    port: announce.port,
                    source: DiscoverySource::Lan,
                }));
            }
        }))
    }
}

fn parse_host_port(seed: &str) -> Option<(String, u16)> {
    let (host, port) = seed.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

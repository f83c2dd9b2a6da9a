//! TCP listener/dialer with per-connection handshake lifecycle.
//!
//! Per-connection state machine: `Dialing → Handshaking → Established →
//! Closing`. Both sides send `handshake` within the handshake timeout; the
//! inbound side answers with its own `handshake`, the outbound side with
//! `handshake_ack`. Version mismatches are answered with a protocol error
//! and closed; self-connections are dropped silently.
//!
//! Established sockets are owned here and nowhere else: one reader task
//! feeding the frame decoder, one writer task draining a per-peer outbox.
//! Heartbeats are answered in place and `disconnect` frames are routed
//! internally; every other frame is delivered to the node as a
//! [`ConnectionEvent::Message`].

use crate::{
    breaker::CircuitBreaker,
    error::P2pError,
    framing::{encode_frame, FrameDecoder},
    protocol::{Message, PROTOCOL_VERSION},
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Connection service tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Listener bind host.
    pub host: String,
    /// Listener port, also advertised in our handshake.
    pub port: u16,
    pub handshake_timeout: Duration,
    /// Per-frame write deadline on established sockets.
    pub message_timeout: Duration,
    pub capabilities: Vec<String>,
    /// Per-peer outbox depth; a full outbox fails the send.
    pub outbox_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4100,
            handshake_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
            capabilities: vec![],
            outbox_depth: 64,
        }
    }
}

/// Identity learned from a completed handshake.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerInfo {
    pub node_id: SmolStr,
    pub address: String,
    /// The peer's listener port as announced in its handshake.
    pub port: u16,
    pub inbound: bool,
    pub capabilities: Vec<String>,
}

/// Delivered to the node layer.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    PeerConnected(PeerInfo),
    Message {
        peer: SmolStr,
        message: Message,
        bytes: usize,
    },
    PeerDisconnected {
        peer: SmolStr,
        reason: String,
    },
}

/// TCP transport service. Sockets live exclusively here; everyone else
/// holds peer ids.
#[derive(Debug)]
pub struct DirectConnectionService {
    node_id: SmolStr,
    config: ConnectionConfig,
    /// The port peers should dial back; resolved at bind time when the
    /// configured port is 0.
    advertised_port: AtomicU16,
    writers: RwLock<FnvHashMap<SmolStr, mpsc::Sender<Message>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    breaker: Arc<CircuitBreaker>,
}

impl DirectConnectionService {
    pub fn new(
        node_id: impl Into<SmolStr>,
        config: ConnectionConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let advertised_port = AtomicU16::new(config.port);
        (
            Arc::new(Self {
                node_id: node_id.into(),
                config,
                advertised_port,
                writers: RwLock::new(FnvHashMap::default()),
                events,
                breaker,
            }),
            rx,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bind the listener and spawn the accept loop. A bind failure is
    /// fatal to startup and is returned to the caller.
    pub async fn listen(self: &Arc<Self>) -> Result<(SocketAddr, JoinHandle<()>), P2pError> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let local = listener.local_addr()?;
        self.advertised_port
            .store(local.port(), AtomicOrdering::Release);
        info!(%local, "p2p listener bound");

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            if let Err(error) = service.handle_inbound(stream, remote).await {
                                debug!(%remote, %error, "inbound connection rejected");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                }
            }
        });
        Ok((local, handle))
    }

    /// Dial a peer and run the outbound handshake, guarded by the circuit
    /// breaker. Resolves to the remote node id once established.
    pub async fn dial(self: &Arc<Self>, address: &str, port: u16) -> Result<SmolStr, P2pError> {
        let service = Arc::clone(self);
        let address = address.to_string();
        self.breaker
            .call(async move { service.dial_inner(address, port).await })
            .await
    }

    async fn dial_inner(self: Arc<Self>, address: String, port: u16) -> Result<SmolStr, P2pError> {
        let mut stream = timeout(
            self.config.handshake_timeout,
            TcpStream::connect((address.as_str(), port)),
        )
        .await
        .map_err(|_| P2pError::HandshakeTimeout)??;

        // Outbound: handshake, await theirs, ack.
        self.write_direct(&mut stream, &self.our_handshake()).await?;
        let mut decoder = FrameDecoder::new();
        let first = self.read_one(&mut stream, &mut decoder).await?;
        let Message::Handshake {
            node_id,
            version,
            port: peer_port,
            capabilities,
            ..
        } = first
        else {
            return Err(P2pError::Invalid("expected handshake".into()));
        };
        self.verify_remote(&mut stream, &node_id, &version).await?;
        self.write_direct(
            &mut stream,
            &Message::HandshakeAck {
                node_id: self.node_id.clone(),
                timestamp: Message::now_ms(),
            },
        )
        .await?;

        let info = PeerInfo {
            node_id: node_id.clone(),
            address,
            port: peer_port,
            inbound: false,
            capabilities,
        };
        self.establish(stream, decoder, info);
        Ok(node_id)
    }

    async fn handle_inbound(
        self: Arc<Self>,
        mut stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<(), P2pError> {
        let mut decoder = FrameDecoder::new();
        let first = self.read_one(&mut stream, &mut decoder).await?;
        let Message::Handshake {
            node_id,
            version,
            port: peer_port,
            capabilities,
            ..
        } = first
        else {
            return Err(P2pError::Invalid("expected handshake".into()));
        };
        self.verify_remote(&mut stream, &node_id, &version).await?;

        // Inbound side answers with its own handshake.
        self.write_direct(&mut stream, &self.our_handshake()).await?;

        let info = PeerInfo {
            node_id,
            address: remote.ip().to_string(),
            port: peer_port,
            inbound: true,
            capabilities,
        };
        self.establish(stream, decoder, info);
        Ok(())
    }

    /// Version and self-connection checks shared by both directions.
    async fn verify_remote(
        &self,
        stream: &mut TcpStream,
        node_id: &SmolStr,
        version: &str,
    ) -> Result<(), P2pError> {
        if version != PROTOCOL_VERSION {
            let reply = Message::Error {
                node_id: self.node_id.clone(),
                timestamp: Message::now_ms(),
                code: "PROTOCOL_VERSION_MISMATCH".into(),
                message: format!("expected {PROTOCOL_VERSION}"),
            };
            let _ = self.write_direct(stream, &reply).await;
            return Err(P2pError::VersionMismatch {
                ours: PROTOCOL_VERSION.into(),
                theirs: version.into(),
            });
        }
        if node_id == &self.node_id {
            // Silent drop, no error frame.
            return Err(P2pError::SelfConnection);
        }
        Ok(())
    }

    /// Promote a handshaken socket: register the outbox, emit
    /// `PeerConnected`, spawn the reader and writer tasks.
    fn establish(self: &Arc<Self>, stream: TcpStream, decoder: FrameDecoder, info: PeerInfo) {
        let peer = info.node_id.clone();
        let (read_half, write_half) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::channel(self.config.outbox_depth.max(1));

        // Last connection wins: replacing the entry drops the previous
        // outbox sender and its writer task closes the old socket.
        self.writers.write().insert(peer.clone(), outbox.clone());
        let _ = self.events.send(ConnectionEvent::PeerConnected(info));
        info!(peer = %peer, "peer connection established");

        let service = Arc::clone(self);
        let writer_peer = peer.clone();
        let writer_outbox = outbox.clone();
        tokio::spawn(async move {
            service
                .run_writer(writer_peer, writer_outbox, outbox_rx, write_half)
                .await;
        });

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_reader(peer, outbox, read_half, decoder).await;
        });
    }

    async fn run_writer(
        self: Arc<Self>,
        peer: SmolStr,
        own_outbox: mpsc::Sender<Message>,
        mut outbox_rx: mpsc::Receiver<Message>,
        mut write_half: OwnedWriteHalf,
    ) {
        while let Some(message) = outbox_rx.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(peer = %peer, %error, "dropping unencodable message");
                    continue;
                }
            };
            let write = timeout(self.config.message_timeout, write_half.write_all(&frame)).await;
            match write {
                Ok(Ok(())) => self.breaker.record_success(),
                Ok(Err(error)) => {
                    self.breaker.record_failure();
                    self.drop_connection(&peer, &own_outbox, &format!("write failed: {error}"));
                    break;
                }
                Err(_) => {
                    self.breaker.record_failure();
                    self.drop_connection(&peer, &own_outbox, "write timed out");
                    break;
                }
            }
        }
        let _ = write_half.shutdown().await;
    }

    async fn run_reader(
        self: Arc<Self>,
        peer: SmolStr,
        outbox: mpsc::Sender<Message>,
        mut read_half: OwnedReadHalf,
        mut decoder: FrameDecoder,
    ) {
        let mut buf = [0u8; READ_CHUNK];
        'conn: loop {
            // Frames may already be buffered from the handshake read.
            loop {
                match decoder.next_frame() {
                    Ok(Some(message)) => {
                        if !self.route_frame(&peer, &outbox, message) {
                            break 'conn;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        self.drop_connection(&peer, &outbox, &format!("protocol: {error}"));
                        return;
                    }
                }
            }
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    self.drop_connection(&peer, &outbox, "connection closed by peer");
                    return;
                }
                Ok(n) => decoder.extend(&buf[..n]),
                Err(error) => {
                    self.drop_connection(&peer, &outbox, &format!("read failed: {error}"));
                    return;
                }
            }
        }
    }

    /// Handle one established-state frame. Returns `false` to close.
    fn route_frame(&self, peer: &SmolStr, outbox: &mpsc::Sender<Message>, message: Message) -> bool {
        match message {
            Message::Heartbeat { .. } => {
                let ack = Message::HeartbeatAck {
                    node_id: self.node_id.clone(),
                    timestamp: Message::now_ms(),
                };
                if outbox.try_send(ack).is_err() {
                    debug!(peer = %peer, "heartbeat ack dropped, outbox full");
                }
                true
            }
            Message::Disconnect { reason, .. } => {
                self.drop_connection(peer, outbox, &reason);
                false
            }
            Message::Handshake { .. } => {
                self.drop_connection(peer, outbox, "unexpected handshake");
                false
            }
            other => {
                let bytes = serde_json::to_vec(&other).map(|b| b.len()).unwrap_or(0);
                let _ = self.events.send(ConnectionEvent::Message {
                    peer: peer.clone(),
                    message: other,
                    bytes,
                });
                true
            }
        }
    }

    /// Queue a message for an established peer.
    pub fn send(&self, peer: &str, message: Message) -> Result<(), P2pError> {
        self.breaker.preflight()?;
        let outbox = self
            .writers
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| P2pError::NotConnected(SmolStr::new(peer)))?;
        outbox.try_send(message).map_err(|_| P2pError::WriteFailed {
            peer: SmolStr::new(peer),
            reason: "outbox full".into(),
        })
    }

    /// Fan a message out to every established peer. Per-peer outcomes are
    /// reported, never propagated; with zero peers this returns an empty
    /// set promptly.
    pub fn broadcast(&self, message: &Message) -> Vec<(SmolStr, Result<(), P2pError>)> {
        let targets: Vec<SmolStr> = self.writers.read().keys().cloned().collect();
        targets
            .into_iter()
            .map(|peer| {
                let outcome = self.send(&peer, message.clone());
                (peer, outcome)
            })
            .collect()
    }

    /// Gracefully close one connection.
    pub fn disconnect(&self, peer: &str, reason: &str) {
        let farewell = Message::Disconnect {
            node_id: self.node_id.clone(),
            timestamp: Message::now_ms(),
            reason: reason.to_string(),
        };
        let _ = self.send(peer, farewell);
        let removed = self.writers.write().remove(peer);
        if removed.is_some() {
            let _ = self.events.send(ConnectionEvent::PeerDisconnected {
                peer: SmolStr::new(peer),
                reason: reason.to_string(),
            });
        }
    }

    /// Close every connection, announcing the reason.
    pub fn shutdown(&self, reason: &str) {
        let peers: Vec<SmolStr> = self.writers.read().keys().cloned().collect();
        for peer in peers {
            self.disconnect(&peer, reason);
        }
    }

    pub fn connected_peers(&self) -> Vec<SmolStr> {
        self.writers.read().keys().cloned().collect()
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.writers.read().contains_key(peer)
    }

    /// Remove the connection iff `outbox` still owns the slot, emitting a
    /// single `PeerDisconnected`.
    fn drop_connection(&self, peer: &SmolStr, outbox: &mpsc::Sender<Message>, reason: &str) {
        let mut writers = self.writers.write();
        let owned = writers
            .get(peer)
            .map(|current| current.same_channel(outbox))
            .unwrap_or(false);
        if owned {
            writers.remove(peer);
            drop(writers);
            debug!(peer = %peer, reason, "connection dropped");
            let _ = self.events.send(ConnectionEvent::PeerDisconnected {
                peer: peer.clone(),
                reason: reason.to_string(),
            });
        }
    }

    fn our_handshake(&self) -> Message {
        Message::Handshake {
            node_id: self.node_id.clone(),
            timestamp: Message::now_ms(),
            version: PROTOCOL_VERSION.to_string(),
            port: self.advertised_port.load(AtomicOrdering::Acquire),
            capabilities: self.config.capabilities.clone(),
        }
    }

    async fn write_direct(&self, stream: &mut TcpStream, message: &Message) -> Result<(), P2pError> {
        let frame = encode_frame(message)?;
        timeout(self.config.handshake_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| P2pError::HandshakeTimeout)?
            .map_err(P2pError::from)
    }

    /// Read exactly one frame during the handshake phase.
    async fn read_one(
        &self,
        stream: &mut TcpStream,
        decoder: &mut FrameDecoder,
    ) -> Result<Message, P2pError> {
        let mut buf = [0u8; READ_CHUNK];
        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        loop {
            if let Some(message) = decoder.next_frame()? {
                return Ok(message);
            }
            let read = tokio::time::timeout_at(deadline, stream.read(&mut buf))
                .await
                .map_err(|_| P2pError::HandshakeTimeout)?;
            match read? {
                0 => return Err(P2pError::Io("connection closed during handshake".into())),
                n => decoder.extend(&buf[..n]),
            }
        }
    }
}

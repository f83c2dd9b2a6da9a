#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # P2P - Meshbook Peer Transport
//!
//! Everything between two Meshbook nodes: the length-prefixed JSON wire
//! protocol, the TCP connection service with its handshake, the canonical
//! peer table with heartbeat and reconnect loops, the deduplicating
//! broadcast router, multi-source peer discovery, and the circuit breaker
//! isolating outbound network failures.
//!
//! ## Data Flow
//!
//! ```text
//! listener / dialer
//!        ↓ handshake
//! Direct Connection Service ──events──▶ Node
//!        ▲                               │
//!        └── Message Router ◀── broadcast┘
//!              │  fingerprint dedup + retry queue
//! Peer Manager ┴─ heartbeat / reconnect / persistence
//! ```
//!
//! Components communicate over typed mpsc channels, one consumer each;
//! sockets live exclusively inside the connection service and the peer
//! table exclusively inside the peer manager.

/// Circuit breaker guarding outbound network operations.
pub mod breaker;

/// TCP listener/dialer with per-connection handshake lifecycle.
pub mod connection;

/// Multi-source peer discovery (bootstrap, LAN multicast, peer exchange).
pub mod discovery;

/// Defines all possible errors in the p2p crate.
pub mod error;

/// Length-prefixed streaming frame codec.
pub mod framing;

/// Canonical peer table, heartbeat/reconnect loops and persistence.
pub mod peer;

/// Wire message variants and validation.
pub mod protocol;

/// Deduplicating broadcast router with bounded retry queue.
pub mod router;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use connection::{ConnectionConfig, ConnectionEvent, DirectConnectionService, PeerInfo};
pub use discovery::{
    DiscoveredPeer, DiscoveryConfig, DiscoveryEvent, DiscoverySource, PeerDiscovery,
};
pub use error::P2pError;
pub use framing::{encode_frame, FrameDecoder};
pub use peer::{Peer, PeerEvent, PeerManager, PeerManagerConfig, PeerStats, PeerStatus};
pub use protocol::{Message, PeerAddr, PeerId, MAX_FRAME_BYTES, PROTOCOL_VERSION};
pub use router::{BroadcastOutcome, MessageRouter, RouterConfig};

//! Wire message variants and validation.
//!
//! Every frame body is a UTF-8 JSON object tagged by `type`, always
//! carrying the sender's `node_id` and a millisecond `timestamp`.
//! Validation is structural (required fields, well-typed values) plus
//! range checks; a message that fails validation closes the connection it
//! arrived on.

use crate::error::P2pError;
use meshbook_matching::{clock::StampedClock, Order, OrderId, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Protocol version, compared bit-for-bit during the handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum frame body size.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Maximum peers in a single `peer_exchange` reply.
pub const MAX_PEERS_PER_EXCHANGE: usize = 20;

/// Maximum node id length on the wire.
pub const MAX_NODE_ID_BYTES: usize = 128;

/// Lowest acceptable listener port.
pub const MIN_PORT: u16 = 1000;

/// Node identifier as carried on the wire (a UUID string per instance).
pub type PeerId = SmolStr;

/// A shareable peer endpoint, as exchanged via `peer_exchange`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub node_id: PeerId,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// All wire message variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame on every new connection, both directions.
    Handshake {
        node_id: PeerId,
        timestamp: i64,
        version: String,
        port: u16,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    HandshakeAck {
        node_id: PeerId,
        timestamp: i64,
    },
    Heartbeat {
        node_id: PeerId,
        timestamp: i64,
    },
    HeartbeatAck {
        node_id: PeerId,
        timestamp: i64,
    },
    PeerExchangeRequest {
        node_id: PeerId,
        timestamp: i64,
    },
    PeerExchange {
        node_id: PeerId,
        timestamp: i64,
        peers: Vec<PeerAddr>,
    },
    /// A propagated order, carrying its origin vector-clock stamp.
    Order {
        node_id: PeerId,
        timestamp: i64,
        order: Order,
        clock: StampedClock,
    },
    /// A propagated executed trade.
    Trade {
        node_id: PeerId,
        timestamp: i64,
        trade: Trade,
        clock: StampedClock,
    },
    CancelOrder {
        node_id: PeerId,
        timestamp: i64,
        order_id: OrderId,
    },
    /// Graceful close.
    Disconnect {
        node_id: PeerId,
        timestamp: i64,
        reason: String,
    },
    /// Protocol-level error report.
    Error {
        node_id: PeerId,
        timestamp: i64,
        code: String,
        message: String,
    },
}

impl Message {
    pub fn node_id(&self) -> &PeerId {
        match self {
            Message::Handshake { node_id, .. }
            | Message::HandshakeAck { node_id, .. }
            | Message::Heartbeat { node_id, .. }
            | Message::HeartbeatAck { node_id, .. }
            | Message::PeerExchangeRequest { node_id, .. }
            | Message::PeerExchange { node_id, .. }
            | Message::Order { node_id, .. }
            | Message::Trade { node_id, .. }
            | Message::CancelOrder { node_id, .. }
            | Message::Disconnect { node_id, .. }
            | Message::Error { node_id, .. } => node_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Message::Handshake { timestamp, .. }
            | Message::HandshakeAck { timestamp, .. }
            | Message::Heartbeat { timestamp, .. }
            | Message::HeartbeatAck { timestamp, .. }
            | Message::PeerExchangeRequest { timestamp, .. }
            | Message::PeerExchange { timestamp, .. }
            | Message::Order { timestamp, .. }
            | Message::Trade { timestamp, .. }
            | Message::CancelOrder { timestamp, .. }
            | Message::Disconnect { timestamp, .. }
            | Message::Error { timestamp, .. } => *timestamp,
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::HandshakeAck { .. } => "handshake_ack",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck { .. } => "heartbeat_ack",
            Message::PeerExchangeRequest { .. } => "peer_exchange_request",
            Message::PeerExchange { .. } => "peer_exchange",
            Message::Order { .. } => "order",
            Message::Trade { .. } => "trade",
            Message::CancelOrder { .. } => "cancel_order",
            Message::Disconnect { .. } => "disconnect",
            Message::Error { .. } => "error",
        }
    }

    /// Milliseconds since the epoch, the wire timestamp convention.
    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Structural, range and message-specific validation.
    pub fn validate(&self) -> Result<(), P2pError> {
        let node_id = self.node_id();
        if node_id.is_empty() || node_id.len() > MAX_NODE_ID_BYTES {
            return Err(P2pError::Invalid(format!(
                "node id length {} outside 1..={MAX_NODE_ID_BYTES}",
                node_id.len()
            )));
        }
        if self.timestamp() <= 0 {
            return Err(P2pError::Invalid("non-positive timestamp".into()));
        }
        match self {
            Message::Handshake { version, port, .. } => {
                if version.is_empty() {
                    return Err(P2pError::Invalid("empty handshake version".into()));
                }
                validate_port(*port)?;
            }
            Message::PeerExchange { peers, .. } => {
                if peers.len() > MAX_PEERS_PER_EXCHANGE {
                    return Err(P2pError::Invalid(format!(
                        "peer exchange carries {} peers, cap is {MAX_PEERS_PER_EXCHANGE}",
                        peers.len()
                    )));
                }
                for peer in peers {
                    if peer.node_id.is_empty() || peer.node_id.len() > MAX_NODE_ID_BYTES {
                        return Err(P2pError::Invalid("peer entry with bad node id".into()));
                    }
                    if peer.address.is_empty() {
                        return Err(P2pError::Invalid("peer entry with empty address".into()));
                    }
                    validate_port(peer.port)?;
                }
            }
            Message::Order { order, .. } => {
                if order.amount <= Decimal::ZERO || order.price <= Decimal::ZERO {
                    return Err(P2pError::Invalid(
                        "order with non-positive amount or price".into(),
                    ));
                }
                if order.user.is_empty() {
                    return Err(P2pError::Invalid("order with empty user id".into()));
                }
            }
            Message::Trade { trade, .. } => {
                if trade.amount <= Decimal::ZERO || trade.price <= Decimal::ZERO {
                    return Err(P2pError::Invalid(
                        "trade with non-positive amount or price".into(),
                    ));
                }
            }
            Message::Disconnect { reason, .. } => {
                if reason.is_empty() {
                    return Err(P2pError::Invalid("disconnect without a reason".into()));
                }
            }
            Message::Error { code, .. } => {
                if code.is_empty() {
                    return Err(P2pError::Invalid("error message without a code".into()));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn validate_port(port: u16) -> Result<(), P2pError> {
    if port < MIN_PORT {
        return Err(P2pError::Invalid(format!(
            "port {port} below minimum {MIN_PORT}"
        )));
    }
    Ok(())
}

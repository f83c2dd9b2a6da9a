//! Defines all possible errors in the p2p crate.

use smol_str::SmolStr;
use thiserror::Error;

/// Errors surfaced by the peer transport.
///
/// Protocol errors close the offending connection and never kill the node;
/// network errors are transient and feed the router's retry queue.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum P2pError {
    /// Frame body exceeds the wire cap
    #[error("message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame body is not a well-formed message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Structurally sound message failed validation
    #[error("invalid message: {0}")]
    Invalid(String),

    /// Handshake carried a different protocol version
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },

    /// The remote end presented our own node id
    #[error("self connection dropped")]
    SelfConnection,

    /// The remote end did not complete the handshake in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// No established connection for the target peer
    #[error("peer not connected: {0}")]
    NotConnected(SmolStr),

    /// An established socket refused the write
    #[error("write to {peer} failed: {reason}")]
    WriteFailed { peer: SmolStr, reason: String },

    /// Short-circuited by an open circuit breaker
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(SmolStr),

    /// Inbound or outbound connection quota exhausted
    #[error("connection quota exhausted (inbound={inbound}, limit={limit})")]
    QuotaExceeded { inbound: bool, limit: usize },

    /// Socket-level failure
    #[error("io: {0}")]
    Io(String),

    /// Peer table blob could not be read or written
    #[error("peer persistence: {0}")]
    Persistence(String),

    /// A component's channel consumer has gone away
    #[error("channel closed")]
    ChannelClosed,
}

impl From<std::io::Error> for P2pError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(value: serde_json::Error) -> Self {
        Self::Malformed(value.to_string())
    }
}

impl P2pError {
    /// Whether the failure is transient and worth a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            P2pError::NotConnected(_)
                | P2pError::WriteFailed { .. }
                | P2pError::Io(_)
                | P2pError::HandshakeTimeout
        )
    }
}

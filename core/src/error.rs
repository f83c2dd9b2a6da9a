//! # Core Error Types
//!
//! The node-level error type aggregating failures from the matching and
//! transport subsystems into one taxonomy. Every error carries a
//! correlation id, a severity, a retryable flag and a structured context
//! map, so operators can chase one order placement across log lines.

use meshbook_markets::MarketError;
use meshbook_matching::BookError;
use meshbook_p2p::P2pError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Failure classes and how callers should react.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; never retried
    Validation,
    /// The book is mid-operation; the caller may retry
    Busy,
    /// Caller exceeded a rate cap and should back off
    RateLimited,
    /// Transient transport failure; retryable
    Network,
    /// Version mismatch or malformed frame; closes the offending
    /// connection, never the node
    Protocol,
    /// Short-circuited by the circuit breaker; not retried within the
    /// reset window
    CircuitOpen,
    /// A queue or buffer cap was hit
    Overload,
    /// Configuration or listener-bind failure; aborts startup
    Fatal,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

/// Central error type for the Meshbook node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message} (correlation {correlation_id})")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Uuid,
    pub severity: Severity,
    pub retryable: bool,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let (severity, retryable) = match kind {
            ErrorKind::Validation => (Severity::Warning, false),
            ErrorKind::Busy => (Severity::Info, true),
            ErrorKind::RateLimited => (Severity::Warning, true),
            ErrorKind::Network => (Severity::Warning, true),
            ErrorKind::Protocol => (Severity::Error, false),
            ErrorKind::CircuitOpen => (Severity::Warning, false),
            ErrorKind::Overload => (Severity::Error, true),
            ErrorKind::Fatal => (Severity::Critical, false),
        };
        Self {
            kind,
            message: message.into(),
            correlation_id: Uuid::new_v4(),
            severity,
            retryable,
            context: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn rate_limited(user: &str, category: &str) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            format!("rate limit exceeded for {category}"),
        )
        .with_context("user", user)
        .with_context("category", category)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl From<MarketError> for NodeError {
    fn from(value: MarketError) -> Self {
        Self::new(ErrorKind::Validation, value.to_string())
    }
}

impl From<BookError> for NodeError {
    fn from(value: BookError) -> Self {
        let kind = match &value {
            BookError::Market(_) | BookError::PairMismatch { .. } => ErrorKind::Validation,
            BookError::Busy => ErrorKind::Busy,
            BookError::QueueFull { .. } => ErrorKind::Overload,
            BookError::QueueClosed => ErrorKind::Fatal,
        };
        Self::new(kind, value.to_string())
    }
}

impl From<P2pError> for NodeError {
    fn from(value: P2pError) -> Self {
        let kind = match &value {
            P2pError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            P2pError::MessageTooLarge { .. }
            | P2pError::Malformed(_)
            | P2pError::Invalid(_)
            | P2pError::VersionMismatch { .. }
            | P2pError::SelfConnection => ErrorKind::Protocol,
            P2pError::QuotaExceeded { .. } => ErrorKind::Overload,
            P2pError::Persistence(_) => ErrorKind::Fatal,
            _ => ErrorKind::Network,
        };
        Self::new(kind, value.to_string())
    }
}

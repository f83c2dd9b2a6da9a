//! Defines all possible errors in the matching crate.

use meshbook_markets::{MarketError, Pair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the matching engine and its event queue.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
#[serde(bound(deserialize = "'de: 'static"))]
pub enum BookError {
    /// Input failed market validation; never retried
    #[error("validation: {0}")]
    Market(#[from] MarketError),

    /// The order targets a pair this book is not bound to
    #[error("pair mismatch: book is bound to {expected}, order is for {got}")]
    PairMismatch { expected: Pair, got: Pair },

    /// The book is mid-operation; the caller may retry
    #[error("order book is busy processing another operation")]
    Busy,

    /// The event queue's pending buffer is at capacity
    #[error("event queue full ({capacity} pending events)")]
    QueueFull { capacity: usize },

    /// The event queue worker has shut down
    #[error("event queue closed")]
    QueueClosed,
}

impl BookError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookError::Busy | BookError::QueueFull { .. })
    }
}

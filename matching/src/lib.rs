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

//! # Matching - Meshbook Matching Engine
//!
//! The local half of the distributed exchange: a price-time priority limit
//! order book over exact decimal prices, fed by a causal event queue.
//!
//! ## Processing Flow
//!
//! ```text
//! place / replay
//!       ↓
//!  Event Queue  (vector-clock ordered, deduplicated)
//!       ↓
//!  Order Book   (price-time priority matching)
//!       ↓
//!  MatchResult + BookUpdate subscribers
//! ```
//!
//! Two nodes replaying the same causally ordered events reach the same book
//! state and produce the same trades: the queue linearizes events
//! deterministically, the book mutates only on dispatched events, and trade
//! identifiers are derived from the matched order pair rather than drawn at
//! random.

/// Vector clocks and monotonic local timestamps.
pub mod clock;

/// Price-time priority limit order book.
pub mod book;

/// The asynchronous matching engine facade: event queue + book + history.
pub mod engine;

/// Defines all possible errors in the matching crate.
pub mod error;

/// Order types and identifiers.
pub mod order;

/// Causal event queue buffering order/trade events ahead of the book.
pub mod queue;

/// Executed trade types and identifiers.
pub mod trade;

pub use book::{BookSnapshot, LevelSnapshot, MatchOutcome, OrderBook};
pub use clock::{CausalOrder, StampedClock, VectorClock};
pub use engine::{BookUpdate, EngineConfig, MatchingEngine};
pub use error::BookError;
pub use order::{Order, OrderId, OrderRequest, OrderStatus};
pub use queue::{EventOrigin, EventPayload, EventQueue, EventQueueConfig, MatchResult, QueuedEvent};
pub use trade::{Trade, TradeId};

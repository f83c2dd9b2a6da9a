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

//! # Core - Meshbook Node
//!
//! The full exchange participant: one [`Node`](node::Node) owns a
//! [`MatchingEngine`](meshbook_matching::MatchingEngine) for its trading
//! pair and the whole peer transport stack, and keeps both sides in sync.
//!
//! ## Processing Flow
//!
//! ```text
//! client call               peer socket
//!     ↓                          ↓
//! rate limit + validate      parser + fingerprint dedup
//!     ↓                          ↓
//!          causal event queue
//!                 ↓
//!            order book
//!                 ↓
//!   trades → router broadcast to peers
//! ```
//!
//! Locally placed orders are matched and then propagated together with the
//! trades they produced; remote orders replay through the same causal
//! queue, so every node converges to the same book and trade sequence.

// Suppress unused extern crate warnings (binary-only dependency)
use clap as _;

/// Configuration tree loaded from TOML with per-environment defaults.
pub mod config;

/// Defines all possible errors in Core.
pub mod error;

/// Provides default Core tracing logging initialisers.
pub mod logging;

/// The node facade wiring matching and transport together.
pub mod node;

/// Sliding-window rate limiting per user and category.
pub mod rate_limit;

/// Order input validation.
pub mod validate;

pub use config::{Config, Environment};
pub use error::{ErrorKind, NodeError, Severity};
pub use node::{Node, NodeStatus, OrderOutcome};
pub use rate_limit::{RateCategory, RateLimiter};

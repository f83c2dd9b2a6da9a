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

//! # Markets - Meshbook Domain Primitives
//!
//! Core market types shared by every Meshbook component: the [`Side`] of an
//! order, the [`Pair`] a book is bound to, and exact decimal parsing for
//! prices and amounts.
//!
//! All monetary values are [`rust_decimal::Decimal`]; binary floating point
//! never touches the matching path.

/// Defines the order side enum
pub mod side;

/// Defines the trading pair symbol
pub mod pair;

/// Exact decimal parsing and bounds validation
pub mod decimal;

/// Market-level error types
pub mod error;

pub use decimal::{parse_amount, parse_price, DecimalBounds};
pub use error::MarketError;
pub use pair::Pair;
pub use side::Side;

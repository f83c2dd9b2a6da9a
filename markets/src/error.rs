//! Market-level error types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when validating market primitives.
///
/// These are terminal validation failures; callers surface them to the user
/// and never retry.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum MarketError {
    /// The input is not a well-formed `"BASE/QUOTE"` pair symbol
    #[error("invalid trading pair: {0}")]
    InvalidPair(String),

    /// The input is not a well-formed finite decimal
    #[error("invalid decimal {field}: {input}")]
    InvalidDecimal { field: &'static str, input: String },

    /// The value parsed but is zero or negative
    #[error("{field} must be strictly positive, got {value}")]
    NotPositive { field: &'static str, value: Decimal },

    /// The amount exceeds the configured maximum
    #[error("amount {value} exceeds maximum {max}")]
    AmountOutOfRange { value: Decimal, max: Decimal },

    /// The price exceeds the configured maximum
    #[error("price {value} exceeds maximum {max}")]
    PriceOutOfRange { value: Decimal, max: Decimal },
}

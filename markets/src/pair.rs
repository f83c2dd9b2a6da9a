//! Trading pair symbol.
//!
//! A [`Pair`] is the `"BASE/QUOTE"` symbol a single order book is bound to,
//! eg/ `"BTC/USD"`. Base and quote are kept as separate symbols so the wire
//! representation and the parsed form round-trip exactly.

use crate::error::MarketError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// Maximum length of a single asset symbol within a pair.
pub const MAX_SYMBOL_LEN: usize = 16;

/// Trading pair containing a base and quote asset symbol.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    pub base: SmolStr,
    pub quote: SmolStr,
}

impl Pair {
    /// Construct a [`Pair`] from raw base and quote symbols.
    ///
    /// Symbols are upper-cased; both must be non-empty, free of `/`, and at
    /// most [`MAX_SYMBOL_LEN`] bytes.
    pub fn new<S>(base: S, quote: S) -> Result<Self, MarketError>
    where
        S: AsRef<str>,
    {
        let base = validate_symbol(base.as_ref())?;
        let quote = validate_symbol(quote.as_ref())?;
        Ok(Self { base, quote })
    }

    /// The canonical `"BASE/QUOTE"` symbol.
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

fn validate_symbol(symbol: &str) -> Result<SmolStr, MarketError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_SYMBOL_LEN
        || !trimmed.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(MarketError::InvalidPair(symbol.to_string()));
    }
    Ok(SmolStr::new(trimmed.to_ascii_uppercase()))
}

impl FromStr for Pair {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| MarketError::InvalidPair(s.to_string()))?;
        Pair::new(base, quote)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl TryFrom<String> for Pair {
    type Error = MarketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Pair> for String {
    fn from(value: Pair) -> Self {
        value.symbol()
    }
}

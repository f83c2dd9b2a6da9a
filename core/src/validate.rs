//! Order input validation.
//!
//! The single gate between client text and the matching engine: user ids
//! are bounded, amounts and prices must parse as positive decimals within
//! the configured bounds, and nothing else reaches the book.

use crate::error::NodeError;
use meshbook_markets::{parse_amount, parse_price, DecimalBounds};
use rust_decimal::Decimal;

/// Maximum user id length.
pub const MAX_USER_ID_BYTES: usize = 64;

/// Validate a user identifier.
pub fn validate_user(user: &str) -> Result<(), NodeError> {
    if user.is_empty() || user.len() > MAX_USER_ID_BYTES {
        return Err(NodeError::validation(format!(
            "user id length {} outside 1..={MAX_USER_ID_BYTES}",
            user.len()
        )));
    }
    Ok(())
}

/// Validate and parse the amount/price strings of an order placement.
pub fn validate_order_input(
    user: &str,
    amount: &str,
    price: &str,
    bounds: &DecimalBounds,
) -> Result<(Decimal, Decimal), NodeError> {
    validate_user(user)?;
    let amount = parse_amount(amount, bounds)
        .map_err(|e| NodeError::from(e).with_context("field", "amount"))?;
    let price = parse_price(price, bounds)
        .map_err(|e| NodeError::from(e).with_context("field", "price"))?;
    Ok((amount, price))
}

//! Exact decimal parsing for prices and amounts.
//!
//! Everything monetary in Meshbook is a [`rust_decimal::Decimal`]; parsing
//! is the single gate where untrusted text (CLI input, wire payloads)
//! becomes a value the matching engine will do arithmetic on. Inputs must
//! be well-formed finite decimals, strictly positive, and within the
//! configured bounds.

use crate::error::MarketError;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Upper bounds applied when parsing order amounts and prices.
///
/// The node derives these from its performance configuration; the defaults
/// match a development deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalBounds {
    pub max_amount: Decimal,
    pub max_price: Decimal,
}

impl Default for DecimalBounds {
    fn default() -> Self {
        Self {
            max_amount: Decimal::from(1_000_000),
            max_price: Decimal::from(100_000_000),
        }
    }
}

/// Parse an order amount, requiring `0 < amount <= bounds.max_amount`.
pub fn parse_amount(input: &str, bounds: &DecimalBounds) -> Result<Decimal, MarketError> {
    let amount = parse_positive(input, "amount")?;
    if amount > bounds.max_amount {
        return Err(MarketError::AmountOutOfRange {
            value: amount,
            max: bounds.max_amount,
        });
    }
    Ok(amount)
}

/// Parse an order price, requiring `0 < price <= bounds.max_price`.
pub fn parse_price(input: &str, bounds: &DecimalBounds) -> Result<Decimal, MarketError> {
    let price = parse_positive(input, "price")?;
    if price > bounds.max_price {
        return Err(MarketError::PriceOutOfRange {
            value: price,
            max: bounds.max_price,
        });
    }
    Ok(price)
}

fn parse_positive(input: &str, field: &'static str) -> Result<Decimal, MarketError> {
    let value = Decimal::from_str(input.trim()).map_err(|_| MarketError::InvalidDecimal {
        field,
        input: input.to_string(),
    })?;
    if value <= Decimal::ZERO {
        return Err(MarketError::NotPositive { field, value });
    }
    // Strip trailing zeros so "1.50" and "1.5" compare and hash identically
    // wherever the book keys on price.
    Ok(value.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_amount_exact() {
        let bounds = DecimalBounds::default();
        assert_eq!(
            parse_amount("0.00000001", &bounds).unwrap(),
            dec!(0.00000001)
        );
        assert_eq!(parse_amount("1.50", &bounds).unwrap(), dec!(1.5));
    }

    #[test]
    fn test_parse_price_high_precision_no_drift() {
        let bounds = DecimalBounds::default();
        let price = parse_price("49999.99999999", &bounds).unwrap();
        assert_eq!(price, dec!(49999.99999999));
        assert_eq!(price.to_string(), "49999.99999999");
    }

    #[test]
    fn test_rejects_non_decimal_input() {
        let bounds = DecimalBounds::default();
        for input in ["", "abc", "1.2.3", "NaN", "1e10junk"] {
            assert!(parse_amount(input, &bounds).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_rejects_zero_and_negative() {
        let bounds = DecimalBounds::default();
        assert!(matches!(
            parse_amount("0", &bounds),
            Err(MarketError::NotPositive { .. })
        ));
        assert!(matches!(
            parse_price("-42.5", &bounds),
            Err(MarketError::NotPositive { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_bounds() {
        let bounds = DecimalBounds {
            max_amount: dec!(100),
            max_price: dec!(1000),
        };
        assert!(matches!(
            parse_amount("100.00000001", &bounds),
            Err(MarketError::AmountOutOfRange { .. })
        ));
        assert!(matches!(
            parse_price("1001", &bounds),
            Err(MarketError::PriceOutOfRange { .. })
        ));
        assert!(parse_amount("100", &bounds).is_ok());
    }
}

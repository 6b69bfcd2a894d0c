//! Client-order-id generation
//!
//! IDs are derived, not random: the same `(symbol, side, qty, price, type)`
//! tuple always hashes to the same id, so a resubmission after a lost
//! response hits the venue's duplicate check instead of double-ordering.
//! The placement wrapper recovers from the duplicate rejection by fetching
//! the existing order.

use crate::core::types::{OrderType, Side, Symbol};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

const COID_PREFIX: &str = "DIP";
const COID_HASH_CHARS: usize = 20;

/// Deterministic client order id for an order tuple.
///
/// Quantity and price must already be rounded to the venue's step/tick; the
/// id is computed over their canonical decimal rendering.
pub fn client_order_id(
    symbol: &Symbol,
    side: Side,
    qty: Decimal,
    price: Option<Decimal>,
    order_type: OrderType,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(side.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(qty.normalize().to_string().as_bytes());
    hasher.update(b"|");
    match price {
        Some(px) => hasher.update(px.normalize().to_string().as_bytes()),
        None => hasher.update(b"MKT"),
    }
    hasher.update(b"|");
    hasher.update(order_type.as_str().as_bytes());

    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", COID_PREFIX, &digest[..COID_HASH_CHARS])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_same_tuple_same_id() {
        let s = Symbol::from("BTC/USDT");
        let a = client_order_id(&s, Side::Buy, dec!(0.1), Some(dec!(50000)), OrderType::Limit);
        let b = client_order_id(&s, Side::Buy, dec!(0.1), Some(dec!(50000)), OrderType::Limit);
        assert_eq!(a, b);
        assert!(a.starts_with("DIP-"));
        assert_eq!(a.len(), COID_PREFIX.len() + 1 + COID_HASH_CHARS);
    }

    #[test]
    fn test_normalized_decimals_hash_equal() {
        let s = Symbol::from("BTC/USDT");
        let a = client_order_id(&s, Side::Buy, dec!(0.10), Some(dec!(50000.0)), OrderType::Limit);
        let b = client_order_id(&s, Side::Buy, dec!(0.1), Some(dec!(50000)), OrderType::Limit);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_tuples_differ() {
        let s = Symbol::from("BTC/USDT");
        let base = client_order_id(&s, Side::Buy, dec!(0.1), Some(dec!(50000)), OrderType::Limit);
        assert_ne!(
            base,
            client_order_id(&s, Side::Sell, dec!(0.1), Some(dec!(50000)), OrderType::Limit)
        );
        assert_ne!(
            base,
            client_order_id(&s, Side::Buy, dec!(0.2), Some(dec!(50000)), OrderType::Limit)
        );
        assert_ne!(
            base,
            client_order_id(&s, Side::Buy, dec!(0.1), None, OrderType::Market)
        );
    }
}

//! Conversion utilities.

use {
    alloy::primitives::U256,
    bigdecimal::BigDecimal,
    num::{bigint::ToBigInt, BigInt, BigUint},
};

pub fn biguint_to_u256(i: &BigUint) -> Option<U256> {
    let bytes = i.to_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    Some(U256::from_be_slice(&bytes))
}

pub fn u256_to_biguint(i: &U256) -> BigUint {
    BigUint::from_bytes_be(&i.to_be_bytes::<32>())
}

pub fn u256_to_bigdecimal(i: &U256) -> BigDecimal {
    BigDecimal::new(u256_to_biguint(i).into(), 0)
}

pub fn bigint_to_u256(i: &BigInt) -> Option<U256> {
    if i.sign() == num::bigint::Sign::Minus {
        return None;
    }
    biguint_to_u256(i.magnitude())
}

pub fn bigdecimal_to_u256(d: &BigDecimal) -> Option<U256> {
    let d = d.to_bigint()?;
    bigint_to_u256(&d)
}

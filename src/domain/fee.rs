//! Forwarding fee schedule.
//!
//! A connector may take a spread on forwarded packets: a relative factor of
//! the inbound amount, floored by an optional absolute minimum, with
//! `amount_out = amount_in − fee`.

use {
    crate::{domain::eth::U256, util::conv},
    bigdecimal::{BigDecimal, Zero},
    num::{BigUint, Integer},
};

#[derive(Clone, Debug)]
pub struct Schedule {
    relative: BigDecimal,
    absolute_min: Option<U256>,
}

impl Schedule {
    /// Returns `None` when `relative` is outside `[0, 1)`.
    pub fn new(relative: BigDecimal, absolute_min: Option<U256>) -> Option<Self> {
        (relative >= BigDecimal::zero() && relative < 1.into()).then_some(Self {
            relative,
            absolute_min,
        })
    }

    pub fn free() -> Self {
        Self {
            relative: BigDecimal::zero(),
            absolute_min: None,
        }
    }

    /// The fee charged on an inbound amount, rounded up.
    pub fn fee(&self, amount: U256) -> U256 {
        let relative = if self.relative.is_zero() {
            U256::ZERO
        } else {
            let amount = conv::u256_to_biguint(&amount);
            let (int, exp) = self.relative.as_bigint_and_exponent();
            let numer = amount * int.to_biguint().expect("non-negative by construction");
            let denom =
                BigUint::from(10_u8).pow(exp.unsigned_abs().try_into().unwrap_or(u32::MAX));
            conv::biguint_to_u256(&numer.div_ceil(&denom)).unwrap_or(U256::MAX)
        };
        relative.max(self.absolute_min.unwrap_or(U256::ZERO))
    }

    /// The amount forwarded after the fee comes off.
    pub fn apply(&self, amount: U256) -> U256 {
        amount.saturating_sub(self.fee(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_fee_rounds_up() {
        let schedule = Schedule::new("0.01".parse().unwrap(), None).unwrap();
        assert_eq!(schedule.fee(U256::from(1000)), U256::from(10));
        assert_eq!(schedule.fee(U256::from(101)), U256::from(2));
        assert_eq!(schedule.apply(U256::from(1000)), U256::from(990));
    }

    #[test]
    fn absolute_minimum_floors_the_fee() {
        let schedule = Schedule::new("0.001".parse().unwrap(), Some(U256::from(5))).unwrap();
        assert_eq!(schedule.fee(U256::from(100)), U256::from(5));
        assert_eq!(schedule.fee(U256::from(100_000)), U256::from(100));
    }

    #[test]
    fn free_schedule_forwards_everything() {
        assert_eq!(Schedule::free().apply(U256::from(42)), U256::from(42));
    }

    #[test]
    fn fee_never_exceeds_the_amount() {
        let schedule = Schedule::new(BigDecimal::zero(), Some(U256::from(100))).unwrap();
        assert_eq!(schedule.apply(U256::from(10)), U256::ZERO);
    }

    #[test]
    fn out_of_range_factors_are_rejected() {
        assert!(Schedule::new("1".parse().unwrap(), None).is_none());
        assert!(Schedule::new("-0.1".parse().unwrap(), None).is_none());
    }
}

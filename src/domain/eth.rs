//! EVM primitive types shared by the settlement rails.

pub use alloy::primitives::{keccak256, Address, B256, I256, U256};

/// A contract address.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContractAddress(pub Address);

/// An ERC20 token address.
///
/// https://eips.ethereum.org/EIPS/eip-20
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TokenAddress(pub Address);

impl From<Address> for TokenAddress {
    fn from(inner: Address) -> Self {
        Self(inner)
    }
}

/// An EVM chain ID, part of the EIP-712 and EIP-155 signing domains.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainId(pub u64);

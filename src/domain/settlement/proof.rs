//! Balance-proof construction for the settlement rails.
//!
//! EVM proofs are EIP-712 typed data over the token-network domain; XRP
//! claims are the canonical `CLM\0` payload. Both produce a digest for the
//! key manager, which never sees anything but bytes to sign.

use crate::domain::{
    eth::{keccak256, B256, U256},
    settlement::ChannelId,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel id {0} is not a 32-byte hex string")]
    MalformedChannelId(ChannelId),
}

/// The off-chain signed statement a counterparty can redeem on-chain:
/// cumulative `transferred` at monotonically increasing `nonce`.
#[derive(Clone, Debug)]
pub struct BalanceProof {
    pub channel_id: ChannelId,
    pub nonce: u64,
    pub transferred: U256,
    pub locked: U256,
    pub locks_root: B256,
    /// Filled in by the settlement engine once the key manager signed the
    /// digest; empty until then.
    pub signature: Vec<u8>,
}

impl BalanceProof {
    pub fn new(channel_id: ChannelId, nonce: u64, transferred: U256) -> Self {
        Self {
            channel_id,
            nonce,
            transferred,
            locked: U256::ZERO,
            locks_root: B256::ZERO,
            signature: Vec::new(),
        }
    }
}

/// EIP-712 signing domain of the token-network contract.
#[derive(Clone, Debug)]
pub struct Eip712Domain {
    pub chain_id: u64,
    pub verifying_contract: alloy::primitives::Address,
}

const DOMAIN_NAME: &[u8] = b"TokenNetwork";
const DOMAIN_VERSION: &[u8] = b"1";

fn domain_typehash() -> B256 {
    keccak256(b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)")
}

fn balance_proof_typehash() -> B256 {
    keccak256(
        b"BalanceProof(bytes32 channelId,uint256 nonce,uint256 transferredAmount,uint256 lockedAmount,bytes32 locksRoot)",
    )
}

fn word_u64(value: u64) -> [u8; 32] {
    U256::from(value).to_be_bytes::<32>()
}

fn word_address(value: alloy::primitives::Address) -> [u8; 32] {
    let mut word = [0_u8; 32];
    word[12..].copy_from_slice(value.as_slice());
    word
}

impl Eip712Domain {
    pub fn separator(&self) -> B256 {
        let mut encoded = Vec::with_capacity(5 * 32);
        encoded.extend_from_slice(domain_typehash().as_slice());
        encoded.extend_from_slice(keccak256(DOMAIN_NAME).as_slice());
        encoded.extend_from_slice(keccak256(DOMAIN_VERSION).as_slice());
        encoded.extend_from_slice(&word_u64(self.chain_id));
        encoded.extend_from_slice(&word_address(self.verifying_contract));
        keccak256(&encoded)
    }
}

/// The digest an EVM balance proof is signed over:
/// `keccak256("\x19\x01" || domainSeparator || structHash)`.
pub fn eip712_digest(domain: &Eip712Domain, proof: &BalanceProof) -> Result<B256, Error> {
    let channel_id = channel_id_bytes(&proof.channel_id)?;

    let mut encoded = Vec::with_capacity(6 * 32);
    encoded.extend_from_slice(balance_proof_typehash().as_slice());
    encoded.extend_from_slice(&channel_id);
    encoded.extend_from_slice(&word_u64(proof.nonce));
    encoded.extend_from_slice(&proof.transferred.to_be_bytes::<32>());
    encoded.extend_from_slice(&proof.locked.to_be_bytes::<32>());
    encoded.extend_from_slice(proof.locks_root.as_slice());
    let struct_hash = keccak256(&encoded);

    let mut preimage = Vec::with_capacity(2 + 2 * 32);
    preimage.extend_from_slice(b"\x19\x01");
    preimage.extend_from_slice(domain.separator().as_slice());
    preimage.extend_from_slice(struct_hash.as_slice());
    Ok(keccak256(&preimage))
}

/// The canonical XRPL payment-channel claim payload: `CLM\0` prefix, the
/// 256-bit channel id, then the cumulative drops amount, all big-endian.
pub fn xrp_claim_payload(channel_id: &ChannelId, drops: u64) -> Result<Vec<u8>, Error> {
    let channel = channel_id_bytes(channel_id)?;
    let mut payload = Vec::with_capacity(4 + 32 + 8);
    payload.extend_from_slice(b"CLM\0");
    payload.extend_from_slice(&channel);
    payload.extend_from_slice(&drops.to_be_bytes());
    Ok(payload)
}

fn channel_id_bytes(channel_id: &ChannelId) -> Result<[u8; 32], Error> {
    let hex_str = channel_id.as_str().trim_start_matches("0x");
    let bytes = hex::decode(hex_str).map_err(|_| Error::MalformedChannelId(channel_id.clone()))?;
    bytes
        .try_into()
        .map_err(|_| Error::MalformedChannelId(channel_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> Eip712Domain {
        Eip712Domain {
            chain_id: 8453,
            verifying_contract: alloy::primitives::Address::repeat_byte(0x22),
        }
    }

    fn proof(nonce: u64, transferred: u64) -> BalanceProof {
        BalanceProof::new(
            ChannelId::new(format!("0x{}", "11".repeat(32))),
            nonce,
            U256::from(transferred),
        )
    }

    #[test]
    fn digest_is_deterministic_and_field_sensitive() {
        let base = eip712_digest(&domain(), &proof(1, 5500)).unwrap();
        assert_eq!(base, eip712_digest(&domain(), &proof(1, 5500)).unwrap());
        assert_ne!(base, eip712_digest(&domain(), &proof(2, 5500)).unwrap());
        assert_ne!(base, eip712_digest(&domain(), &proof(1, 5501)).unwrap());

        let other_domain = Eip712Domain {
            chain_id: 1,
            ..domain()
        };
        assert_ne!(base, eip712_digest(&other_domain, &proof(1, 5500)).unwrap());
    }

    #[test]
    fn xrp_claim_payload_layout() {
        let channel = ChannelId::new("AB".repeat(32));
        let payload = xrp_claim_payload(&channel, 5500).unwrap();
        assert_eq!(payload.len(), 44);
        assert_eq!(&payload[..4], b"CLM\0");
        assert_eq!(&payload[4..36], &[0xab_u8; 32]);
        assert_eq!(&payload[36..], &5500_u64.to_be_bytes());
    }

    #[test]
    fn malformed_channel_ids_are_rejected() {
        let short = ChannelId::new("0xabcd");
        assert!(eip712_digest(&domain(), &BalanceProof::new(short, 1, U256::ZERO)).is_err());
    }
}

//! EVM adaptor over the key manager: address derivation, recoverable
//! `r || s || v` signatures, personal-message and EIP-712 digests. Pure
//! plumbing; no key material is cached here.

use {
    super::{Error, KeyManager},
    crate::domain::{
        eth::{keccak256, Address, B256},
        settlement::{proof, Method, ProofSigner, SignError},
    },
    async_trait::async_trait,
    k256::ecdsa::{RecoveryId, Signature, VerifyingKey},
    std::sync::Arc,
};

#[derive(Clone)]
pub struct EvmSigner {
    keys: Arc<KeyManager>,
    key_id: String,
}

impl EvmSigner {
    pub fn new(keys: Arc<KeyManager>, key_id: impl Into<String>) -> Self {
        Self {
            keys,
            key_id: key_id.into(),
        }
    }

    async fn verifying_key(&self) -> Result<VerifyingKey, Error> {
        let public_key = self.keys.public_key(&self.key_id).await?;
        VerifyingKey::from_sec1_bytes(&public_key)
            .map_err(|_| Error::SigningRejected("backend public key is not SEC1".to_owned()))
    }

    /// The account address: `keccak256(pubkey)[12..]`.
    pub async fn address(&self) -> Result<Address, Error> {
        let point = self.verifying_key().await?.to_encoded_point(false);
        Ok(Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..]))
    }

    /// Signs a 32-byte hash, returning `r || s || v` with the recovery id in
    /// `v` as 27/28 and `s` normalized to the low half-order.
    pub async fn sign_hash(&self, hash: B256) -> Result<[u8; 65], Error> {
        let raw = self.keys.sign(hash.as_slice(), &self.key_id).await?;
        let verifying_key = self.verifying_key().await?;

        // Backends disagree on encodings: env returns r||s||recid, Azure
        // bare r||s, the DER-speaking rest DER.
        let signature = match raw.len() {
            64 | 65 => Signature::from_slice(&raw[..64]),
            _ => Signature::from_der(&raw),
        }
        .map_err(|_| Error::SigningRejected("unparseable signature from backend".to_owned()))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        let recovery_id =
            RecoveryId::trial_recovery_from_prehash(&verifying_key, hash.as_slice(), &signature)
                .map_err(|_| {
                    Error::SigningRejected("signature does not recover to key".to_owned())
                })?;

        let mut out = [0_u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = 27 + recovery_id.to_byte();
        Ok(out)
    }

    /// Signs `keccak256("\x19Ethereum Signed Message:\n" + len + message)`.
    pub async fn sign_personal(&self, message: &[u8]) -> Result<[u8; 65], Error> {
        let mut preimage = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
        preimage.extend_from_slice(message);
        self.sign_hash(keccak256(&preimage)).await
    }

    /// Signs an EIP-712 digest (`\x19\x01`-prefixed hashes are built by the
    /// caller).
    pub async fn sign_typed(&self, digest: B256) -> Result<[u8; 65], Error> {
        self.sign_hash(digest).await
    }
}

fn to_sign_error(err: Error) -> SignError {
    match err {
        Error::BackendUnavailable(message) => SignError::Unavailable(message),
        other => SignError::Rejected(other.to_string()),
    }
}

/// Balance-proof signer over the configured rails.
pub struct RailSigner {
    evm: Option<(EvmSigner, proof::Eip712Domain)>,
    xrp: Option<(Arc<KeyManager>, String)>,
}

impl RailSigner {
    pub fn new(
        evm: Option<(EvmSigner, proof::Eip712Domain)>,
        xrp: Option<(Arc<KeyManager>, String)>,
    ) -> Arc<Self> {
        Arc::new(Self { evm, xrp })
    }
}

#[async_trait]
impl ProofSigner for RailSigner {
    async fn sign_balance_proof(
        &self,
        method: Method,
        proof: &mut proof::BalanceProof,
    ) -> Result<(), SignError> {
        match method {
            Method::Evm => {
                let (signer, domain) = self
                    .evm
                    .as_ref()
                    .ok_or_else(|| SignError::Rejected("no EVM signer configured".to_owned()))?;
                let digest = proof::eip712_digest(domain, proof)
                    .map_err(|err| SignError::Rejected(err.to_string()))?;
                proof.signature = signer
                    .sign_typed(digest)
                    .await
                    .map_err(to_sign_error)?
                    .to_vec();
            }
            Method::Xrp => {
                let (keys, key_id) = self
                    .xrp
                    .as_ref()
                    .ok_or_else(|| SignError::Rejected("no XRP signer configured".to_owned()))?;
                let drops = proof.transferred.try_into().unwrap_or(u64::MAX);
                let payload = proof::xrp_claim_payload(&proof.channel_id, drops)
                    .map_err(|err| SignError::Rejected(err.to_string()))?;
                proof.signature = keys
                    .sign(&payload, key_id)
                    .await
                    .map_err(to_sign_error)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::infra::keys::{env, BackendKind, Options, Scheme},
        std::collections::HashMap,
    };

    fn manager() -> Arc<KeyManager> {
        Arc::new(
            KeyManager::new(Options {
                backend: BackendKind::Env,
                env: Some(env::Config {
                    keys: HashMap::from([
                        (
                            "evm".to_owned(),
                            env::KeyConfig {
                                scheme: Scheme::Secp256k1,
                                secret_hex: Some("11".repeat(32)),
                            },
                        ),
                        (
                            "xrp".to_owned(),
                            env::KeyConfig {
                                scheme: Scheme::Ed25519,
                                secret_hex: Some("22".repeat(32)),
                            },
                        ),
                    ]),
                }),
                aws_kms: None,
                gcp_kms: None,
                azure_kv: None,
                hsm: None,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn signatures_recover_to_the_derived_address() {
        let signer = EvmSigner::new(manager(), "evm");
        let address = signer.address().await.unwrap();
        let hash = keccak256(b"balance proof");
        let signature = signer.sign_hash(hash).await.unwrap();

        assert!(signature[64] == 27 || signature[64] == 28);
        let parsed = Signature::from_slice(&signature[..64]).unwrap();
        let recovery = RecoveryId::from_byte(signature[64] - 27).unwrap();
        let recovered =
            VerifyingKey::recover_from_prehash(hash.as_slice(), &parsed, recovery).unwrap();
        let recovered_address = Address::from_slice(
            &keccak256(&recovered.to_encoded_point(false).as_bytes()[1..])[12..],
        );
        assert_eq!(recovered_address, address);
    }

    #[tokio::test]
    async fn personal_and_typed_digests_differ() {
        let signer = EvmSigner::new(manager(), "evm");
        let personal = signer.sign_personal(b"hello").await.unwrap();
        let typed = signer.sign_typed(keccak256(b"hello")).await.unwrap();
        assert_ne!(personal[..64], typed[..64]);
    }

    #[tokio::test]
    async fn rail_signer_fills_proof_signatures() {
        let keys = manager();
        let signer = RailSigner::new(
            Some((
                EvmSigner::new(Arc::clone(&keys), "evm"),
                proof::Eip712Domain {
                    chain_id: 8453,
                    verifying_contract: Address::repeat_byte(0x22),
                },
            )),
            Some((keys, "xrp".to_owned())),
        );

        let channel = crate::domain::settlement::ChannelId::new(format!("0x{}", "ab".repeat(32)));
        let amount = crate::domain::eth::U256::from(5500_u64);
        let mut evm_proof = proof::BalanceProof::new(channel.clone(), 1, amount);
        signer
            .sign_balance_proof(Method::Evm, &mut evm_proof)
            .await
            .unwrap();
        assert_eq!(evm_proof.signature.len(), 65);

        let mut xrp_proof = proof::BalanceProof::new(channel, 1, amount);
        signer
            .sign_balance_proof(Method::Xrp, &mut xrp_proof)
            .await
            .unwrap();
        assert_eq!(xrp_proof.signature.len(), 64);
    }
}

//! Pluggable signing backends.
//!
//! Callers hand over digests (or, for ed25519, the exact payload bytes) and
//! a logical key id; private material never leaves the selected backend.
//! The backend is chosen once at construction and its configuration block is
//! validated there: a missing block is a fatal configuration error.

use {crate::util::retry::Retryable, serde::Deserialize};

pub mod aws;
pub mod azure;
pub mod env;
pub mod evm;
pub mod gcp;
pub mod hsm;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Env,
    AwsKms,
    GcpKms,
    AzureKv,
    Hsm,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("signing backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("signing rejected: {0}")]
    SigningRejected(String),
    #[error("key backend configuration error: {0}")]
    Config(String),
    #[error("key rotation is not supported by this backend")]
    RotationUnsupported,
}

impl Retryable for Error {
    fn retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }
}

/// Signature schemes the connector uses: secp256k1 over keccak digests for
/// EVM, ed25519 over raw payloads for XRP.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    Secp256k1,
    Ed25519,
}

/// Backend selection plus the per-backend configuration blocks as they come
/// out of the config file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Options {
    pub backend: BackendKind,
    #[serde(default)]
    pub env: Option<env::Config>,
    #[serde(default)]
    pub aws_kms: Option<aws::Config>,
    #[serde(default)]
    pub gcp_kms: Option<gcp::Config>,
    #[serde(default)]
    pub azure_kv: Option<azure::Config>,
    #[serde(default)]
    pub hsm: Option<hsm::Config>,
}

/// The backend-dispatching key manager.
pub enum KeyManager {
    Env(env::Backend),
    Aws(aws::Backend),
    Gcp(gcp::Backend),
    Azure(azure::Backend),
    Hsm(hsm::Backend),
}

fn missing_block(backend: &str) -> Error {
    Error::Config(format!("selected key backend {backend:?} has no configuration block"))
}

impl KeyManager {
    pub fn new(options: Options) -> Result<Self, Error> {
        match options.backend {
            BackendKind::Env => Ok(Self::Env(env::Backend::new(
                options.env.ok_or_else(|| missing_block("env"))?,
            )?)),
            BackendKind::AwsKms => Ok(Self::Aws(aws::Backend::new(
                options.aws_kms.ok_or_else(|| missing_block("aws-kms"))?,
            )?)),
            BackendKind::GcpKms => Ok(Self::Gcp(gcp::Backend::new(
                options.gcp_kms.ok_or_else(|| missing_block("gcp-kms"))?,
            )?)),
            BackendKind::AzureKv => Ok(Self::Azure(azure::Backend::new(
                options.azure_kv.ok_or_else(|| missing_block("azure-kv"))?,
            )?)),
            BackendKind::Hsm => Ok(Self::Hsm(hsm::Backend::new(
                options.hsm.ok_or_else(|| missing_block("hsm"))?,
            )?)),
        }
    }

    /// Signs an already-hashed digest (or, for ed25519 keys, the payload
    /// itself). The signature encoding is backend-native; EVM callers
    /// normalize through [`evm::EvmSigner`].
    pub async fn sign(&self, digest: &[u8], key_id: &str) -> Result<Vec<u8>, Error> {
        match self {
            Self::Env(backend) => backend.sign(digest, key_id),
            Self::Aws(backend) => backend.sign(digest, key_id).await,
            Self::Gcp(backend) => backend.sign(digest, key_id).await,
            Self::Azure(backend) => backend.sign(digest, key_id).await,
            Self::Hsm(backend) => backend.sign(digest, key_id).await,
        }
    }

    /// The public key for a key id: uncompressed SEC1 for secp256k1,
    /// 32 bytes for ed25519.
    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
        match self {
            Self::Env(backend) => backend.public_key(key_id),
            Self::Aws(backend) => backend.public_key(key_id).await,
            Self::Gcp(backend) => backend.public_key(key_id).await,
            Self::Azure(backend) => backend.public_key(key_id).await,
            Self::Hsm(backend) => backend.public_key(key_id).await,
        }
    }

    /// Rotation stub: no backend supports it yet.
    pub async fn rotate(&self, _key_id: &str) -> Result<(), Error> {
        Err(Error::RotationUnsupported)
    }
}

/// Pulls the trailing uncompressed EC point out of a DER-encoded
/// SubjectPublicKeyInfo. Good enough for the curves in play, which encode
/// the point verbatim at the end of the bit string.
pub(crate) fn spki_uncompressed_point(der: &[u8]) -> Option<Vec<u8>> {
    if der.len() >= 65 && der[der.len() - 65] == 0x04 {
        Some(der[der.len() - 65..].to_vec())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_backend_block_is_a_config_error() {
        let options = Options {
            backend: BackendKind::AwsKms,
            env: None,
            aws_kms: None,
            gcp_kms: None,
            azure_kv: None,
            hsm: None,
        };
        assert!(matches!(KeyManager::new(options), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn rotation_is_unsupported_everywhere() {
        let manager = KeyManager::new(Options {
            backend: BackendKind::Env,
            env: Some(env::Config::default()),
            aws_kms: None,
            gcp_kms: None,
            azure_kv: None,
            hsm: None,
        })
        .unwrap();
        assert!(matches!(
            manager.rotate("evm").await,
            Err(Error::RotationUnsupported)
        ));
    }
}

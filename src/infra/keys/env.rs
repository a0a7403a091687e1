//! Environment-backed signing keys: hex secrets from the config file or
//! `KEY_<ID>` environment variables, signed locally.

use {
    super::{Error, Scheme},
    ed25519_dalek::Signer as _,
    serde::Deserialize,
    std::collections::HashMap,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeyConfig {
    pub scheme: Scheme,
    /// Hex-encoded private key. Falls back to the `KEY_<ID>` environment
    /// variable when absent, so secrets can stay out of the config file.
    #[serde(default)]
    pub secret_hex: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub keys: HashMap<String, KeyConfig>,
}

enum Key {
    Secp256k1(k256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

pub struct Backend {
    keys: HashMap<String, Key>,
}

fn env_var_for(key_id: &str) -> String {
    format!("KEY_{}", key_id.to_uppercase().replace('-', "_"))
}

impl Backend {
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut keys = HashMap::new();
        for (key_id, key_config) in config.keys {
            let secret_hex = match key_config.secret_hex {
                Some(secret) => secret,
                None => std::env::var(env_var_for(&key_id)).map_err(|_| {
                    Error::Config(format!(
                        "key {key_id:?} has no secret-hex and {} is unset",
                        env_var_for(&key_id)
                    ))
                })?,
            };
            let secret = hex::decode(secret_hex.trim_start_matches("0x"))
                .map_err(|_| Error::Config(format!("key {key_id:?} secret is not hex")))?;
            let key = match key_config.scheme {
                Scheme::Secp256k1 => Key::Secp256k1(
                    k256::ecdsa::SigningKey::from_slice(&secret).map_err(|_| {
                        Error::Config(format!("key {key_id:?} is not a valid secp256k1 secret"))
                    })?,
                ),
                Scheme::Ed25519 => {
                    let secret: [u8; 32] = secret.try_into().map_err(|_| {
                        Error::Config(format!("key {key_id:?} is not 32 bytes of ed25519 seed"))
                    })?;
                    Key::Ed25519(ed25519_dalek::SigningKey::from_bytes(&secret))
                }
            };
            keys.insert(key_id, key);
        }
        Ok(Self { keys })
    }

    fn key(&self, key_id: &str) -> Result<&Key, Error> {
        self.keys
            .get(key_id)
            .ok_or_else(|| Error::KeyNotFound(key_id.to_owned()))
    }

    /// secp256k1 signatures come back as 65 bytes `r || s || recovery_id`,
    /// ed25519 as the usual 64 bytes.
    pub fn sign(&self, digest: &[u8], key_id: &str) -> Result<Vec<u8>, Error> {
        match self.key(key_id)? {
            Key::Secp256k1(key) => {
                let (signature, recovery_id) = key
                    .sign_prehash_recoverable(digest)
                    .map_err(|err| Error::SigningRejected(err.to_string()))?;
                let mut out = signature.to_bytes().to_vec();
                out.push(recovery_id.to_byte());
                Ok(out)
            }
            Key::Ed25519(key) => Ok(key.sign(digest).to_bytes().to_vec()),
        }
    }

    pub fn public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
        match self.key(key_id)? {
            Key::Secp256k1(key) => Ok(key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec()),
            Key::Ed25519(key) => Ok(key.verifying_key().to_bytes().to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(scheme: Scheme, secret_hex: &str) -> Config {
        Config {
            keys: HashMap::from([(
                "test".to_owned(),
                KeyConfig {
                    scheme,
                    secret_hex: Some(secret_hex.to_owned()),
                },
            )]),
        }
    }

    #[test]
    fn secp256k1_signatures_recover_to_the_public_key() {
        let backend = Backend::new(config(Scheme::Secp256k1, &"11".repeat(32))).unwrap();
        let digest = [42_u8; 32];
        let signature = backend.sign(&digest, "test").unwrap();
        assert_eq!(signature.len(), 65);

        let verifying = k256::ecdsa::VerifyingKey::from_sec1_bytes(
            &backend.public_key("test").unwrap(),
        )
        .unwrap();
        let parsed = k256::ecdsa::Signature::from_slice(&signature[..64]).unwrap();
        let recovery = k256::ecdsa::RecoveryId::from_byte(signature[64]).unwrap();
        let recovered =
            k256::ecdsa::VerifyingKey::recover_from_prehash(&digest, &parsed, recovery).unwrap();
        assert_eq!(recovered, verifying);
    }

    #[test]
    fn ed25519_signatures_verify() {
        let backend = Backend::new(config(Scheme::Ed25519, &"22".repeat(32))).unwrap();
        let payload = b"CLM\0payload";
        let signature = backend.sign(payload, "test").unwrap();

        let verifying = ed25519_dalek::VerifyingKey::from_bytes(
            &backend.public_key("test").unwrap().try_into().unwrap(),
        )
        .unwrap();
        let signature = ed25519_dalek::Signature::from_slice(&signature).unwrap();
        assert!(verifying.verify_strict(payload, &signature).is_ok());
    }

    #[test]
    fn unknown_key_is_not_found() {
        let backend = Backend::new(Config::default()).unwrap();
        assert!(matches!(
            backend.sign(&[0; 32], "missing"),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn malformed_secret_is_a_config_error() {
        assert!(matches!(
            Backend::new(config(Scheme::Secp256k1, "zz")),
            Err(Error::Config(_))
        ));
    }
}

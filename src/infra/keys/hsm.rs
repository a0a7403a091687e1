//! PKCS#11 HSM signing via `cryptoki`. All module calls are blocking, so
//! they run on the blocking pool.

use {
    super::Error,
    cryptoki::{
        context::{CInitializeArgs, Pkcs11},
        mechanism::Mechanism,
        object::{Attribute, AttributeType, ObjectClass},
        session::UserType,
        slot::Slot,
        types::AuthPin,
    },
    serde::Deserialize,
    std::{collections::HashMap, path::PathBuf, sync::Arc},
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Path to the PKCS#11 module library.
    pub module_path: PathBuf,
    /// Index into the token-bearing slot list.
    pub slot: usize,
    pub pin: String,
    /// Logical key id → token object label. Unmapped ids are used as the
    /// label directly.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

pub struct Backend {
    context: Arc<Pkcs11>,
    slot: Slot,
    pin: String,
    aliases: HashMap<String, String>,
}

impl Backend {
    pub fn new(config: Config) -> Result<Self, Error> {
        let context = Pkcs11::new(&config.module_path).map_err(|err| {
            Error::Config(format!(
                "hsm: cannot load module {:?}: {err}",
                config.module_path
            ))
        })?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|err| Error::Config(format!("hsm: initialize failed: {err}")))?;
        let slots = context
            .get_slots_with_token()
            .map_err(|err| Error::BackendUnavailable(format!("hsm: slot enumeration: {err}")))?;
        let slot = *slots
            .get(config.slot)
            .ok_or_else(|| Error::Config(format!("hsm: no token in slot index {}", config.slot)))?;
        Ok(Self {
            context: Arc::new(context),
            slot,
            pin: config.pin,
            aliases: config.aliases,
        })
    }

    fn label(&self, key_id: &str) -> String {
        self.aliases
            .get(key_id)
            .cloned()
            .unwrap_or_else(|| key_id.to_owned())
    }

    pub async fn sign(&self, digest: &[u8], key_id: &str) -> Result<Vec<u8>, Error> {
        let context = Arc::clone(&self.context);
        let slot = self.slot;
        let pin = self.pin.clone();
        let label = self.label(key_id);
        let digest = digest.to_vec();
        tokio::task::spawn_blocking(move || {
            let session = context
                .open_ro_session(slot)
                .map_err(|err| Error::BackendUnavailable(format!("hsm session: {err}")))?;
            session
                .login(UserType::User, Some(&AuthPin::new(pin)))
                .map_err(|err| Error::SigningRejected(format!("hsm login: {err}")))?;
            let keys = session
                .find_objects(&[
                    Attribute::Class(ObjectClass::PRIVATE_KEY),
                    Attribute::Label(label.clone().into_bytes()),
                ])
                .map_err(|err| Error::BackendUnavailable(format!("hsm lookup: {err}")))?;
            let key = keys
                .first()
                .copied()
                .ok_or_else(|| Error::KeyNotFound(label))?;
            session
                .sign(&Mechanism::Ecdsa, key, &digest)
                .map_err(|err| Error::SigningRejected(format!("hsm sign: {err}")))
        })
        .await
        .map_err(|err| Error::BackendUnavailable(format!("hsm worker: {err}")))?
    }

    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
        let context = Arc::clone(&self.context);
        let slot = self.slot;
        let pin = self.pin.clone();
        let label = self.label(key_id);
        tokio::task::spawn_blocking(move || {
            let session = context
                .open_ro_session(slot)
                .map_err(|err| Error::BackendUnavailable(format!("hsm session: {err}")))?;
            session
                .login(UserType::User, Some(&AuthPin::new(pin)))
                .map_err(|err| Error::SigningRejected(format!("hsm login: {err}")))?;
            let keys = session
                .find_objects(&[
                    Attribute::Class(ObjectClass::PUBLIC_KEY),
                    Attribute::Label(label.clone().into_bytes()),
                ])
                .map_err(|err| Error::BackendUnavailable(format!("hsm lookup: {err}")))?;
            let key = keys
                .first()
                .copied()
                .ok_or_else(|| Error::KeyNotFound(label))?;
            let attributes = session
                .get_attributes(key, &[AttributeType::EcPoint])
                .map_err(|err| Error::BackendUnavailable(format!("hsm attributes: {err}")))?;
            for attribute in attributes {
                if let Attribute::EcPoint(point) = attribute {
                    return Ok(strip_octet_string(point));
                }
            }
            Err(Error::KeyNotFound("public key has no EC point".to_owned()))
        })
        .await
        .map_err(|err| Error::BackendUnavailable(format!("hsm worker: {err}")))?
    }
}

/// CKA_EC_POINT is DER octet-string wrapped; unwrap the two-byte header when
/// present.
fn strip_octet_string(point: Vec<u8>) -> Vec<u8> {
    if point.len() > 2 && point[0] == 0x04 && point[1] as usize == point.len() - 2 {
        point[2..].to_vec()
    } else {
        point
    }
}

//! GCP Cloud KMS signing over the REST API with bearer-token auth.

use {
    super::{spki_uncompressed_point, Error},
    base64::Engine as _,
    serde::Deserialize,
    std::collections::HashMap,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub project: String,
    pub location: String,
    pub key_ring: String,
    /// Logical key id → `cryptoKey/cryptoKeyVersion`. Unmapped ids default
    /// to version 1 of a crypto key named like the logical id.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Static token; falls back to `GCP_ACCESS_TOKEN`, then to the instance
    /// metadata server.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

pub struct Backend {
    config: Config,
    endpoint: String,
    client: reqwest::Client,
}

impl Backend {
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.project.is_empty() || config.location.is_empty() || config.key_ring.is_empty() {
            return Err(Error::Config(
                "gcp-kms: project, location and key-ring are required".to_owned(),
            ));
        }
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://cloudkms.googleapis.com".to_owned());
        Ok(Self {
            config,
            endpoint,
            client: reqwest::Client::new(),
        })
    }

    fn version_path(&self, key_id: &str) -> String {
        let key_and_version = self
            .config
            .aliases
            .get(key_id)
            .cloned()
            .unwrap_or_else(|| format!("{key_id}/1"));
        let (key, version) = key_and_version
            .split_once('/')
            .unwrap_or((key_and_version.as_str(), "1"));
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}/cryptoKeyVersions/{}",
            self.config.project, self.config.location, self.config.key_ring, key, version
        )
    }

    async fn token(&self) -> Result<String, Error> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }
        if let Ok(token) = std::env::var("GCP_ACCESS_TOKEN") {
            return Ok(token);
        }
        let response = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("metadata server: {err}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("metadata token: {err}")))?;
        body["access_token"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::BackendUnavailable("metadata token missing".to_owned()))
    }

    pub async fn sign(&self, digest: &[u8], key_id: &str) -> Result<Vec<u8>, Error> {
        let url = format!("{}/v1/{}:asymmetricSign", self.endpoint, self.version_path(key_id));
        let body = serde_json::json!({
            "digest": {
                "sha256": base64::engine::general_purpose::STANDARD.encode(digest),
            }
        });
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token().await?)
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("cloud kms: {err}")))?;
        let body = check_status(response).await?;
        body["signature"]
            .as_str()
            .and_then(|signature| {
                base64::engine::general_purpose::STANDARD.decode(signature).ok()
            })
            .ok_or_else(|| Error::SigningRejected("cloud kms response without signature".to_owned()))
    }

    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
        let url = format!("{}/v1/{}/publicKey", self.endpoint, self.version_path(key_id));
        let response = self
            .client
            .get(url)
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("cloud kms: {err}")))?;
        let body = check_status(response).await?;
        let pem = body["pem"]
            .as_str()
            .ok_or_else(|| Error::SigningRejected("cloud kms response without pem".to_owned()))?;
        let der = pem_to_der(pem)
            .ok_or_else(|| Error::SigningRejected("cloud kms pem is malformed".to_owned()))?;
        Ok(spki_uncompressed_point(&der).unwrap_or(der))
    }
}

async fn check_status(response: reqwest::Response) -> Result<serde_json::Value, Error> {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|err| Error::BackendUnavailable(format!("cloud kms response: {err}")))?;
    if status.is_success() {
        Ok(body)
    } else if status.is_server_error() {
        Err(Error::BackendUnavailable(format!("cloud kms {status}")))
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(Error::KeyNotFound(body["error"]["message"].to_string()))
    } else {
        Err(Error::SigningRejected(format!(
            "cloud kms {status}: {}",
            body["error"]["message"]
        )))
    }
}

fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    let encoded: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            project: "proj".to_owned(),
            location: "europe-west3".to_owned(),
            key_ring: "connector".to_owned(),
            aliases: HashMap::from([("evm".to_owned(), "evm-signer/3".to_owned())]),
            access_token: Some("token".to_owned()),
            endpoint: None,
        }
    }

    #[test]
    fn version_paths_resolve_aliases_and_defaults() {
        let backend = Backend::new(config()).unwrap();
        assert_eq!(
            backend.version_path("evm"),
            "projects/proj/locations/europe-west3/keyRings/connector/cryptoKeys/evm-signer/cryptoKeyVersions/3",
        );
        assert_eq!(
            backend.version_path("xrp"),
            "projects/proj/locations/europe-west3/keyRings/connector/cryptoKeys/xrp/cryptoKeyVersions/1",
        );
    }

    #[test]
    fn empty_project_is_a_config_error() {
        let result = Backend::new(Config {
            project: String::new(),
            ..config()
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn pem_decoding_strips_armour() {
        let pem = "-----BEGIN PUBLIC KEY-----\nAQID\n-----END PUBLIC KEY-----\n";
        assert_eq!(pem_to_der(pem).unwrap(), vec![1, 2, 3]);
    }
}

//! Azure Key Vault signing over the REST API with bearer-token auth.

use {
    super::Error,
    base64::Engine as _,
    serde::Deserialize,
    std::collections::HashMap,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// E.g. `https://my-vault.vault.azure.net`.
    pub vault_url: String,
    /// Logical key id → `name` or `name/version`. Unmapped ids name the key
    /// directly.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Falls back to `AZURE_ACCESS_TOKEN`.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_version() -> String {
    "7.4".to_owned()
}

pub struct Backend {
    config: Config,
    client: reqwest::Client,
}

impl Backend {
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.vault_url.is_empty() {
            return Err(Error::Config("azure-kv: vault-url is required".to_owned()));
        }
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn key_path(&self, key_id: &str) -> String {
        self.config
            .aliases
            .get(key_id)
            .cloned()
            .unwrap_or_else(|| key_id.to_owned())
    }

    fn token(&self) -> Result<String, Error> {
        self.config
            .access_token
            .clone()
            .or_else(|| std::env::var("AZURE_ACCESS_TOKEN").ok())
            .ok_or_else(|| {
                Error::BackendUnavailable("azure-kv: no access token available".to_owned())
            })
    }

    pub async fn sign(&self, digest: &[u8], key_id: &str) -> Result<Vec<u8>, Error> {
        let url = format!(
            "{}/keys/{}/sign?api-version={}",
            self.config.vault_url,
            self.key_path(key_id),
            self.config.api_version
        );
        let body = serde_json::json!({
            "alg": "ES256K",
            "value": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest),
        });
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("key vault: {err}")))?;
        let body = check_status(response).await?;
        body["value"]
            .as_str()
            .and_then(|value| {
                base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(value).ok()
            })
            .ok_or_else(|| Error::SigningRejected("key vault response without value".to_owned()))
    }

    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
        let url = format!(
            "{}/keys/{}?api-version={}",
            self.config.vault_url,
            self.key_path(key_id),
            self.config.api_version
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("key vault: {err}")))?;
        let body = check_status(response).await?;
        let x = jwk_coordinate(&body["key"]["x"])?;
        let y = jwk_coordinate(&body["key"]["y"])?;
        let mut point = Vec::with_capacity(1 + x.len() + y.len());
        point.push(0x04);
        point.extend_from_slice(&x);
        point.extend_from_slice(&y);
        Ok(point)
    }
}

fn jwk_coordinate(value: &serde_json::Value) -> Result<Vec<u8>, Error> {
    value
        .as_str()
        .and_then(|value| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(value).ok()
        })
        .ok_or_else(|| Error::SigningRejected("key vault JWK is malformed".to_owned()))
}

async fn check_status(response: reqwest::Response) -> Result<serde_json::Value, Error> {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|err| Error::BackendUnavailable(format!("key vault response: {err}")))?;
    if status.is_success() {
        Ok(body)
    } else if status.is_server_error() {
        Err(Error::BackendUnavailable(format!("key vault {status}")))
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(Error::KeyNotFound(body["error"]["message"].to_string()))
    } else {
        Err(Error::SigningRejected(format!(
            "key vault {status}: {}",
            body["error"]["message"]
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_vault_url_is_a_config_error() {
        let result = Backend::new(Config {
            vault_url: String::new(),
            aliases: HashMap::new(),
            access_token: None,
            api_version: default_api_version(),
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn jwk_coordinates_decode_base64url() {
        let value = serde_json::json!("AQID");
        assert_eq!(jwk_coordinate(&value).unwrap(), vec![1, 2, 3]);
        assert!(jwk_coordinate(&serde_json::json!(42)).is_err());
    }
}

//! AWS KMS signing over the JSON API with a SigV4 request signer.

use {
    super::{spki_uncompressed_point, Error},
    base64::Engine as _,
    chrono::Utc,
    hmac::{Hmac, Mac},
    serde::Deserialize,
    sha2::{Digest, Sha256},
    std::collections::HashMap,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub region: String,
    /// Logical key id → KMS key id or ARN. Unmapped ids are passed through
    /// verbatim.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Falls back to `AWS_ACCESS_KEY_ID`.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Falls back to `AWS_SECRET_ACCESS_KEY`.
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Falls back to `AWS_SESSION_TOKEN`; optional either way.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Override for tests and local stacks.
    #[serde(default)]
    pub endpoint: Option<String>,
}

struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

pub struct Backend {
    region: String,
    aliases: HashMap<String, String>,
    credentials: Credentials,
    endpoint: String,
    host: String,
    client: reqwest::Client,
}

impl Backend {
    pub fn new(config: Config) -> Result<Self, Error> {
        let access_key_id = config
            .access_key_id
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| Error::Config("aws-kms: no access key id configured".to_owned()))?;
        let secret_access_key = config
            .secret_access_key
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| Error::Config("aws-kms: no secret access key configured".to_owned()))?;
        let session_token = config
            .session_token
            .or_else(|| std::env::var("AWS_SESSION_TOKEN").ok());

        let host = format!("kms.{}.amazonaws.com", config.region);
        let endpoint = config
            .endpoint
            .unwrap_or_else(|| format!("https://{host}"));
        Ok(Self {
            region: config.region,
            aliases: config.aliases,
            credentials: Credentials {
                access_key_id,
                secret_access_key,
                session_token,
            },
            endpoint,
            host,
            client: reqwest::Client::new(),
        })
    }

    fn kms_key(&self, key_id: &str) -> String {
        self.aliases
            .get(key_id)
            .cloned()
            .unwrap_or_else(|| key_id.to_owned())
    }

    pub async fn sign(&self, digest: &[u8], key_id: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .request(
                "TrentService.Sign",
                serde_json::json!({
                    "KeyId": self.kms_key(key_id),
                    "Message": base64::engine::general_purpose::STANDARD.encode(digest),
                    "MessageType": "DIGEST",
                    "SigningAlgorithm": "ECDSA_SHA_256",
                }),
            )
            .await?;
        let signature = response["Signature"]
            .as_str()
            .ok_or_else(|| Error::SigningRejected("KMS response without Signature".to_owned()))?;
        base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| Error::SigningRejected("KMS signature is not base64".to_owned()))
    }

    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .request(
                "TrentService.GetPublicKey",
                serde_json::json!({"KeyId": self.kms_key(key_id)}),
            )
            .await?;
        let der = response["PublicKey"]
            .as_str()
            .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
            .ok_or_else(|| Error::SigningRejected("KMS response without PublicKey".to_owned()))?;
        Ok(spki_uncompressed_point(&der).unwrap_or(der))
    }

    async fn request(
        &self,
        target: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let payload = body.to_string();
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(payload.as_bytes()));

        let mut canonical_headers = format!(
            "content-type:application/x-amz-json-1.1\nhost:{}\nx-amz-date:{}\nx-amz-target:{}\n",
            self.host, amz_date, target
        );
        let mut signed_headers = "content-type;host;x-amz-date;x-amz-target".to_owned();
        if let Some(token) = &self.credentials.session_token {
            canonical_headers = format!(
                "content-type:application/x-amz-json-1.1\nhost:{}\nx-amz-date:{}\nx-amz-security-token:{}\nx-amz-target:{}\n",
                self.host, amz_date, token, target
            );
            signed_headers =
                "content-type;host;x-amz-date;x-amz-security-token;x-amz-target".to_owned();
        }

        let canonical_request = format!(
            "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let scope = format!("{date}/{}/kms/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut key = hmac(
            format!("AWS4{}", self.credentials.secret_access_key).as_bytes(),
            date.as_bytes(),
        );
        for component in [self.region.as_str(), "kms", "aws4_request"] {
            key = hmac(&key, component.as_bytes());
        }
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key_id
        );

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/x-amz-json-1.1")
            .header("x-amz-date", amz_date)
            .header("x-amz-target", target)
            .header("authorization", authorization)
            .body(payload);
        if let Some(token) = &self.credentials.session_token {
            request = request.header("x-amz-security-token", token.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("KMS request failed: {err}")))?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::BackendUnavailable(format!("KMS response unreadable: {err}")))?;
        if status.is_success() {
            return Ok(body);
        }

        let kind = body["__type"].as_str().unwrap_or_default();
        let message = body["message"]
            .as_str()
            .or_else(|| body["Message"].as_str())
            .unwrap_or("no message");
        if status.is_server_error() {
            Err(Error::BackendUnavailable(format!("KMS {status}: {message}")))
        } else if kind.contains("NotFound") {
            Err(Error::KeyNotFound(message.to_owned()))
        } else {
            Err(Error::SigningRejected(format!("KMS {kind}: {message}")))
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_are_a_config_error() {
        // Scoped env removal is racy; rely on explicit empty config plus
        // the unlikely presence of AWS credentials in the test environment.
        if std::env::var("AWS_ACCESS_KEY_ID").is_ok() {
            return;
        }
        let result = Backend::new(Config {
            region: "eu-central-1".to_owned(),
            aliases: HashMap::new(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint: None,
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn aliases_map_logical_ids() {
        let backend = Backend::new(Config {
            region: "eu-central-1".to_owned(),
            aliases: HashMap::from([("evm".to_owned(), "arn:aws:kms:key/abc".to_owned())]),
            access_key_id: Some("AKIA".to_owned()),
            secret_access_key: Some("secret".to_owned()),
            session_token: None,
            endpoint: None,
        })
        .unwrap();
        assert_eq!(backend.kms_key("evm"), "arn:aws:kms:key/abc");
        assert_eq!(backend.kms_key("other"), "other");
    }
}

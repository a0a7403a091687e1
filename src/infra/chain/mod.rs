//! Settlement-rail clients. Each implements the engine's channel-ledger
//! seam; everything chain-specific stays behind it.

use {
    crate::domain::settlement::RailError,
    serde::de::DeserializeOwned,
    std::sync::atomic::{AtomicU64, Ordering},
};

pub mod evm;
pub mod xrp;

/// Minimal JSON-RPC 2.0 client over HTTP.
pub struct RpcClient {
    client: reqwest::Client,
    url: reqwest::Url,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: reqwest::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, RailError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| RailError::Transient(format!("rpc transport: {err}")))?;
        if response.status().is_server_error() {
            return Err(RailError::Transient(format!(
                "rpc status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| RailError::Transient(format!("rpc body: {err}")))?;
        if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
            let code = error["code"].as_i64().unwrap_or_default();
            let message = error["message"].as_str().unwrap_or("unknown rpc error");
            // Geth-style -32000 covers transient conditions like temporary
            // nonce races; definite reverts come back as execution errors.
            return if message.contains("revert") || message.contains("execution") {
                Err(RailError::Rejected(format!("rpc {code}: {message}")))
            } else {
                Err(RailError::Transient(format!("rpc {code}: {message}")))
            };
        }
        serde_json::from_value(body["result"].clone())
            .map_err(|err| RailError::Rejected(format!("rpc result shape: {err}")))
    }
}

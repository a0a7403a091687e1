//! XRP Ledger payment channels over the XRPL WebSocket API.
//!
//! Channel claims are signed locally through the key manager (`CLM\0`
//! payloads); transaction submission uses the server-side signing form of
//! the `submit` command, which keeps the XRPL binary codec out of this
//! crate.

use {
    crate::domain::{
        eth::U256,
        settlement::{
            BalanceProof, ChannelId, ChannelLedger, ChannelState, ChannelStatus, Method, RailError,
        },
    },
    async_trait::async_trait,
    dashmap::DashMap,
    futures::{SinkExt, StreamExt},
    serde::Deserialize,
    std::time::Duration,
    tokio_tungstenite::tungstenite::Message,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub wss_url: String,
    /// Our account (the channel source).
    pub account: String,
    /// Hex public key of the channel key, `ED`-prefixed for ed25519.
    pub public_key: String,
    /// The key-manager id used to sign channel claims.
    pub key_id: String,
    /// Seconds the peer has to respond to a close request.
    #[serde(default = "default_settle_delay")]
    pub settle_delay: u32,
    /// Secret for server-side signing; falls back to `XRPL_SECRET`.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_settle_delay() -> u32 {
    86_400
}

pub struct XrpChannels {
    config: Config,
    /// XRPL claims carry no nonce; this mirrors the engine's monotonic
    /// nonces per channel so state reads stay consistent.
    nonces: DashMap<ChannelId, u64>,
}

impl XrpChannels {
    pub fn new(config: Config) -> Result<Self, RailError> {
        if config.account.is_empty() || config.public_key.is_empty() {
            return Err(RailError::Rejected(
                "xrp: account and public-key are required".to_owned(),
            ));
        }
        Ok(Self {
            config,
            nonces: DashMap::new(),
        })
    }

    fn secret(&self) -> Result<String, RailError> {
        self.config
            .secret
            .clone()
            .or_else(|| std::env::var("XRPL_SECRET").ok())
            .ok_or_else(|| RailError::Rejected("xrp: no signing secret available".to_owned()))
    }

    /// One request/response exchange on a fresh connection. XRPL responses
    /// echo the request id.
    async fn request(&self, mut body: serde_json::Value) -> Result<serde_json::Value, RailError> {
        let (mut socket, _) = tokio_tungstenite::connect_async(self.config.wss_url.as_str())
            .await
            .map_err(|err| RailError::Transient(format!("xrpl connect: {err}")))?;
        body["id"] = serde_json::json!(1);
        socket
            .send(Message::Text(body.to_string()))
            .await
            .map_err(|err| RailError::Transient(format!("xrpl send: {err}")))?;

        let response = loop {
            let message = match socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(RailError::Transient(format!("xrpl read: {err}"))),
                None => return Err(RailError::Transient("xrpl closed early".to_owned())),
            };
            let Message::Text(text) = message else {
                continue;
            };
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|err| RailError::Rejected(format!("xrpl sent bad json: {err}")))?;
            if parsed["id"] == serde_json::json!(1) {
                break parsed;
            }
        };
        let _ = socket.close(None).await;

        if response["status"] == serde_json::json!("success") {
            Ok(response["result"].clone())
        } else {
            let error = response["error_message"]
                .as_str()
                .or_else(|| response["error"].as_str())
                .unwrap_or("unknown xrpl error");
            Err(RailError::Rejected(format!("xrpl: {error}")))
        }
    }

    async fn submit(&self, tx_json: serde_json::Value) -> Result<serde_json::Value, RailError> {
        let result = self
            .request(serde_json::json!({
                "command": "submit",
                "secret": self.secret()?,
                "tx_json": tx_json,
            }))
            .await?;
        let engine_result = result["engine_result"].as_str().unwrap_or_default();
        match engine_result {
            result_code if result_code.starts_with("tes") => Ok(result),
            // tel/ter class results are local/retriable.
            result_code if result_code.starts_with("tel") || result_code.starts_with("ter") => {
                Err(RailError::Transient(format!("xrpl engine: {result_code}")))
            }
            result_code => Err(RailError::Rejected(format!("xrpl engine: {result_code}"))),
        }
    }

    async fn find_channel(
        &self,
        destination: Option<&str>,
        channel: Option<&ChannelId>,
    ) -> Result<Option<serde_json::Value>, RailError> {
        let result = self
            .request(serde_json::json!({
                "command": "account_channels",
                "account": self.config.account,
            }))
            .await?;
        let channels = result["channels"].as_array().cloned().unwrap_or_default();
        Ok(channels.into_iter().find(|entry| {
            let matches_destination = destination
                .map(|destination| entry["destination_account"] == serde_json::json!(destination))
                .unwrap_or(true);
            let matches_id = channel
                .map(|channel| entry["channel_id"] == serde_json::json!(channel.as_str()))
                .unwrap_or(true);
            matches_destination && matches_id
        }))
    }
}

fn drops(value: &serde_json::Value) -> u64 {
    value
        .as_str()
        .and_then(|drops| drops.parse().ok())
        .or_else(|| value.as_u64())
        .unwrap_or_default()
}

#[async_trait]
impl ChannelLedger for XrpChannels {
    fn method(&self) -> Method {
        Method::Xrp
    }

    async fn open_channel(
        &self,
        peer_address: &str,
        _settle_timeout: Duration,
        initial_deposit: U256,
    ) -> Result<ChannelId, RailError> {
        let amount: u64 = initial_deposit.try_into().unwrap_or(u64::MAX);
        self.submit(serde_json::json!({
            "TransactionType": "PaymentChannelCreate",
            "Account": self.config.account,
            "Destination": peer_address,
            "Amount": amount.to_string(),
            "SettleDelay": self.config.settle_delay,
            "PublicKey": self.config.public_key,
        }))
        .await?;

        // The channel id is derived server-side; read it back.
        for _ in 0..10 {
            if let Some(entry) = self.find_channel(Some(peer_address), None).await? {
                if let Some(channel_id) = entry["channel_id"].as_str() {
                    return Ok(ChannelId::new(channel_id));
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(RailError::ChannelNotFound)
    }

    async fn deposit(&self, channel: &ChannelId, amount: U256) -> Result<(), RailError> {
        let amount: u64 = amount.try_into().unwrap_or(u64::MAX);
        self.submit(serde_json::json!({
            "TransactionType": "PaymentChannelFund",
            "Account": self.config.account,
            "Channel": channel.as_str(),
            "Amount": amount.to_string(),
        }))
        .await?;
        Ok(())
    }

    async fn channel_state(&self, channel: &ChannelId) -> Result<Option<ChannelState>, RailError> {
        let Some(entry) = self.find_channel(None, Some(channel)).await? else {
            return Ok(None);
        };
        let deposit = drops(&entry["amount"]);
        let claimed = drops(&entry["balance"]);
        let nonce = self.nonces.get(channel).map(|nonce| *nonce).unwrap_or(0);
        Ok(Some(ChannelState {
            channel_id: channel.clone(),
            status: ChannelStatus::Active,
            my_deposit: U256::from(deposit),
            their_deposit: U256::ZERO,
            my_transferred: U256::from(claimed),
            their_transferred: U256::ZERO,
            my_nonce: nonce,
            their_nonce: 0,
        }))
    }

    async fn submit_claim(&self, proof: &BalanceProof) -> Result<(), RailError> {
        let balance: u64 = proof.transferred.try_into().unwrap_or(u64::MAX);
        {
            let nonce = self.nonces.get(&proof.channel_id).map(|nonce| *nonce);
            if let Some(nonce) = nonce {
                if proof.nonce <= nonce {
                    return Err(RailError::NonceConflict);
                }
            }
        }
        self.submit(serde_json::json!({
            "TransactionType": "PaymentChannelClaim",
            "Account": self.config.account,
            "Channel": proof.channel_id.as_str(),
            "Balance": balance.to_string(),
            "Signature": hex::encode_upper(&proof.signature),
            "PublicKey": self.config.public_key,
        }))
        .await?;
        self.nonces.insert(proof.channel_id.clone(), proof.nonce);
        Ok(())
    }

    /// Two-phase close: this requests the close; the channel only settles
    /// once `settle_delay` has elapsed without a higher claim.
    async fn close_channel(&self, channel: &ChannelId) -> Result<(), RailError> {
        const TF_CLOSE: u32 = 0x0002_0000;
        self.submit(serde_json::json!({
            "TransactionType": "PaymentChannelClaim",
            "Account": self.config.account,
            "Channel": channel.as_str(),
            "Flags": TF_CLOSE,
        }))
        .await?;
        Ok(())
    }

    async fn wallet_balance(&self) -> Result<U256, RailError> {
        let result = self
            .request(serde_json::json!({
                "command": "account_info",
                "account": self.config.account,
            }))
            .await?;
        Ok(U256::from(drops(&result["account_data"]["Balance"])))
    }
}

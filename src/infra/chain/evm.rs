//! EVM payment channels against a token-network style contract, over raw
//! JSON-RPC with locally signed legacy transactions.

use {
    super::RpcClient,
    crate::{
        domain::{
            eth::{keccak256, Address, ChainId, ContractAddress, TokenAddress, U256},
            settlement::{
                BalanceProof, ChannelId, ChannelLedger, ChannelState, ChannelStatus, Method,
                RailError,
            },
        },
        infra::keys::evm::EvmSigner,
    },
    async_trait::async_trait,
    serde::Deserialize,
    serde_with::serde_as,
    std::time::Duration,
};

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub rpc_url: reqwest::Url,
    pub chain_id: u64,
    /// The channel contract.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub contract: Address,
    /// ERC20 the channels are denominated in; `None` means native coin.
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    pub token: Option<Address>,
    /// The key-manager id of the account key.
    pub key_id: String,
    /// Optional sanity check: the account address the operator expects the
    /// key to resolve to (`EVM_ADDRESS`).
    #[serde(default)]
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    pub expected_address: Option<Address>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// How long to poll for a transaction receipt before calling it lost.
    #[serde(with = "humantime_serde", default = "default_confirm_timeout")]
    pub confirm_timeout: Duration,
}

fn default_gas_limit() -> u64 {
    500_000
}

fn default_confirm_timeout() -> Duration {
    Duration::from_secs(120)
}

pub struct EvmChannels {
    rpc: RpcClient,
    signer: EvmSigner,
    own_address: Address,
    chain_id: ChainId,
    contract: ContractAddress,
    token: Option<TokenAddress>,
    gas_limit: u64,
    confirm_timeout: Duration,
}

impl EvmChannels {
    pub async fn new(config: Config, signer: EvmSigner) -> Result<Self, RailError> {
        let own_address = signer
            .address()
            .await
            .map_err(|err| RailError::Rejected(format!("cannot derive account address: {err}")))?;
        if let Some(expected) = config.expected_address {
            if expected != own_address {
                return Err(RailError::Rejected(format!(
                    "configured EVM_ADDRESS {expected:?} does not match key-derived {own_address:?}"
                )));
            }
        }
        Ok(Self {
            rpc: RpcClient::new(config.rpc_url),
            signer,
            own_address,
            chain_id: ChainId(config.chain_id),
            contract: ContractAddress(config.contract),
            token: config.token.map(TokenAddress),
            gas_limit: config.gas_limit,
            confirm_timeout: config.confirm_timeout,
        })
    }

    pub fn own_address(&self) -> Address {
        self.own_address
    }

    async fn eth_call(&self, data: Vec<u8>) -> Result<Vec<u8>, RailError> {
        let result: String = self
            .rpc
            .call(
                "eth_call",
                serde_json::json!([
                    {"to": format!("{:?}", self.contract.0), "data": hex_data(&data)},
                    "latest",
                ]),
            )
            .await?;
        decode_hex(&result)
    }

    async fn send_transaction(&self, data: Vec<u8>, value: U256) -> Result<(), RailError> {
        let nonce: String = self
            .rpc
            .call(
                "eth_getTransactionCount",
                serde_json::json!([format!("{:?}", self.own_address), "pending"]),
            )
            .await?;
        let nonce = parse_quantity(&nonce)?;
        let gas_price: String = self.rpc.call("eth_gasPrice", serde_json::json!([])).await?;
        let gas_price = parse_quantity(&gas_price)?;

        let unsigned = rlp_list(&[
            rlp_uint(nonce),
            rlp_uint(gas_price),
            rlp_uint(U256::from(self.gas_limit)),
            rlp_bytes(self.contract.0.as_slice()),
            rlp_uint(value),
            rlp_bytes(&data),
            rlp_uint(U256::from(self.chain_id.0)),
            rlp_uint(U256::ZERO),
            rlp_uint(U256::ZERO),
        ]);
        let signature = self
            .signer
            .sign_hash(keccak256(&unsigned))
            .await
            .map_err(|err| RailError::Rejected(format!("transaction signing: {err}")))?;

        // EIP-155: v = recovery + 35 + 2 * chain_id.
        let v = u64::from(signature[64] - 27) + 35 + 2 * self.chain_id.0;
        let signed = rlp_list(&[
            rlp_uint(nonce),
            rlp_uint(gas_price),
            rlp_uint(U256::from(self.gas_limit)),
            rlp_bytes(self.contract.0.as_slice()),
            rlp_uint(value),
            rlp_bytes(&data),
            rlp_uint(U256::from(v)),
            rlp_uint(U256::from_be_slice(&signature[..32])),
            rlp_uint(U256::from_be_slice(&signature[32..64])),
        ]);

        let hash: String = self
            .rpc
            .call("eth_sendRawTransaction", serde_json::json!([hex_data(&signed)]))
            .await?;
        self.await_receipt(&hash).await
    }

    async fn await_receipt(&self, hash: &str) -> Result<(), RailError> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        loop {
            let receipt: serde_json::Value = self
                .rpc
                .call("eth_getTransactionReceipt", serde_json::json!([hash]))
                .await?;
            if !receipt.is_null() {
                return match receipt["status"].as_str() {
                    Some("0x1") => Ok(()),
                    status => Err(RailError::Rejected(format!(
                        "transaction {hash} reverted (status {status:?})"
                    ))),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RailError::Transient(format!(
                    "transaction {hash} unconfirmed after {:?}",
                    self.confirm_timeout
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    fn parse_peer(&self, peer_address: &str) -> Result<Address, RailError> {
        peer_address
            .parse()
            .map_err(|_| RailError::Rejected(format!("bad EVM peer address {peer_address:?}")))
    }
}

#[async_trait]
impl ChannelLedger for EvmChannels {
    fn method(&self) -> Method {
        Method::Evm
    }

    async fn open_channel(
        &self,
        peer_address: &str,
        settle_timeout: Duration,
        initial_deposit: U256,
    ) -> Result<ChannelId, RailError> {
        let peer = self.parse_peer(peer_address)?;
        let mut data = selector("openChannel(address,address,uint256,uint256)");
        data.extend_from_slice(&word_address(peer));
        data.extend_from_slice(&word_address(self.token.map(|token| token.0).unwrap_or_default()));
        data.extend_from_slice(&U256::from(settle_timeout.as_secs()).to_be_bytes::<32>());
        data.extend_from_slice(&initial_deposit.to_be_bytes::<32>());
        let value = if self.token.is_none() {
            initial_deposit
        } else {
            U256::ZERO
        };
        self.send_transaction(data, value).await?;

        let mut query = selector("getChannelId(address,address,address)");
        query.extend_from_slice(&word_address(self.own_address));
        query.extend_from_slice(&word_address(peer));
        query.extend_from_slice(&word_address(self.token.map(|token| token.0).unwrap_or_default()));
        let raw = self.eth_call(query).await?;
        if raw.len() < 32 || raw[..32] == [0; 32] {
            return Err(RailError::ChannelNotFound);
        }
        Ok(ChannelId::new(format!("0x{}", hex::encode(&raw[..32]))))
    }

    async fn deposit(&self, channel: &ChannelId, amount: U256) -> Result<(), RailError> {
        let mut data = selector("deposit(bytes32,uint256)");
        data.extend_from_slice(&channel_word(channel)?);
        data.extend_from_slice(&amount.to_be_bytes::<32>());
        let value = if self.token.is_none() { amount } else { U256::ZERO };
        self.send_transaction(data, value).await
    }

    async fn channel_state(&self, channel: &ChannelId) -> Result<Option<ChannelState>, RailError> {
        let mut data = selector("channelInfo(bytes32,address)");
        data.extend_from_slice(&channel_word(channel)?);
        data.extend_from_slice(&word_address(self.own_address));
        let raw = self.eth_call(data).await?;
        if raw.len() < 7 * 32 {
            return Ok(None);
        }
        let word = |i: usize| U256::from_be_slice(&raw[i * 32..(i + 1) * 32]);
        let status = match word(0).try_into().unwrap_or(u64::MAX) {
            0_u64 => return Ok(None),
            1 => ChannelStatus::Active,
            2 => ChannelStatus::Settling,
            3 => ChannelStatus::Settled,
            _ => ChannelStatus::Failed,
        };
        Ok(Some(ChannelState {
            channel_id: channel.clone(),
            status,
            my_deposit: word(1),
            their_deposit: word(2),
            my_transferred: word(3),
            their_transferred: word(4),
            my_nonce: word(5).try_into().unwrap_or(u64::MAX),
            their_nonce: word(6).try_into().unwrap_or(u64::MAX),
        }))
    }

    async fn submit_claim(&self, proof: &BalanceProof) -> Result<(), RailError> {
        let mut data = selector("updateBalanceProof(bytes32,uint256,uint256,bytes32,bytes)");
        data.extend_from_slice(&channel_word(&proof.channel_id)?);
        data.extend_from_slice(&U256::from(proof.nonce).to_be_bytes::<32>());
        data.extend_from_slice(&proof.transferred.to_be_bytes::<32>());
        data.extend_from_slice(proof.locks_root.as_slice());
        // Tail-encoded dynamic bytes: offset from the start of the args.
        data.extend_from_slice(&U256::from(5 * 32).to_be_bytes::<32>());
        data.extend_from_slice(&encode_bytes(&proof.signature));
        match self.send_transaction(data, U256::ZERO).await {
            Err(RailError::Rejected(message)) if message.contains("nonce") => {
                Err(RailError::NonceConflict)
            }
            other => other,
        }
    }

    async fn close_channel(&self, channel: &ChannelId) -> Result<(), RailError> {
        let mut data = selector("closeChannel(bytes32)");
        data.extend_from_slice(&channel_word(channel)?);
        self.send_transaction(data, U256::ZERO).await
    }

    async fn wallet_balance(&self) -> Result<U256, RailError> {
        match self.token {
            Some(token) => {
                let mut data = selector("balanceOf(address)");
                data.extend_from_slice(&word_address(self.own_address));
                let result: String = self
                    .rpc
                    .call(
                        "eth_call",
                        serde_json::json!([
                            {"to": format!("{:?}", token.0), "data": hex_data(&data)},
                            "latest",
                        ]),
                    )
                    .await?;
                let raw = decode_hex(&result)?;
                Ok(U256::from_be_slice(&raw))
            }
            None => {
                let result: String = self
                    .rpc
                    .call(
                        "eth_getBalance",
                        serde_json::json!([format!("{:?}", self.own_address), "latest"]),
                    )
                    .await?;
                parse_quantity(&result)
            }
        }
    }
}

fn selector(signature: &str) -> Vec<u8> {
    keccak256(signature.as_bytes())[..4].to_vec()
}

fn word_address(address: Address) -> [u8; 32] {
    let mut word = [0_u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

fn channel_word(channel: &ChannelId) -> Result<[u8; 32], RailError> {
    let raw = hex::decode(channel.as_str().trim_start_matches("0x"))
        .map_err(|_| RailError::Rejected(format!("channel id {channel} is not hex")))?;
    raw.try_into()
        .map_err(|_| RailError::Rejected(format!("channel id {channel} is not 32 bytes")))
}

/// ABI tail encoding for `bytes`: length word plus right-padded content.
fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = U256::from(data.len()).to_be_bytes::<32>().to_vec();
    out.extend_from_slice(data);
    let padding = (32 - data.len() % 32) % 32;
    out.extend(std::iter::repeat(0).take(padding));
    out
}

fn hex_data(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

fn decode_hex(data: &str) -> Result<Vec<u8>, RailError> {
    hex::decode(data.trim_start_matches("0x"))
        .map_err(|err| RailError::Rejected(format!("rpc returned bad hex: {err}")))
}

fn parse_quantity(data: &str) -> Result<U256, RailError> {
    let digits = data.trim_start_matches("0x");
    U256::from_str_radix(digits, 16)
        .map_err(|err| RailError::Rejected(format!("rpc returned bad quantity: {err}")))
}

/// Minimal RLP: only the forms a legacy transaction needs.
fn rlp_uint(value: U256) -> Vec<u8> {
    if value == U256::ZERO {
        return vec![0x80];
    }
    let bytes = value.to_be_bytes::<32>();
    let first = bytes.iter().position(|byte| *byte != 0).unwrap_or(31);
    rlp_bytes(&bytes[first..])
}

fn rlp_bytes(data: &[u8]) -> Vec<u8> {
    match data.len() {
        1 if data[0] < 0x80 => data.to_vec(),
        len if len <= 55 => {
            let mut out = vec![0x80 + len as u8];
            out.extend_from_slice(data);
            out
        }
        len => {
            let len_bytes = be_trimmed(len as u64);
            let mut out = vec![0xb7 + len_bytes.len() as u8];
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(data);
            out
        }
    }
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flatten().copied().collect();
    let mut out = if payload.len() <= 55 {
        vec![0xc0 + payload.len() as u8]
    } else {
        let len_bytes = be_trimmed(payload.len() as u64);
        let mut head = vec![0xf7 + len_bytes.len() as u8];
        head.extend_from_slice(&len_bytes);
        head
    };
    out.extend_from_slice(&payload);
    out
}

fn be_trimmed(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|byte| *byte != 0).unwrap_or(7);
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlp_encodes_the_known_forms() {
        assert_eq!(rlp_uint(U256::ZERO), vec![0x80]);
        assert_eq!(rlp_uint(U256::from(0x7f_u64)), vec![0x7f]);
        assert_eq!(rlp_uint(U256::from(0x80_u64)), vec![0x81, 0x80]);
        assert_eq!(rlp_uint(U256::from(1024_u64)), vec![0x82, 0x04, 0x00]);
        assert_eq!(rlp_bytes(b""), vec![0x80]);
        assert_eq!(rlp_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(
            rlp_list(&[rlp_bytes(b"cat"), rlp_bytes(b"dog")]),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'],
        );

        let long = vec![0xaa_u8; 60];
        let encoded = rlp_bytes(&long);
        assert_eq!(encoded[0], 0xb8);
        assert_eq!(encoded[1], 60);
        assert_eq!(&encoded[2..], &long[..]);
    }

    #[test]
    fn selectors_match_known_vectors() {
        // keccak("transfer(address,uint256)")[..4] is the canonical example.
        assert_eq!(selector("transfer(address,uint256)"), vec![0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("balanceOf(address)"), vec![0x70, 0xa0, 0x82, 0x31]);
    }

    #[test]
    fn byte_tails_are_padded_to_words() {
        let encoded = encode_bytes(&[1, 2, 3]);
        assert_eq!(encoded.len(), 64);
        assert_eq!(U256::from_be_slice(&encoded[..32]), U256::from(3_u64));
        assert_eq!(&encoded[32..35], &[1, 2, 3]);
        assert!(encoded[35..].iter().all(|byte| *byte == 0));

        assert_eq!(encode_bytes(&[0; 32]).len(), 64);
    }

    #[test]
    fn quantities_parse_from_rpc_hex() {
        assert_eq!(parse_quantity("0x0").unwrap(), U256::ZERO);
        assert_eq!(parse_quantity("0x4a817c800").unwrap(), U256::from(20_000_000_000_u64));
        assert!(parse_quantity("0xzz").is_err());
    }
}

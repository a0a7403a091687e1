//! Settlement of accrued bilateral imbalances through payment channels.
//!
//! The engine owns the settlement state machine per `(peer, asset, method)`.
//! Chain access goes through the [`ChannelLedger`] seam so the embedded
//! ledger SDKs stay out of the core; proof signing goes through
//! [`ProofSigner`] so no private material is ever seen here.

use {
    crate::{
        domain::{
            account::{AccountKey, AssetId, PeerId},
            eth::U256,
            ledger::Ledger,
            telemetry,
        },
        infra::telemetry::Broker,
        util::retry::{self, Backoff, Retryable, TimedOut},
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    serde_with::serde_as,
    std::{
        collections::HashMap,
        fmt::{self, Debug, Display, Formatter},
        future::Future,
        sync::Arc,
        time::Duration,
    },
    tokio::sync::mpsc,
};

pub mod proof;
pub mod threshold;

pub use proof::BalanceProof;

/// Settlement rail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Evm,
    Xrp,
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Method::Evm => f.write_str("evm"),
            Method::Xrp => f.write_str("xrp"),
        }
    }
}

/// Identifier of a payment channel as reported by its rail. 32-byte hex on
/// both supported rails, treated as opaque elsewhere.
#[derive(Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Opening,
    Active,
    Settling,
    Settled,
    Failed,
}

/// A payment channel as this node tracks it.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: ChannelId,
    pub method: Method,
    pub peer_id: PeerId,
    pub asset: AssetId,
    #[serde_as(as = "crate::util::serialize::U256")]
    pub my_deposit: U256,
    #[serde_as(as = "crate::util::serialize::U256")]
    pub their_deposit: U256,
    pub my_nonce: u64,
    pub their_nonce: u64,
    #[serde_as(as = "crate::util::serialize::U256")]
    pub my_transferred: U256,
    #[serde_as(as = "crate::util::serialize::U256")]
    pub their_transferred: U256,
    pub status: ChannelStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// On-ledger view of a channel as reported by its rail.
#[derive(Clone, Debug)]
pub struct ChannelState {
    pub channel_id: ChannelId,
    pub status: ChannelStatus,
    pub my_deposit: U256,
    pub their_deposit: U256,
    pub my_transferred: U256,
    pub their_transferred: U256,
    pub my_nonce: u64,
    pub their_nonce: u64,
}

/// Errors surfaced by a settlement rail.
#[derive(Debug, thiserror::Error)]
pub enum RailError {
    #[error("channel not found")]
    ChannelNotFound,
    #[error("claim nonce already used")]
    NonceConflict,
    #[error(transparent)]
    Timeout(#[from] TimedOut),
    #[error("transient rail error: {0}")]
    Transient(String),
    #[error("rail rejected the request: {0}")]
    Rejected(String),
}

impl Retryable for RailError {
    fn retryable(&self) -> bool {
        matches!(self, RailError::Timeout(_) | RailError::Transient(_))
    }
}

/// How a settlement rail exposes payment channels to the engine. One
/// implementation per chain lives in `infra::chain`.
#[async_trait]
pub trait ChannelLedger: Send + Sync + 'static {
    fn method(&self) -> Method;

    /// Opens and funds a channel towards `peer_address`, returning its id.
    async fn open_channel(
        &self,
        peer_address: &str,
        settle_timeout: Duration,
        initial_deposit: U256,
    ) -> Result<ChannelId, RailError>;

    async fn deposit(&self, channel: &ChannelId, amount: U256) -> Result<(), RailError>;

    /// `None` when the rail has no record of the channel.
    async fn channel_state(&self, channel: &ChannelId) -> Result<Option<ChannelState>, RailError>;

    /// Transmits a signed balance proof. Submitting the same
    /// `(channel, nonce)` twice must fail with [`RailError::NonceConflict`],
    /// which the engine treats as already applied.
    async fn submit_claim(&self, proof: &BalanceProof) -> Result<(), RailError>;

    async fn close_channel(&self, channel: &ChannelId) -> Result<(), RailError>;

    async fn wallet_balance(&self) -> Result<U256, RailError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signing backend unavailable: {0}")]
    Unavailable(String),
    #[error("signing rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Timeout(#[from] TimedOut),
}

impl Retryable for SignError {
    fn retryable(&self) -> bool {
        matches!(self, SignError::Unavailable(_) | SignError::Timeout(_))
    }
}

/// Signs balance proofs with the configured key backend.
#[async_trait]
pub trait ProofSigner: Send + Sync + 'static {
    async fn sign_balance_proof(
        &self,
        method: Method,
        proof: &mut BalanceProof,
    ) -> Result<(), SignError>;
}

/// Trigger published by the threshold monitor.
#[derive(Clone, Debug)]
pub struct SettlementRequired {
    pub peer: PeerId,
    pub asset: AssetId,
    pub amount: U256,
}

/// Channels known to this node, serving the control API and telemetry
/// hydration snapshots.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Channel>,
}

impl ChannelRegistry {
    pub fn insert(&self, channel: Channel) {
        self.channels.insert(channel.channel_id.clone(), channel);
    }

    pub fn update(&self, channel_id: &ChannelId, apply: impl FnOnce(&mut Channel)) {
        if let Some(mut channel) = self.channels.get_mut(channel_id) {
            apply(&mut channel);
        }
    }

    pub fn snapshot(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        channels.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        channels
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub default_initial_deposit: U256,
    pub settle_timeout: Duration,
    /// Extra percentage funded on top of a required deposit top-up.
    pub deposit_headroom_pct: u32,
    pub retry: Backoff,
    pub call_timeout: Duration,
    /// Preferred rails, most preferred first; XRP-denominated accounts pin
    /// to the XRP rail when it is configured.
    pub preference: Vec<Method>,
    /// Per-(peer, method) on-chain counterparty addresses.
    pub peer_addresses: HashMap<(PeerId, Method), String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_initial_deposit: U256::from(1_000_000_u64),
            settle_timeout: Duration::from_secs(3600),
            deposit_headroom_pct: 20,
            retry: Backoff::default(),
            call_timeout: Duration::from_secs(30),
            preference: vec![Method::Evm, Method::Xrp],
            peer_addresses: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("no on-chain address configured for peer")]
    UnknownPeerAddress,
    #[error("no settlement rail configured for this account")]
    RailUnavailable,
    #[error("channel disappeared between rail calls")]
    ChannelVanished,
    #[error(transparent)]
    Rail(#[from] RailError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

type SerializerKey = (PeerId, AssetId, Method);

pub struct Engine {
    config: Config,
    ledger: Arc<Ledger>,
    rails: HashMap<Method, Arc<dyn ChannelLedger>>,
    signer: Arc<dyn ProofSigner>,
    channels: Arc<ChannelRegistry>,
    cache: moka::future::Cache<SerializerKey, ChannelId>,
    in_progress: DashMap<SerializerKey, ()>,
    broker: Arc<Broker>,
}

impl Engine {
    pub fn new(
        config: Config,
        ledger: Arc<Ledger>,
        rails: HashMap<Method, Arc<dyn ChannelLedger>>,
        signer: Arc<dyn ProofSigner>,
        channels: Arc<ChannelRegistry>,
        broker: Arc<Broker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ledger,
            rails,
            signer,
            channels,
            cache: moka::future::Cache::new(1024),
            in_progress: DashMap::new(),
            broker,
        })
    }

    /// Drains the trigger queue, one task per settlement attempt. Attempts
    /// for the same `(peer, asset, method)` are serialized by the
    /// duplicate-suppression map.
    pub fn spawn(self: &Arc<Self>, mut triggers: mpsc::Receiver<SettlementRequired>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.handle(trigger).await });
            }
        })
    }

    pub async fn handle(&self, trigger: SettlementRequired) {
        let Some(method) = self.method_for(&trigger.asset) else {
            tracing::error!(peer = %trigger.peer, asset = %trigger.asset, "no settlement rail for account");
            self.fail(&trigger, "no settlement rail configured").await;
            return;
        };
        let key = (trigger.peer.clone(), trigger.asset.clone(), method);
        if self.in_progress.insert(key.clone(), ()).is_some() {
            tracing::debug!(peer = %trigger.peer, asset = %trigger.asset, %method, "settlement already in progress, dropping trigger");
            return;
        }

        let result = self.attempt(&trigger, method).await;
        self.in_progress.remove(&key);

        match result {
            Ok(()) => crate::infra::metrics::settlement("completed"),
            Err(err) => {
                tracing::warn!(peer = %trigger.peer, asset = %trigger.asset, %method, ?err, "settlement attempt failed");
                crate::infra::metrics::settlement("failed");
                self.fail(&trigger, &err.to_string()).await;
            }
        }
    }

    async fn fail(&self, trigger: &SettlementRequired, reason: &str) {
        let key = AccountKey {
            peer: trigger.peer.clone(),
            asset: trigger.asset.clone(),
        };
        self.ledger.abort_settlement(&key).await;
        self.broker.emit(telemetry::Kind::SettlementFailed {
            peer_id: trigger.peer.clone(),
            asset: trigger.asset.clone(),
            reason: reason.to_owned(),
        });
    }

    async fn attempt(&self, trigger: &SettlementRequired, method: Method) -> Result<(), AttemptError> {
        let account_key = AccountKey {
            peer: trigger.peer.clone(),
            asset: trigger.asset.clone(),
        };
        self.ledger.mark_in_progress(&account_key).await;
        self.broker.emit(telemetry::Kind::SettlementPending {
            peer_id: trigger.peer.clone(),
            asset: trigger.asset.clone(),
            amount: trigger.amount,
        });

        let peer_address = self
            .config
            .peer_addresses
            .get(&(trigger.peer.clone(), method))
            .cloned()
            .ok_or(AttemptError::UnknownPeerAddress)?;
        let rail = self
            .rails
            .get(&method)
            .cloned()
            .ok_or(AttemptError::RailUnavailable)?;

        let state = self
            .locate_or_open(trigger, method, rail.as_ref(), &peer_address)
            .await?;

        let state = self
            .ensure_deposit(trigger, rail.as_ref(), state)
            .await?;

        // Cumulative claim at the next nonce. Re-submitting after a lost
        // reply hits the rail's nonce conflict, which counts as applied.
        let unsigned = BalanceProof::new(
            state.channel_id.clone(),
            state.my_nonce + 1,
            state.my_transferred.saturating_add(trigger.amount),
        );
        let proof = retry::retry(&self.config.retry, |_| {
            let mut attempt = unsigned.clone();
            async move {
                self.signer
                    .sign_balance_proof(method, &mut attempt)
                    .await
                    .map(|()| attempt)
            }
        })
        .await?;

        match self.call(|| rail.submit_claim(&proof)).await {
            Ok(()) => {}
            Err(RailError::NonceConflict) => {
                tracing::warn!(channel = %proof.channel_id, nonce = proof.nonce, "claim already applied on rail");
            }
            Err(err) => return Err(err.into()),
        }

        match method {
            Method::Evm => self.broker.emit(telemetry::Kind::PaymentChannelBalanceUpdate {
                channel_id: proof.channel_id.clone(),
                nonce: proof.nonce,
                transferred: proof.transferred,
            }),
            Method::Xrp => self.broker.emit(telemetry::Kind::XrpChannelClaimed {
                channel_id: proof.channel_id.clone(),
                drops: proof.transferred.try_into().unwrap_or(u64::MAX),
                nonce: proof.nonce,
            }),
        }

        self.ledger
            .record_settlement(&trigger.peer, &trigger.asset, trigger.amount)
            .await;
        self.channels.update(&proof.channel_id, |channel| {
            channel.my_nonce = proof.nonce;
            channel.my_transferred = proof.transferred;
            channel.my_deposit = state.my_deposit;
        });

        self.broker.emit(telemetry::Kind::SettlementCompleted {
            peer_id: trigger.peer.clone(),
            asset: trigger.asset.clone(),
            amount: trigger.amount,
            method,
            channel_id: proof.channel_id.clone(),
            nonce: proof.nonce,
        });
        if let Some(account) = self.ledger.snapshot(&trigger.peer, &trigger.asset).await {
            self.broker.emit(telemetry::Kind::AccountBalance {
                peer_id: trigger.peer.clone(),
                asset: trigger.asset.clone(),
                credit_balance: account.credit_balance,
                debit_balance: account.debit_balance,
                net_balance: account.net_balance.to_string(),
            });
        }
        Ok(())
    }

    /// Reuses the cached channel when the rail still reports it active,
    /// otherwise opens a fresh one funded for at least twice the settlement.
    async fn locate_or_open(
        &self,
        trigger: &SettlementRequired,
        method: Method,
        rail: &dyn ChannelLedger,
        peer_address: &str,
    ) -> Result<ChannelState, AttemptError> {
        let cache_key = (trigger.peer.clone(), trigger.asset.clone(), method);
        if let Some(channel_id) = self.cache.get(&cache_key).await {
            match self.call(|| rail.channel_state(&channel_id)).await? {
                Some(state) if state.status == ChannelStatus::Active => {
                    self.broker.emit(telemetry::Kind::ChannelReused {
                        channel_id: channel_id.clone(),
                        peer_id: trigger.peer.clone(),
                    });
                    return Ok(state);
                }
                stale => {
                    tracing::info!(channel = %channel_id, ?stale, "cached channel no longer usable");
                    self.cache.invalidate(&cache_key).await;
                    self.channels.update(&channel_id, |channel| {
                        channel.status = ChannelStatus::Settled;
                        channel.closed_at = Some(Utc::now());
                    });
                }
            }
        }

        let initial_deposit = self
            .config
            .default_initial_deposit
            .max(trigger.amount.saturating_mul(U256::from(2)));
        let channel_id = self
            .call(|| rail.open_channel(peer_address, self.config.settle_timeout, initial_deposit))
            .await?;
        self.cache.insert(cache_key, channel_id.clone()).await;

        let state = self
            .call(|| rail.channel_state(&channel_id))
            .await?
            .ok_or(AttemptError::ChannelVanished)?;
        self.channels.insert(Channel {
            channel_id: channel_id.clone(),
            method,
            peer_id: trigger.peer.clone(),
            asset: trigger.asset.clone(),
            my_deposit: state.my_deposit,
            their_deposit: state.their_deposit,
            my_nonce: state.my_nonce,
            their_nonce: state.their_nonce,
            my_transferred: state.my_transferred,
            their_transferred: state.their_transferred,
            status: ChannelStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        });

        match method {
            Method::Evm => self.broker.emit(telemetry::Kind::PaymentChannelOpened {
                channel_id: channel_id.clone(),
                peer_id: trigger.peer.clone(),
                asset: trigger.asset.clone(),
                initial_deposit,
            }),
            Method::Xrp => self.broker.emit(telemetry::Kind::XrpChannelOpened {
                channel_id: channel_id.clone(),
                peer_id: trigger.peer.clone(),
                drops: initial_deposit.try_into().unwrap_or(u64::MAX),
            }),
        }
        Ok(state)
    }

    /// Tops the channel up when the pending claim would exceed the deposit,
    /// with configured headroom, and re-reads the rail state afterwards.
    async fn ensure_deposit(
        &self,
        trigger: &SettlementRequired,
        rail: &dyn ChannelLedger,
        state: ChannelState,
    ) -> Result<ChannelState, AttemptError> {
        let required = state.my_transferred.saturating_add(trigger.amount);
        if required <= state.my_deposit {
            return Ok(state);
        }

        let shortfall = required - state.my_deposit;
        let top_up = shortfall
            .saturating_mul(U256::from(100 + self.config.deposit_headroom_pct))
            / U256::from(100);
        self.broker.emit(telemetry::Kind::FundingRequired {
            peer_id: trigger.peer.clone(),
            asset: trigger.asset.clone(),
            amount: top_up,
            reason: "channel deposit below pending claim".to_owned(),
        });

        self.call(|| rail.deposit(&state.channel_id, top_up)).await?;
        self.broker.emit(telemetry::Kind::ChannelDeposit {
            channel_id: state.channel_id.clone(),
            amount: top_up,
        });
        self.broker.emit(telemetry::Kind::FundingCompleted {
            peer_id: trigger.peer.clone(),
            asset: trigger.asset.clone(),
            amount: top_up,
        });

        let state = self
            .call(|| rail.channel_state(&state.channel_id))
            .await?
            .ok_or(AttemptError::ChannelVanished)?;
        Ok(state)
    }

    fn method_for(&self, asset: &AssetId) -> Option<Method> {
        if asset.as_str().eq_ignore_ascii_case("xrp") && self.rails.contains_key(&Method::Xrp) {
            return Some(Method::Xrp);
        }
        self.config
            .preference
            .iter()
            .copied()
            .find(|method| self.rails.contains_key(method))
    }

    /// Wraps one external call with the per-call timeout and the
    /// exponential-backoff retry policy.
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, RailError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RailError>>,
    {
        retry::retry(&self.config.retry, |_| {
            let fut = op();
            let timeout = self.config.call_timeout;
            async move { retry::with_timeout(timeout, fut).await }
        })
        .await
    }
}

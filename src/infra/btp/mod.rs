//! Per-peer BTP endpoints: authenticated WebSocket links carrying packets.
//!
//! Each endpoint owns a bounded send queue drained by one writer task and a
//! reader that dispatches frames in receive order. Outbound links redial
//! with jittered exponential backoff; inbound links arrive through the HTTP
//! server's upgrade handler and authenticate before anything else.

use {
    crate::{
        domain::{
            account::{AssetId, PeerId},
            packet::{code, Address, PacketId, Prepare, Reject, Reply},
            pipeline::{ForwardError, PeerDirectory, PeerLink, Pipeline},
            telemetry,
        },
        infra::{metrics, telemetry::Broker},
        util::retry,
    },
    async_trait::async_trait,
    chrono::Utc,
    dashmap::DashMap,
    futures::{Sink, SinkExt, Stream, StreamExt},
    std::{
        collections::HashMap,
        fmt::Display,
        sync::{Arc, Mutex, OnceLock},
        time::Duration,
    },
    tokio::sync::{mpsc, oneshot},
};

pub mod protocol;

use self::protocol::Frame;

/// Connection lifecycle of one endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

/// Static configuration of one peer.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub id: PeerId,
    pub secret: String,
    /// Dial this URL; `None` means the peer connects to us.
    pub url: Option<String>,
    pub asset: AssetId,
}

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub send_queue: usize,
    /// Grace period past a Prepare's expiry before the correlation entry
    /// resolves with a synthetic timeout Reject.
    pub slack: Duration,
    pub heartbeat: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            send_queue: 256,
            slack: Duration::from_secs(1),
            heartbeat: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 30,
        }
    }
}

/// One live (or redialing) peer link.
pub struct Endpoint {
    peer: PeerId,
    own_address: Address,
    tx: mpsc::Sender<Frame>,
    pending: DashMap<PacketId, oneshot::Sender<Reply>>,
    state: Mutex<State>,
    slack: Duration,
}

impl Endpoint {
    fn new(
        peer: PeerId,
        own_address: Address,
        settings: &Settings,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(settings.send_queue);
        let endpoint = Arc::new(Self {
            peer,
            own_address,
            tx,
            pending: DashMap::new(),
            state: Mutex::new(State::Disconnected),
            slack: settings.slack,
        });
        (endpoint, rx)
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }

    /// Sends a reply towards the peer. In-process callers block on a full
    /// queue instead of dropping the reply.
    pub async fn send_reply(&self, reply: Reply) {
        if self.tx.send(reply.into()).await.is_err() {
            tracing::warn!(peer = %self.peer, "endpoint gone while sending reply");
        }
    }

    /// Resolves the correlation entry for an inbound reply. Exactly one
    /// resolution wins; late replies land here after the entry is gone and
    /// are dropped.
    fn resolve(&self, reply: Reply) {
        match self.pending.remove(reply.packet_id()) {
            Some((_, sender)) => {
                let _ = sender.send(reply);
            }
            None => {
                tracing::debug!(
                    peer = %self.peer,
                    packet = %reply.packet_id(),
                    "late or unknown reply dropped"
                );
            }
        }
    }
}

#[async_trait]
impl PeerLink for Endpoint {
    async fn forward(&self, prepare: Prepare) -> Result<Reply, ForwardError> {
        let packet_id = prepare.packet_id.clone();
        let deadline = (prepare.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default()
            + self.slack;

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(packet_id.clone(), sender);

        // Forwarded packets must not block the pipeline on a congested peer.
        if let Err(err) = self.tx.try_send(Frame::from(prepare)) {
            self.pending.remove(&packet_id);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => ForwardError::Congested,
                mpsc::error::TrySendError::Closed(_) => ForwardError::Disconnected,
            });
        }

        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.remove(&packet_id);
                Err(ForwardError::Disconnected)
            }
            Err(_) => {
                self.pending.remove(&packet_id);
                Ok(Reply::Reject(Reject::new(
                    packet_id,
                    code::R00_TRANSFER_TIMED_OUT,
                    self.own_address.clone(),
                    "no reply before the transfer deadline",
                )))
            }
        }
    }
}

/// All peer endpoints of this node, plus the handshake logic for both
/// connection directions.
pub struct Registry {
    node_id: String,
    own_address: Address,
    peers: HashMap<PeerId, PeerConfig>,
    endpoints: DashMap<PeerId, Arc<Endpoint>>,
    pipeline: OnceLock<Arc<Pipeline>>,
    broker: Arc<Broker>,
    settings: Settings,
}

impl Registry {
    pub fn new(
        node_id: String,
        own_address: Address,
        peers: Vec<PeerConfig>,
        broker: Arc<Broker>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            own_address,
            peers: peers.into_iter().map(|peer| (peer.id.clone(), peer)).collect(),
            endpoints: DashMap::new(),
            pipeline: OnceLock::new(),
            broker,
            settings,
        })
    }

    /// Late-bound to break the construction cycle: the pipeline needs this
    /// registry as its peer directory.
    pub fn set_pipeline(&self, pipeline: Arc<Pipeline>) {
        if self.pipeline.set(pipeline).is_err() {
            tracing::warn!("pipeline already wired into the BTP registry");
        }
    }

    fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(self.pipeline.get().expect("pipeline wired before connections"))
    }

    fn verify_secret(&self, peer_id: &str, secret: &str) -> Option<&PeerConfig> {
        let config = self.peers.get(&PeerId::new(peer_id))?;
        constant_time_eq(config.secret.as_bytes(), secret.as_bytes()).then_some(config)
    }

    /// Dials every peer that has a configured URL.
    pub fn spawn_dialers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.peers
            .values()
            .filter(|peer| peer.url.is_some())
            .map(|peer| {
                let registry = Arc::clone(self);
                let config = peer.clone();
                tokio::spawn(async move { registry.dial_loop(config).await })
            })
            .collect()
    }

    async fn dial_loop(self: Arc<Self>, config: PeerConfig) {
        let url = config.url.clone().expect("dialer requires a peer URL");
        let (endpoint, mut rx) = Endpoint::new(
            config.id.clone(),
            self.own_address.clone(),
            &self.settings,
        );
        self.endpoints.insert(config.id.clone(), Arc::clone(&endpoint));

        let mut attempts: u32 = 0;
        loop {
            endpoint.set_state(State::Connecting);
            let outcome = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((mut socket, _)) => {
                    endpoint.set_state(State::Authenticating);
                    match self.client_handshake(&mut socket, &config).await {
                        Ok(()) => {
                            attempts = 0;
                            endpoint.set_state(State::Ready);
                            self.broker.emit(telemetry::Kind::NodeStatus {
                                status: "peer_connected".to_owned(),
                                detail: None,
                                peer_id: Some(config.id.clone()),
                            });
                            let reason = self.run_connection(&endpoint, socket, &mut rx).await;
                            format!("connection ended: {reason}")
                        }
                        Err(reason) => reason,
                    }
                }
                Err(err) => format!("dial failed: {err}"),
            };

            endpoint.set_state(State::Disconnected);
            attempts += 1;
            if attempts > self.settings.max_reconnect_attempts {
                tracing::error!(peer = %config.id, %outcome, "giving up on peer after max reconnect attempts");
                self.broker.emit(telemetry::Kind::NodeStatus {
                    status: "peer_abandoned".to_owned(),
                    detail: Some(outcome),
                    peer_id: Some(config.id.clone()),
                });
                return;
            }

            metrics::reconnect_attempt();
            let backoff = retry::Backoff {
                base: self.settings.reconnect_base,
                cap: self.settings.reconnect_cap,
                max_retries: u32::MAX,
            };
            // Half fixed, half jitter, so simultaneous restarts fan out.
            let step = backoff.delay(attempts.saturating_sub(1));
            let delay = step / 2 + retry::jittered(step / 2);
            tracing::warn!(peer = %config.id, %outcome, attempt = attempts, ?delay, "reconnecting");
            self.broker.emit(telemetry::Kind::NodeStatus {
                status: "peer_reconnecting".to_owned(),
                detail: Some(outcome),
                peer_id: Some(config.id.clone()),
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn client_handshake<S, M, E>(&self, socket: &mut S, config: &PeerConfig) -> Result<(), String>
    where
        S: Sink<M, Error = E> + Stream<Item = Result<M, E>> + Unpin,
        M: WsMessage,
        E: Display,
    {
        let auth = Frame::Auth {
            peer_id: self.node_id.clone(),
            secret: config.secret.clone(),
        };
        socket
            .send(M::from_text(auth.encode()))
            .await
            .map_err(|err| format!("auth send failed: {err}"))?;

        let response = tokio::time::timeout(self.settings.handshake_timeout, socket.next())
            .await
            .map_err(|_| "auth timed out".to_owned())?
            .ok_or_else(|| "closed during auth".to_owned())?
            .map_err(|err| format!("auth receive failed: {err}"))?;
        match response.into_text().as_deref().map(Frame::decode) {
            Some(Ok(Frame::AuthOk { .. })) => Ok(()),
            other => Err(format!("unexpected auth response: {other:?}")),
        }
    }

    /// Handles one inbound WebSocket: authenticate, register, run.
    pub async fn accept<S, M, E>(self: Arc<Self>, mut socket: S)
    where
        S: Sink<M, Error = E> + Stream<Item = Result<M, E>> + Unpin,
        M: WsMessage,
        E: Display,
    {
        let first = match tokio::time::timeout(self.settings.handshake_timeout, socket.next()).await
        {
            Ok(Some(Ok(message))) => message,
            _ => return,
        };
        let (peer_id, secret) = match first.into_text().as_deref().map(Frame::decode) {
            Some(Ok(Frame::Auth { peer_id, secret })) => (peer_id, secret),
            _ => {
                tracing::warn!("inbound connection did not start with AUTH");
                return;
            }
        };
        let Some(config) = self.verify_secret(&peer_id, &secret) else {
            tracing::warn!(peer = %peer_id, "inbound BTP authentication failed");
            return;
        };
        let config = config.clone();

        let (endpoint, mut rx) = Endpoint::new(
            config.id.clone(),
            self.own_address.clone(),
            &self.settings,
        );
        endpoint.set_state(State::Ready);
        self.endpoints.insert(config.id.clone(), Arc::clone(&endpoint));
        self.broker.emit(telemetry::Kind::NodeStatus {
            status: "peer_connected".to_owned(),
            detail: None,
            peer_id: Some(config.id.clone()),
        });

        let auth_ok = Frame::AuthOk {
            node_id: self.node_id.clone(),
        };
        if socket.send(M::from_text(auth_ok.encode())).await.is_err() {
            self.endpoints.remove(&config.id);
            return;
        }

        let reason = self.run_connection(&endpoint, socket, &mut rx).await;
        tracing::info!(peer = %config.id, %reason, "inbound BTP connection ended");
        endpoint.set_state(State::Disconnected);
        // Only deregister if a newer connection has not replaced us.
        let is_current = self
            .endpoints
            .get(&config.id)
            .map(|current| Arc::ptr_eq(current.value(), &endpoint))
            .unwrap_or(false);
        if is_current {
            self.endpoints.remove(&config.id);
        }
        self.broker.emit(telemetry::Kind::NodeStatus {
            status: "peer_disconnected".to_owned(),
            detail: Some(reason),
            peer_id: Some(config.id.clone()),
        });
    }

    /// The shared read/write loop. Frames are dispatched in receive order;
    /// Prepares are handled on their own task so a slow route never stalls
    /// the reader.
    async fn run_connection<S, M, E>(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        socket: S,
        rx: &mut mpsc::Receiver<Frame>,
    ) -> String
    where
        S: Sink<M, Error = E> + Stream<Item = Result<M, E>> + Unpin,
        M: WsMessage,
        E: Display,
    {
        let (mut sink, mut stream) = socket.split();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();
        let mut outstanding_pings: u32 = 0;

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(err) = sink.send(M::from_text(frame.encode())).await {
                            return format!("send failed: {err}");
                        }
                    }
                    None => return "endpoint dropped".to_owned(),
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(message)) => {
                        outstanding_pings = 0;
                        if message.is_close() {
                            return "peer closed".to_owned();
                        }
                        let Some(text) = message.into_text() else {
                            continue;
                        };
                        self.dispatch(endpoint, &text);
                    }
                    Some(Err(err)) => return format!("socket error: {err}"),
                    None => return "socket closed".to_owned(),
                },
                _ = heartbeat.tick() => {
                    if outstanding_pings >= 2 {
                        return "heartbeat timed out".to_owned();
                    }
                    outstanding_pings += 1;
                    if let Err(err) = sink.send(M::from_text(Frame::Ping.encode())).await {
                        return format!("ping failed: {err}");
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, endpoint: &Arc<Endpoint>, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(peer = %endpoint.peer, ?err, "dropping malformed frame");
                return;
            }
        };
        match frame {
            Frame::Prepare {
                packet_id,
                destination,
                amount,
                condition,
                expires_at,
                data,
            } => {
                let registry = Arc::clone(self);
                let endpoint = Arc::clone(endpoint);
                tokio::spawn(async move {
                    let prepare = match protocol::prepare_from_frame(
                        packet_id.clone(),
                        destination,
                        amount,
                        condition,
                        expires_at,
                        data,
                    ) {
                        Ok(prepare) => prepare,
                        Err(err) => {
                            tracing::warn!(peer = %endpoint.peer, ?err, "invalid prepare");
                            endpoint
                                .send_reply(Reply::Reject(Reject::new(
                                    packet_id,
                                    code::F00_BAD_REQUEST,
                                    registry.own_address.clone(),
                                    "malformed prepare",
                                )))
                                .await;
                            return;
                        }
                    };
                    let reply = registry
                        .pipeline()
                        .handle_prepare(&endpoint.peer, prepare)
                        .await;
                    endpoint.send_reply(reply).await;
                });
            }
            Frame::Fulfill { .. } | Frame::Reject { .. } => {
                match protocol::reply_from_frame(frame) {
                    Ok(Some(reply)) => endpoint.resolve(reply),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(peer = %endpoint.peer, ?err, "dropping malformed reply");
                    }
                }
            }
            Frame::Ping => {
                if endpoint.tx.try_send(Frame::Pong).is_err() {
                    tracing::debug!(peer = %endpoint.peer, "dropping pong, send queue full");
                }
            }
            Frame::Pong => {}
            Frame::Auth { .. } | Frame::AuthOk { .. } => {
                tracing::debug!(peer = %endpoint.peer, "ignoring handshake frame after READY");
            }
        }
    }
}

impl PeerDirectory for Registry {
    fn link(&self, peer: &PeerId) -> Option<Arc<dyn PeerLink>> {
        self.endpoints
            .get(peer)
            .map(|entry| Arc::clone(&entry) as Arc<dyn PeerLink>)
    }

    fn asset(&self, peer: &PeerId) -> Option<AssetId> {
        self.peers.get(peer).map(|config| config.asset.clone())
    }
}

/// The lowest common denominator of the two WebSocket message types in play
/// (tungstenite for dialed links, axum for accepted ones).
pub trait WsMessage: Send + std::fmt::Debug {
    fn from_text(text: String) -> Self;
    fn into_text(self) -> Option<String>;
    fn is_close(&self) -> bool;
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn from_text(text: String) -> Self {
        Self::Text(text)
    }

    fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

impl WsMessage for axum::extract::ws::Message {
    fn from_text(text: String) -> Self {
        Self::Text(text)
    }

    fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::domain::packet::{Condition, Fulfill, Fulfillment},
    };

    fn endpoint() -> (Arc<Endpoint>, mpsc::Receiver<Frame>) {
        Endpoint::new(
            PeerId::new("peer-c"),
            "g.node-b".parse().unwrap(),
            &Settings {
                send_queue: 1,
                slack: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    fn prepare(expires_in: chrono::Duration) -> Prepare {
        Prepare {
            packet_id: PacketId::new("p-1"),
            destination: "g.c.x".parse().unwrap(),
            amount: crate::domain::eth::U256::from(10),
            condition: Condition([0; 32]),
            expires_at: Utc::now() + expires_in,
            data: Vec::new(),
        }
    }

    #[tokio::test]
    async fn forward_resolves_with_matching_reply() {
        let (endpoint, mut rx) = endpoint();
        let forward = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.forward(prepare(chrono::Duration::seconds(5))).await })
        };

        // The frame hits the send queue, then the reply resolves the entry.
        let frame = rx.recv().await.unwrap();
        let Frame::Prepare { packet_id, .. } = frame else {
            panic!("expected prepare frame");
        };
        endpoint.resolve(Reply::Fulfill(Fulfill {
            packet_id,
            fulfillment: Fulfillment([0; 32]),
            data: Vec::new(),
        }));

        let reply = forward.await.unwrap().unwrap();
        assert!(matches!(reply, Reply::Fulfill(_)));
        assert!(endpoint.pending.is_empty());
    }

    #[tokio::test]
    async fn forward_times_out_with_synthetic_r00() {
        let (endpoint, _rx) = endpoint();
        let reply = endpoint
            .forward(prepare(chrono::Duration::milliseconds(50)))
            .await
            .unwrap();
        let Reply::Reject(reject) = reply else {
            panic!("expected synthetic reject");
        };
        assert_eq!(reject.code, code::R00_TRANSFER_TIMED_OUT);
        assert!(endpoint.pending.is_empty());
    }

    #[tokio::test]
    async fn full_send_queue_is_congestion() {
        let (endpoint, _rx) = endpoint();
        // Capacity 1: the first forward occupies the queue and waits.
        let _first = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.forward(prepare(chrono::Duration::seconds(5))).await })
        };
        tokio::task::yield_now().await;

        let second = endpoint.forward(prepare(chrono::Duration::seconds(5))).await;
        assert!(matches!(second, Err(ForwardError::Congested)));
    }

    #[tokio::test]
    async fn late_replies_are_dropped() {
        let (endpoint, _rx) = endpoint();
        // No pending entry: resolution is a no-op rather than a panic.
        endpoint.resolve(Reply::Fulfill(Fulfill {
            packet_id: PacketId::new("unknown"),
            fulfillment: Fulfillment([0; 32]),
            data: Vec::new(),
        }));
    }

    #[test]
    fn secret_comparison_is_length_safe() {
        assert!(constant_time_eq(b"hunter2", b"hunter2"));
        assert!(!constant_time_eq(b"hunter2", b"hunter3"));
        assert!(!constant_time_eq(b"hunter2", b"hunter22"));
    }
}

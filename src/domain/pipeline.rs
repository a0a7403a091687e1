//! The packet pipeline: validate, admit, reserve, route, forward, settle the
//! reply back to the origin.
//!
//! Every Prepare accepted here resolves to exactly one Fulfill or Reject
//! towards the ingress peer, and never without the ledger seeing a commit or
//! rollback first.

use {
    crate::{
        domain::{
            account::{AssetId, PeerId},
            fee,
            ledger::{self, Ledger},
            packet::{code, Address, Prepare, Reject, Reply},
            rate_limit::{Decision, RateLimiter},
            routing::RoutingTable,
            telemetry,
        },
        infra::{metrics, telemetry::Broker},
    },
    async_trait::async_trait,
    chrono::{Duration as ChronoDuration, Utc},
    std::{sync::Arc, time::Duration},
};

/// A connected peer endpoint the pipeline can forward on.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Sends the Prepare and resolves with the correlated reply. The
    /// endpoint owns the deadline: expiry resolves to a synthetic `R00`
    /// Reject, a full send queue to [`ForwardError::Congested`].
    async fn forward(&self, prepare: Prepare) -> Result<Reply, ForwardError>;
}

/// Resolves peer ids to live links and their account asset.
pub trait PeerDirectory: Send + Sync {
    fn link(&self, peer: &PeerId) -> Option<Arc<dyn PeerLink>>;
    fn asset(&self, peer: &PeerId) -> Option<AssetId>;
}

/// Terminal handler for packets addressed to this node itself.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn handle(&self, prepare: &Prepare) -> Reply;
}

/// The production terminus: this node forwards value, it does not receive
/// payments itself.
pub struct RejectingLocalHandler {
    pub own_address: Address,
}

#[async_trait]
impl LocalHandler for RejectingLocalHandler {
    async fn handle(&self, prepare: &Prepare) -> Reply {
        Reply::Reject(Reject::new(
            prepare.packet_id.clone(),
            code::F02_UNREACHABLE,
            self.own_address.clone(),
            "no local handler for this destination",
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("egress send queue is full")]
    Congested,
    #[error("egress endpoint disconnected")]
    Disconnected,
}

pub struct Pipeline {
    own_address: Address,
    ledger: Arc<Ledger>,
    routing: Arc<RoutingTable>,
    limiter: Arc<RateLimiter>,
    fees: fee::Schedule,
    peers: Arc<dyn PeerDirectory>,
    local: Arc<dyn LocalHandler>,
    broker: Arc<Broker>,
    /// Shaved off the inbound expiry when forwarding, so the egress reply
    /// can still make it back before the ingress deadline.
    expiry_shave: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_address: Address,
        ledger: Arc<Ledger>,
        routing: Arc<RoutingTable>,
        limiter: Arc<RateLimiter>,
        fees: fee::Schedule,
        peers: Arc<dyn PeerDirectory>,
        local: Arc<dyn LocalHandler>,
        broker: Arc<Broker>,
        expiry_shave: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_address,
            ledger,
            routing,
            limiter,
            fees,
            peers,
            local,
            broker,
            expiry_shave,
        })
    }

    /// Handles one inbound Prepare from `from` and returns the reply to send
    /// back on that endpoint.
    pub async fn handle_prepare(&self, from: &PeerId, prepare: Prepare) -> Reply {
        // Step 1: validation beyond what frame decoding enforced.
        if prepare.expires_at <= Utc::now() {
            return self.reject(from, &prepare, code::F00_BAD_REQUEST, "prepare already expired");
        }

        // Step 2: admission control.
        match self.limiter.check(from) {
            Decision::Allowed => {}
            Decision::Exhausted | Decision::Paused => {
                self.broker.emit(telemetry::Kind::RateLimitExceeded {
                    peer_id: from.clone(),
                    packet_id: prepare.packet_id.clone(),
                });
                return self.reject(from, &prepare, code::T05_RATE_LIMITED, "rate limit exceeded");
            }
        }

        let Some(asset_in) = self.peers.asset(from) else {
            return self.reject(from, &prepare, code::F00_BAD_REQUEST, "unknown peer account");
        };

        self.broker.emit(telemetry::Kind::PacketReceived {
            peer_id: from.clone(),
            packet_id: prepare.packet_id.clone(),
            destination: prepare.destination.clone(),
            amount: prepare.amount,
        });
        metrics::packet_received();

        // Step 3: reserve on the ledger before anything leaves this node.
        let reservation = match self.ledger.prepare(from, &asset_in, prepare.amount).await {
            Ok(reservation) => reservation,
            Err(ledger::Error::InsufficientCredit) => {
                return self.reject(
                    from,
                    &prepare,
                    code::T04_INSUFFICIENT_LIQUIDITY,
                    "insufficient liquidity",
                );
            }
            Err(err) => {
                tracing::error!(?err, peer = %from, "ledger refused reservation");
                return self.reject(from, &prepare, code::T00_INTERNAL_ERROR, "ledger unavailable");
            }
        };

        // Step 4: local terminus.
        if prepare.destination.starts_with_prefix(&self.own_address) {
            let reply = self.local.handle(&prepare).await;
            return self.settle_reply(from, &prepare, reservation, None, reply).await;
        }

        // Step 5: route.
        let Some(peer_out) = self.routing.lookup(&prepare.destination) else {
            self.rollback(reservation).await;
            return self.reject(from, &prepare, code::F02_UNREACHABLE, "no route to destination");
        };
        let Some(link) = self.peers.link(&peer_out) else {
            self.rollback(reservation).await;
            return self.reject(from, &prepare, code::F02_UNREACHABLE, "next hop not connected");
        };
        let Some(asset_out) = self.peers.asset(&peer_out) else {
            self.rollback(reservation).await;
            return self.reject(from, &prepare, code::F02_UNREACHABLE, "next hop has no account");
        };

        // Step 6: forward with the fee taken off and a shaved deadline.
        let amount_out = self.fees.apply(prepare.amount);
        let expires_out = prepare.expires_at
            - ChronoDuration::from_std(self.expiry_shave).unwrap_or_else(|_| ChronoDuration::zero());
        if expires_out <= Utc::now() {
            self.rollback(reservation).await;
            return self.reject(
                from,
                &prepare,
                code::R00_TRANSFER_TIMED_OUT,
                "not enough time left to forward",
            );
        }
        let egress = Prepare {
            packet_id: crate::domain::packet::PacketId::random(),
            destination: prepare.destination.clone(),
            amount: amount_out,
            condition: prepare.condition,
            expires_at: expires_out,
            data: prepare.data.clone(),
        };

        self.broker.emit(telemetry::Kind::PacketForwarded {
            from: from.clone(),
            to: peer_out.clone(),
            packet_id: prepare.packet_id.clone(),
            destination: prepare.destination.clone(),
            amount: amount_out,
        });
        metrics::packet_forwarded();

        // Steps 7-9: await the correlated reply and settle accounting.
        match link.forward(egress).await {
            Ok(reply) => {
                self.settle_reply(from, &prepare, reservation, Some((peer_out, asset_out, amount_out)), reply)
                    .await
            }
            Err(ForwardError::Congested) => {
                self.rollback(reservation).await;
                self.reject(
                    from,
                    &prepare,
                    code::T04_INSUFFICIENT_LIQUIDITY,
                    "next hop congested",
                )
            }
            Err(ForwardError::Disconnected) => {
                self.rollback(reservation).await;
                self.reject(from, &prepare, code::F02_UNREACHABLE, "next hop disconnected")
            }
        }
    }

    /// Step 8/9: verify the reply, commit or roll back the reservation, and
    /// re-key the reply onto the ingress packet id.
    async fn settle_reply(
        &self,
        from: &PeerId,
        prepare: &Prepare,
        reservation: ledger::Reservation,
        egress: Option<(PeerId, AssetId, crate::domain::eth::U256)>,
        reply: Reply,
    ) -> Reply {
        match reply {
            Reply::Fulfill(fulfill) => {
                if !prepare.condition.is_fulfilled_by(&fulfill.fulfillment) {
                    tracing::warn!(
                        packet = %prepare.packet_id,
                        "fulfillment does not hash to the prepare condition"
                    );
                    self.rollback(reservation).await;
                    return self.reject(
                        from,
                        prepare,
                        code::F05_WRONG_CONDITION,
                        "fulfillment does not match condition",
                    );
                }
                if let Err(err) = self.ledger.commit(reservation).await {
                    tracing::error!(?err, "commit failed after valid fulfill");
                }
                if let Some((peer_out, asset_out, amount_out)) = egress {
                    if let Err(err) = self.ledger.credit(&peer_out, &asset_out, amount_out).await {
                        tracing::error!(?err, peer = %peer_out, "crediting egress peer failed");
                    }
                }
                Reply::Fulfill(crate::domain::packet::Fulfill {
                    packet_id: prepare.packet_id.clone(),
                    ..fulfill
                })
            }
            Reply::Reject(reject) => {
                self.rollback(reservation).await;
                self.broker.emit(telemetry::Kind::PacketRejected {
                    peer_id: from.clone(),
                    packet_id: prepare.packet_id.clone(),
                    code: reject.code.clone(),
                    message: reject.message.clone(),
                });
                metrics::packet_rejected(&reject.code);
                Reply::Reject(Reject {
                    packet_id: prepare.packet_id.clone(),
                    ..reject
                })
            }
        }
    }

    async fn rollback(&self, reservation: ledger::Reservation) {
        if let Err(err) = self.ledger.rollback(reservation).await {
            tracing::error!(?err, "rollback failed");
        }
    }

    fn reject(&self, from: &PeerId, prepare: &Prepare, code: &str, message: &str) -> Reply {
        self.broker.emit(telemetry::Kind::PacketRejected {
            peer_id: from.clone(),
            packet_id: prepare.packet_id.clone(),
            code: code.to_owned(),
            message: message.to_owned(),
        });
        metrics::packet_rejected(code);
        Reply::Reject(Reject::new(
            prepare.packet_id.clone(),
            code,
            self.own_address.clone(),
            message,
        ))
    }
}

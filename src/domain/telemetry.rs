//! Telemetry events broadcast to observers and persisted by the event store.
//!
//! The `type` tag determines the payload shape. The field-extraction table
//! the store indexes by lives here, next to the event definition, so adding
//! a kind and forgetting its indexed columns shows up in one diff.

use {
    crate::{
        domain::{
            account::{AssetId, PeerId},
            eth::U256,
            fraud,
            packet::{Address, PacketId},
            settlement::{ChannelId, Method},
        },
        util::serialize,
    },
    chrono::{DateTime, Utc},
    serde::{de, Deserialize, Serialize},
    serde_with::serde_as,
};

/// A Unix-millisecond instant. Accepts both integer milliseconds and
/// ISO-8601 strings on the wire; always serializes as milliseconds.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("unix milliseconds or an ISO-8601 string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
                Ok(Timestamp(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
                Ok(Timestamp(v as i64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
                Ok(Timestamp(v as i64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                DateTime::parse_from_rfc3339(v)
                    .map(|parsed| Timestamp(parsed.timestamp_millis()))
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Which way a packet-shaped event travelled, as stored in the indexed
/// `direction` column.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
    Internal,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
            Direction::Internal => "internal",
        }
    }
}

/// A telemetry event as emitted and broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub node_id: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: Kind,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Kind {
    PacketReceived {
        peer_id: PeerId,
        packet_id: PacketId,
        destination: Address,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    PacketForwarded {
        from: PeerId,
        to: PeerId,
        packet_id: PacketId,
        destination: Address,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    PacketRejected {
        peer_id: PeerId,
        packet_id: PacketId,
        code: String,
        message: String,
    },
    AccountBalance {
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        credit_balance: U256,
        #[serde_as(as = "serialize::U256")]
        debit_balance: U256,
        net_balance: String,
    },
    SettlementTriggered {
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        current_balance: U256,
        #[serde_as(as = "serialize::U256")]
        threshold: U256,
        #[serde_as(as = "serialize::U256")]
        exceeds_by: U256,
    },
    SettlementPending {
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    SettlementCompleted {
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
        method: Method,
        channel_id: ChannelId,
        nonce: u64,
    },
    SettlementFailed {
        peer_id: PeerId,
        asset: AssetId,
        reason: String,
    },
    PaymentChannelOpened {
        channel_id: ChannelId,
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        initial_deposit: U256,
    },
    PaymentChannelBalanceUpdate {
        channel_id: ChannelId,
        nonce: u64,
        #[serde_as(as = "serialize::U256")]
        transferred: U256,
    },
    PaymentChannelSettled {
        channel_id: ChannelId,
        peer_id: PeerId,
    },
    ChannelReused {
        channel_id: ChannelId,
        peer_id: PeerId,
    },
    ChannelDeposit {
        channel_id: ChannelId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    XrpChannelOpened {
        channel_id: ChannelId,
        peer_id: PeerId,
        drops: u64,
    },
    XrpChannelClaimed {
        channel_id: ChannelId,
        drops: u64,
        nonce: u64,
    },
    XrpChannelClosed {
        channel_id: ChannelId,
    },
    AgentChannelOpened {
        channel_id: ChannelId,
        peer_id: PeerId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    AgentChannelUpdated {
        channel_id: ChannelId,
        peer_id: PeerId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    AgentChannelClosed {
        channel_id: ChannelId,
        peer_id: PeerId,
    },
    FundingRequired {
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
        reason: String,
    },
    FundingCompleted {
        peer_id: PeerId,
        asset: AssetId,
        #[serde_as(as = "serialize::U256")]
        amount: U256,
    },
    NodeStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
    },
    SuspiciousActivityDetected {
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        rule: String,
        severity: fraud::Severity,
        details: String,
    },
    FraudDetected {
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        rule: String,
        severity: fraud::Severity,
        details: String,
    },
    PeerPaused {
        peer_id: PeerId,
        reason: String,
        rule: String,
        severity: fraud::Severity,
    },
    PeerResumed {
        peer_id: PeerId,
    },
    RateLimitExceeded {
        peer_id: PeerId,
        packet_id: PacketId,
    },
    WalletBalanceMismatch {
        address: String,
        #[serde_as(as = "serialize::U256")]
        expected: U256,
        #[serde_as(as = "serialize::U256")]
        actual: U256,
    },
}

/// The indexed columns the store pulls out of an event. The full event is
/// always retained in the payload column regardless.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Extracted {
    pub direction: Option<Direction>,
    pub peer_id: Option<String>,
    pub packet_id: Option<String>,
    pub amount: Option<String>,
    pub destination: Option<String>,
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::PacketReceived { .. } => "PACKET_RECEIVED",
            Kind::PacketForwarded { .. } => "PACKET_FORWARDED",
            Kind::PacketRejected { .. } => "PACKET_REJECTED",
            Kind::AccountBalance { .. } => "ACCOUNT_BALANCE",
            Kind::SettlementTriggered { .. } => "SETTLEMENT_TRIGGERED",
            Kind::SettlementPending { .. } => "SETTLEMENT_PENDING",
            Kind::SettlementCompleted { .. } => "SETTLEMENT_COMPLETED",
            Kind::SettlementFailed { .. } => "SETTLEMENT_FAILED",
            Kind::PaymentChannelOpened { .. } => "PAYMENT_CHANNEL_OPENED",
            Kind::PaymentChannelBalanceUpdate { .. } => "PAYMENT_CHANNEL_BALANCE_UPDATE",
            Kind::PaymentChannelSettled { .. } => "PAYMENT_CHANNEL_SETTLED",
            Kind::ChannelReused { .. } => "CHANNEL_REUSED",
            Kind::ChannelDeposit { .. } => "CHANNEL_DEPOSIT",
            Kind::XrpChannelOpened { .. } => "XRP_CHANNEL_OPENED",
            Kind::XrpChannelClaimed { .. } => "XRP_CHANNEL_CLAIMED",
            Kind::XrpChannelClosed { .. } => "XRP_CHANNEL_CLOSED",
            Kind::AgentChannelOpened { .. } => "AGENT_CHANNEL_OPENED",
            Kind::AgentChannelUpdated { .. } => "AGENT_CHANNEL_UPDATED",
            Kind::AgentChannelClosed { .. } => "AGENT_CHANNEL_CLOSED",
            Kind::FundingRequired { .. } => "FUNDING_REQUIRED",
            Kind::FundingCompleted { .. } => "FUNDING_COMPLETED",
            Kind::NodeStatus { .. } => "NODE_STATUS",
            Kind::SuspiciousActivityDetected { .. } => "SUSPICIOUS_ACTIVITY_DETECTED",
            Kind::FraudDetected { .. } => "FRAUD_DETECTED",
            Kind::PeerPaused { .. } => "PEER_PAUSED",
            Kind::PeerResumed { .. } => "PEER_RESUMED",
            Kind::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Kind::WalletBalanceMismatch { .. } => "WALLET_BALANCE_MISMATCH",
        }
    }

    pub fn extracted(&self) -> Extracted {
        match self {
            Kind::PacketReceived {
                peer_id,
                packet_id,
                destination,
                amount,
            } => Extracted {
                direction: Some(Direction::Received),
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(packet_id.to_string()),
                amount: Some(amount.to_string()),
                destination: Some(destination.to_string()),
            },
            Kind::PacketForwarded {
                to,
                packet_id,
                destination,
                amount,
                ..
            } => Extracted {
                direction: Some(Direction::Sent),
                peer_id: Some(to.to_string()),
                packet_id: Some(packet_id.to_string()),
                amount: Some(amount.to_string()),
                destination: Some(destination.to_string()),
            },
            Kind::PacketRejected {
                peer_id, packet_id, ..
            } => Extracted {
                direction: Some(Direction::Internal),
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(packet_id.to_string()),
                ..Default::default()
            },
            Kind::AccountBalance {
                peer_id,
                net_balance,
                ..
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                amount: Some(net_balance.clone()),
                ..Default::default()
            },
            Kind::SettlementTriggered {
                peer_id,
                current_balance,
                ..
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                amount: Some(current_balance.to_string()),
                ..Default::default()
            },
            Kind::SettlementPending {
                peer_id, amount, ..
            }
            | Kind::FundingRequired {
                peer_id, amount, ..
            }
            | Kind::FundingCompleted {
                peer_id, amount, ..
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                amount: Some(amount.to_string()),
                ..Default::default()
            },
            Kind::SettlementCompleted {
                peer_id,
                amount,
                channel_id,
                ..
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(channel_id.to_string()),
                amount: Some(amount.to_string()),
                ..Default::default()
            },
            Kind::SettlementFailed { peer_id, .. } => Extracted {
                peer_id: Some(peer_id.to_string()),
                ..Default::default()
            },
            Kind::PaymentChannelOpened {
                channel_id,
                peer_id,
                initial_deposit,
                ..
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(channel_id.to_string()),
                amount: Some(initial_deposit.to_string()),
                ..Default::default()
            },
            Kind::PaymentChannelBalanceUpdate {
                channel_id,
                transferred,
                ..
            } => Extracted {
                packet_id: Some(channel_id.to_string()),
                amount: Some(transferred.to_string()),
                ..Default::default()
            },
            Kind::PaymentChannelSettled {
                channel_id,
                peer_id,
            }
            | Kind::ChannelReused {
                channel_id,
                peer_id,
            }
            | Kind::AgentChannelClosed {
                channel_id,
                peer_id,
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(channel_id.to_string()),
                ..Default::default()
            },
            Kind::ChannelDeposit { channel_id, amount } => Extracted {
                packet_id: Some(channel_id.to_string()),
                amount: Some(amount.to_string()),
                ..Default::default()
            },
            Kind::XrpChannelOpened {
                channel_id,
                peer_id,
                drops,
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(channel_id.to_string()),
                amount: Some(drops.to_string()),
                ..Default::default()
            },
            Kind::XrpChannelClaimed {
                channel_id, drops, ..
            } => Extracted {
                packet_id: Some(channel_id.to_string()),
                amount: Some(drops.to_string()),
                ..Default::default()
            },
            Kind::XrpChannelClosed { channel_id } => Extracted {
                packet_id: Some(channel_id.to_string()),
                ..Default::default()
            },
            Kind::AgentChannelOpened {
                channel_id,
                peer_id,
                amount,
            }
            | Kind::AgentChannelUpdated {
                channel_id,
                peer_id,
                amount,
            } => Extracted {
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(channel_id.to_string()),
                amount: Some(amount.to_string()),
                ..Default::default()
            },
            Kind::NodeStatus { peer_id, .. } => Extracted {
                direction: Some(Direction::Internal),
                peer_id: peer_id.as_ref().map(|id| id.to_string()),
                ..Default::default()
            },
            Kind::SuspiciousActivityDetected { peer_id, .. }
            | Kind::FraudDetected { peer_id, .. } => Extracted {
                direction: Some(Direction::Internal),
                peer_id: peer_id.as_ref().map(|id| id.to_string()),
                ..Default::default()
            },
            Kind::PeerPaused { peer_id, .. } | Kind::PeerResumed { peer_id } => Extracted {
                direction: Some(Direction::Internal),
                peer_id: Some(peer_id.to_string()),
                ..Default::default()
            },
            Kind::RateLimitExceeded { peer_id, packet_id } => Extracted {
                direction: Some(Direction::Received),
                peer_id: Some(peer_id.to_string()),
                packet_id: Some(packet_id.to_string()),
                ..Default::default()
            },
            Kind::WalletBalanceMismatch {
                address, actual, ..
            } => Extracted {
                direction: Some(Direction::Internal),
                destination: Some(address.clone()),
                amount: Some(actual.to_string()),
                ..Default::default()
            },
        }
    }
}

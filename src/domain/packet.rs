//! ILP packet types and addressing.

use {
    crate::{domain::eth::U256, util},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::fmt::{self, Debug, Display, Formatter},
};

/// Stable ILP error codes attached to reject packets. Nothing beyond these
/// codes and the reject message ever crosses the peer boundary.
pub mod code {
    pub const F00_BAD_REQUEST: &str = "F00";
    pub const F02_UNREACHABLE: &str = "F02";
    pub const F05_WRONG_CONDITION: &str = "F05";
    pub const R00_TRANSFER_TIMED_OUT: &str = "R00";
    pub const T00_INTERNAL_ERROR: &str = "T00";
    pub const T04_INSUFFICIENT_LIQUIDITY: &str = "T04";
    pub const T05_RATE_LIMITED: &str = "T05";
}

/// An ILP address: non-empty dot-separated segments, e.g. `g.agent.peer-3`.
#[derive(Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid ILP address {0:?}")]
pub struct InvalidAddress(pub String);

impl Address {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidAddress> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'~')
            });
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidAddress(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Whether `prefix` is a prefix of this address on dotted-segment
    /// boundaries: `g.c` matches `g.c` and `g.c.x` but not `g.cx`.
    pub fn starts_with_prefix(&self, prefix: &Address) -> bool {
        let rest = match self.0.strip_prefix(&prefix.0) {
            Some(rest) => rest,
            None => return false,
        };
        rest.is_empty() || rest.starts_with('.')
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A packet identifier, unique among the in-flight packets of the endpoint
/// that allocated it. Replies are correlated by this id.
#[derive(Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(String);

impl PacketId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for PacketId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The SHA-256 hash a Prepare locks funds against.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Condition(pub [u8; 32]);

/// The pre-image redeeming a [`Condition`].
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Fulfillment(pub [u8; 32]);

impl Fulfillment {
    pub fn condition(&self) -> Condition {
        Condition(Sha256::digest(self.0).into())
    }
}

impl Condition {
    /// A Fulfill is valid iff `sha256(fulfillment) == condition`.
    pub fn is_fulfilled_by(&self, fulfillment: &Fulfillment) -> bool {
        fulfillment.condition() == *self
    }
}

impl Debug for Condition {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("Condition")
            .field(&util::fmt::Hex(&self.0))
            .finish()
    }
}

impl Debug for Fulfillment {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("Fulfillment")
            .field(&util::fmt::Hex(&self.0))
            .finish()
    }
}

/// A value-bearing packet asking the next hop to lock `amount` against
/// `condition` until `expires_at`.
#[derive(Clone, Debug)]
pub struct Prepare {
    pub packet_id: PacketId,
    pub destination: Address,
    pub amount: U256,
    pub condition: Condition,
    pub expires_at: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// The success reply to a Prepare, carrying the condition pre-image.
#[derive(Clone, Debug)]
pub struct Fulfill {
    pub packet_id: PacketId,
    pub fulfillment: Fulfillment,
    pub data: Vec<u8>,
}

/// The failure reply to a Prepare.
#[derive(Clone, Debug)]
pub struct Reject {
    pub packet_id: PacketId,
    pub code: String,
    pub triggered_by: Address,
    pub message: String,
    pub data: Vec<u8>,
}

impl Reject {
    pub fn new(
        packet_id: PacketId,
        code: &str,
        triggered_by: Address,
        message: impl Into<String>,
    ) -> Self {
        Self {
            packet_id,
            code: code.to_owned(),
            triggered_by,
            message: message.into(),
            data: Vec::new(),
        }
    }
}

/// The reply correlated to an outstanding Prepare.
#[derive(Clone, Debug)]
pub enum Reply {
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Reply {
    pub fn packet_id(&self) -> &PacketId {
        match self {
            Reply::Fulfill(fulfill) => &fulfill.packet_id,
            Reply::Reject(reject) => &reject.packet_id,
        }
    }

    /// Re-keys the reply onto the ingress packet id when relaying a reply
    /// received on the egress leg.
    pub fn with_packet_id(mut self, packet_id: PacketId) -> Self {
        match &mut self {
            Reply::Fulfill(fulfill) => fulfill.packet_id = packet_id,
            Reply::Reject(reject) => reject.packet_id = packet_id,
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_segment_prefix_match() {
        let address: Address = "g.c.x".parse().unwrap();
        assert!(address.starts_with_prefix(&"g".parse().unwrap()));
        assert!(address.starts_with_prefix(&"g.c".parse().unwrap()));
        assert!(address.starts_with_prefix(&"g.c.x".parse().unwrap()));
        assert!(!address.starts_with_prefix(&"g.c.x.y".parse().unwrap()));

        let other: Address = "g.cx".parse().unwrap();
        assert!(!other.starts_with_prefix(&"g.c".parse().unwrap()));
    }

    #[test]
    fn address_rejects_malformed_input() {
        for input in ["", ".", "g..c", "g.", "g c", "g.\u{e9}"] {
            assert!(Address::new(input).is_err(), "{input:?}");
        }
    }

    #[test]
    fn condition_matches_its_preimage() {
        let fulfillment = Fulfillment([7; 32]);
        let condition = fulfillment.condition();
        assert!(condition.is_fulfilled_by(&fulfillment));
        assert!(!condition.is_fulfilled_by(&Fulfillment([8; 32])));
    }
}

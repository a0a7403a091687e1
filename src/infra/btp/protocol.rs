//! BTP wire protocol: JSON text frames over WebSocket.
//!
//! The opening handshake is an `AUTH` frame answered by `AUTH_OK`; everything
//! after that is packets and ping/pong. Binary fields travel base64-encoded.

use {
    crate::{
        domain::packet::{self, Condition, Fulfillment, PacketId},
        util::serialize,
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_with::serde_as,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidAddress(#[from] packet::InvalidAddress),
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Frame {
    /// First frame on every connection, dialer to listener.
    Auth { peer_id: String, secret: String },
    /// Listener's acknowledgement; the connection is READY after this.
    AuthOk { node_id: String },
    Prepare {
        packet_id: PacketId,
        destination: String,
        #[serde_as(as = "serialize::U256")]
        amount: crate::domain::eth::U256,
        #[serde_as(as = "serialize::Base64")]
        condition: [u8; 32],
        expires_at: DateTime<Utc>,
        #[serde_as(as = "serialize::Base64")]
        data: Vec<u8>,
    },
    Fulfill {
        packet_id: PacketId,
        #[serde_as(as = "serialize::Base64")]
        fulfillment: [u8; 32],
        #[serde_as(as = "serialize::Base64")]
        data: Vec<u8>,
    },
    Reject {
        packet_id: PacketId,
        code: String,
        triggered_by: String,
        message: String,
        #[serde_as(as = "serialize::Base64")]
        data: Vec<u8>,
    },
    Ping,
    Pong,
}

impl Frame {
    pub fn decode(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("frames are always serializable")
    }
}

impl From<packet::Prepare> for Frame {
    fn from(prepare: packet::Prepare) -> Self {
        Frame::Prepare {
            packet_id: prepare.packet_id,
            destination: prepare.destination.as_str().to_owned(),
            amount: prepare.amount,
            condition: prepare.condition.0,
            expires_at: prepare.expires_at,
            data: prepare.data,
        }
    }
}

impl From<packet::Reply> for Frame {
    fn from(reply: packet::Reply) -> Self {
        match reply {
            packet::Reply::Fulfill(fulfill) => Frame::Fulfill {
                packet_id: fulfill.packet_id,
                fulfillment: fulfill.fulfillment.0,
                data: fulfill.data,
            },
            packet::Reply::Reject(reject) => Frame::Reject {
                packet_id: reject.packet_id,
                code: reject.code,
                triggered_by: reject.triggered_by.as_str().to_owned(),
                message: reject.message,
                data: reject.data,
            },
        }
    }
}

/// Converts an inbound Prepare frame, validating the destination address.
pub fn prepare_from_frame(
    packet_id: PacketId,
    destination: String,
    amount: crate::domain::eth::U256,
    condition: [u8; 32],
    expires_at: DateTime<Utc>,
    data: Vec<u8>,
) -> Result<packet::Prepare, Error> {
    Ok(packet::Prepare {
        packet_id,
        destination: destination.parse()?,
        amount,
        condition: Condition(condition),
        expires_at,
        data,
    })
}

/// Converts an inbound reply frame. Reject `triggered_by` addresses that do
/// not parse collapse to the peer-supplied string's best effort: the frame
/// is dropped as malformed, matching how unparseable packets are treated.
pub fn reply_from_frame(frame: Frame) -> Result<Option<packet::Reply>, Error> {
    match frame {
        Frame::Fulfill {
            packet_id,
            fulfillment,
            data,
        } => Ok(Some(packet::Reply::Fulfill(packet::Fulfill {
            packet_id,
            fulfillment: Fulfillment(fulfillment),
            data,
        }))),
        Frame::Reject {
            packet_id,
            code,
            triggered_by,
            message,
            data,
        } => Ok(Some(packet::Reply::Reject(packet::Reject {
            packet_id,
            code,
            triggered_by: triggered_by.parse()?,
            message,
            data,
        }))),
        _ => Ok(None),
    }
}

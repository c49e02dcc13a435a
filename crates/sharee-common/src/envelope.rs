//! Sharee JSON envelope parsing and encoding.
//!
//! Every WebSocket text frame is a single JSON object of the form
//! `{"type": <kind>, "payload": <object | string | absent>}`. Client frames are
//! validated into [`Inbound`] before dispatch; server frames are built from
//! [`Outbound`] or, for point-to-point forwards, [`Forwarded`].

use crate::types::{ClientId, NatType, RoomId, UnknownNatType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// `join_room`: client → relay, enter (or switch to) a room.
pub const TYPE_JOIN_ROOM: &str = "join_room";
/// `broadcast_message`: client → relay, chat line for the whole room.
pub const TYPE_BROADCAST_MESSAGE: &str = "broadcast_message";
/// `share_nat_type`: client → relay, publish the client's NAT classification.
pub const TYPE_SHARE_NAT_TYPE: &str = "share_nat_type";
/// `start_nat_probe`: client → relay, request a UDP round-trip probe.
pub const TYPE_START_NAT_PROBE: &str = "start_nat_probe";

/// Envelope kinds relayed verbatim to exactly one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardKind {
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// ICE candidate.
    Candidate,
    /// Sender proposes a file transfer.
    FileTransferRequest,
    /// Receiver accepted a proposed transfer.
    FileTransferAccepted,
    /// Receiver declined a proposed transfer.
    FileTransferRejected,
    /// Either side aborted a transfer in progress.
    FileTransferCancelled,
}

impl ForwardKind {
    /// All forwardable kinds.
    pub const ALL: [Self; 7] = [
        Self::Offer,
        Self::Answer,
        Self::Candidate,
        Self::FileTransferRequest,
        Self::FileTransferAccepted,
        Self::FileTransferRejected,
        Self::FileTransferCancelled,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::FileTransferRequest => "file_transfer_request",
            Self::FileTransferAccepted => "file_transfer_accepted",
            Self::FileTransferRejected => "file_transfer_rejected",
            Self::FileTransferCancelled => "file_transfer_cancelled",
        }
    }

    /// Looks up a forwardable kind by wire name.
    #[must_use]
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while validating a client frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The frame is not a JSON object with a string `type`, or a field has the
    /// wrong shape.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    /// `join_room` without a non-empty string `roomId`.
    #[error("Invalid roomId for join_room")]
    InvalidRoom,
    /// A forwardable kind without a string `targetId`.
    #[error("Message type {0} requires a targetId")]
    MissingTarget(ForwardKind),
    /// The `type` is not one the relay understands.
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
}

/// An undecoded `{type, payload}` pair.
///
/// Clients use this to read server frames, including forwarded kinds that
/// [`Outbound`] does not model.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawEnvelope {
    /// The envelope kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// The payload, `Null` when absent.
    #[serde(default)]
    pub payload: Value,
}

impl RawEnvelope {
    /// Decodes a text frame into its kind and payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidMessage`] for malformed JSON or a
    /// missing `type`.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text)
            .map_err(|e| EnvelopeError::InvalidMessage(format!("Invalid JSON message ({e})")))
    }
}

/// A validated client → relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Enter `room_id`, leaving any current room first.
    JoinRoom {
        /// Non-empty room name.
        room_id: RoomId,
    },
    /// Chat line for the sender's room. Emptiness is checked by the relay
    /// after it has confirmed the sender is in a room.
    BroadcastMessage {
        /// The `data` field as sent, if any.
        data: Option<Value>,
    },
    /// Negotiation or file-transfer control message for one peer.
    Forward {
        /// Which forwardable kind this is.
        kind: ForwardKind,
        /// Identity of the recipient.
        target_id: ClientId,
        /// Original payload, forwarded untouched apart from `senderId`.
        payload: Map<String, Value>,
    },
    /// The sender's new NAT classification.
    ShareNatType {
        /// Classification label.
        nat_type: NatType,
    },
    /// Ask the relay to run a UDP round-trip probe.
    StartNatProbe {
        /// Server-reflexive address the client learned from STUN.
        mapped_address: Option<SocketAddr>,
        /// The client's host candidate address.
        local_address: Option<SocketAddr>,
    },
}

impl Inbound {
    /// Parses and validates a client text frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use sharee_common::envelope::Inbound;
    /// let msg = Inbound::parse(r#"{"type":"join_room","payload":{"roomId":"lobby"}}"#).unwrap();
    /// assert_eq!(msg, Inbound::JoinRoom { room_id: "lobby".into() });
    /// ```
    ///
    /// # Errors
    ///
    /// See [`EnvelopeError`] for the rejection reasons.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let raw = RawEnvelope::decode(text)?;
        Self::from_parts(&raw.kind, raw.payload)
    }

    /// Validates an already-decoded `{type, payload}` pair.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeError`] for the rejection reasons.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, EnvelopeError> {
        match kind {
            TYPE_JOIN_ROOM => match payload.get("roomId") {
                Some(Value::String(room_id)) if !room_id.is_empty() => Ok(Self::JoinRoom {
                    room_id: room_id.clone(),
                }),
                _ => Err(EnvelopeError::InvalidRoom),
            },
            TYPE_BROADCAST_MESSAGE => Ok(Self::BroadcastMessage {
                data: payload.get("data").cloned(),
            }),
            TYPE_SHARE_NAT_TYPE => {
                let label = payload
                    .get("natType")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        EnvelopeError::InvalidMessage("share_nat_type requires a natType".into())
                    })?;
                let nat_type = label
                    .parse()
                    .map_err(|e: UnknownNatType| EnvelopeError::InvalidMessage(e.to_string()))?;
                Ok(Self::ShareNatType { nat_type })
            }
            TYPE_START_NAT_PROBE => Ok(Self::StartNatProbe {
                mapped_address: socket_addr_field(&payload, "mappedAddress")?,
                local_address: socket_addr_field(&payload, "localAddress")?,
            }),
            other => {
                let kind = ForwardKind::from_kind(other)
                    .ok_or_else(|| EnvelopeError::UnknownKind(other.to_string()))?;
                let Value::Object(payload) = payload else {
                    return Err(EnvelopeError::MissingTarget(kind));
                };
                let target_id = match payload.get("targetId") {
                    Some(Value::String(id)) if !id.is_empty() => id.clone(),
                    _ => return Err(EnvelopeError::MissingTarget(kind)),
                };
                Ok(Self::Forward {
                    kind,
                    target_id,
                    payload,
                })
            }
        }
    }

    /// Wire name of this frame's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => TYPE_JOIN_ROOM,
            Self::BroadcastMessage { .. } => TYPE_BROADCAST_MESSAGE,
            Self::Forward { kind, .. } => kind.as_str(),
            Self::ShareNatType { .. } => TYPE_SHARE_NAT_TYPE,
            Self::StartNatProbe { .. } => TYPE_START_NAT_PROBE,
        }
    }
}

fn socket_addr_field(payload: &Value, field: &str) -> Result<Option<SocketAddr>, EnvelopeError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| EnvelopeError::InvalidMessage(format!("{field} is not an ip:port pair"))),
        Some(_) => Err(EnvelopeError::InvalidMessage(format!(
            "{field} must be a string"
        ))),
    }
}

/// Public profile of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Member identity.
    pub id: ClientId,
    /// Display name.
    pub name: String,
    /// Avatar icon tag.
    pub avatar: String,
    /// NAT classification, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
}

/// A relay → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    /// Members already in the room, sent to a new joiner.
    ExistingUsers {
        /// Pre-existing members, excluding the joiner.
        users: Vec<UserInfo>,
    },
    /// Confirms the join and tells the client its own profile.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        /// Room that was joined.
        room_id: RoomId,
        /// The joiner's identity.
        client_id: ClientId,
        /// Same as `client_id`.
        id: ClientId,
        /// The joiner's display name.
        name: String,
        /// The joiner's avatar tag.
        avatar: String,
        /// The joiner's NAT classification, once known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nat_type: Option<NatType>,
    },
    /// Someone entered the room.
    UserJoined {
        /// New member identity.
        id: ClientId,
        /// New member display name.
        name: String,
        /// New member avatar tag.
        avatar: String,
    },
    /// Someone left the room or disconnected.
    UserLeft {
        /// Departed member identity.
        id: ClientId,
    },
    /// Chat line from another member.
    #[serde(rename_all = "camelCase")]
    RoomMessage {
        /// Author identity.
        sender_id: ClientId,
        /// Author display name.
        sender_name: String,
        /// The message body as sent.
        data: Value,
    },
    /// A member's NAT classification changed.
    #[serde(rename_all = "camelCase")]
    NatTypeInfo {
        /// Member identity.
        id: ClientId,
        /// New classification.
        nat_type: NatType,
    },
    /// A request from this client could not be served.
    Error(String),
    /// A probe port is reserved; the client should send the token there.
    #[serde(rename_all = "camelCase")]
    NatProbeReady {
        /// Token to send as the UDP datagram body.
        probe_id: String,
        /// UDP port on the relay host.
        port: u16,
    },
    /// Outcome of a NAT probe.
    #[serde(rename_all = "camelCase")]
    NatProbeResult {
        /// Token the probe was started with.
        probe_id: String,
        /// Classification derived from the round trip.
        nat_type: NatType,
        /// `false` when the probe timed out or lacked the data to decide.
        conclusive: bool,
        /// Source address the relay saw the datagram arrive from.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observed_address: Option<String>,
    },
}

impl Outbound {
    /// Builds an `error` frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Wire name of this frame's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ExistingUsers { .. } => "existing_users",
            Self::RoomJoined { .. } => "room_joined",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::RoomMessage { .. } => "room_message",
            Self::NatTypeInfo { .. } => "nat_type_info",
            Self::Error(_) => "error",
            Self::NatProbeReady { .. } => "nat_probe_ready",
            Self::NatProbeResult { .. } => "nat_probe_result",
        }
    }

    /// Serializes this frame for a WebSocket text message.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` failures.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A point-to-point frame on its way to the target.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    /// Forwardable kind, kept from the sender's frame.
    pub kind: ForwardKind,
    /// Sender's payload with `senderId` set to the true sender.
    pub payload: Map<String, Value>,
}

impl Forwarded {
    /// Stamps `sender_id` into the payload, replacing any `senderId` the
    /// sender supplied.
    #[must_use]
    pub fn new(kind: ForwardKind, mut payload: Map<String, Value>, sender_id: &str) -> Self {
        payload.insert("senderId".to_string(), Value::String(sender_id.to_string()));
        Self { kind, payload }
    }

    /// Serializes this frame for a WebSocket text message.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` failures.
    pub fn encode(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            payload: &'a Map<String, Value>,
        }
        serde_json::to_string(&Wire {
            kind: self.kind.as_str(),
            payload: &self.payload,
        })
    }
}

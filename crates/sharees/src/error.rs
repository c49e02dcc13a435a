use sharee_common::envelope::{EnvelopeError, ForwardKind};
use thiserror::Error;

/// Errors that end a single connection.
///
/// None of these stop the relay; the connection task runs the normal
/// disconnect cleanup and exits.
#[derive(Error, Debug)]
pub enum ShareesError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The declared origin is not allowed and the host is not loopback.
    #[error("origin rejected: {0}")]
    OriginRejected(String),
    /// The per-IP connection limit was reached.
    #[error("connection limit reached")]
    ConnectionLimit,
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The peer did not finish the WebSocket upgrade in time.
    #[error("websocket upgrade timed out")]
    UpgradeTimeout,
    /// The liveness monitor evicted the connection.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

/// Per-message failures, reported to the sender as an `error` envelope.
///
/// The `Display` text is the envelope payload. None of these close the
/// connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The frame body could not be parsed or validated.
    #[error("{0}")]
    InvalidMessage(String),
    /// `join_room` without a usable room id.
    #[error("Invalid roomId for join_room")]
    InvalidRoom,
    /// Room-scoped request from a client that has not joined a room.
    #[error("You are not in a room to broadcast.")]
    NotInRoom,
    /// `broadcast_message` with no data.
    #[error("No data to broadcast.")]
    EmptyPayload,
    /// Forwardable kind without a `targetId`.
    #[error("Message type {0} requires a targetId.")]
    MissingTarget(ForwardKind),
    /// The forward target is not connected.
    #[error("User {0} not found or not connected.")]
    UnreachableTarget(String),
    /// The envelope kind is not recognized.
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    /// The probe port pool is exhausted.
    #[error("NAT probe capacity exhausted, retry later.")]
    ResourceExhausted,
    /// The client already has a probe running.
    #[error("A NAT probe is already in progress.")]
    ProbeInProgress,
}

impl RelayError {
    /// Static label used for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "invalid_message",
            Self::InvalidRoom => "invalid_room",
            Self::NotInRoom => "not_in_room",
            Self::EmptyPayload => "empty_payload",
            Self::MissingTarget(_) => "missing_target",
            Self::UnreachableTarget(_) => "unreachable_target",
            Self::UnknownKind(_) => "unknown_kind",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ProbeInProgress => "probe_in_progress",
        }
    }
}

impl From<EnvelopeError> for RelayError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::InvalidMessage(_) => Self::InvalidMessage(err.to_string()),
            EnvelopeError::InvalidRoom => Self::InvalidRoom,
            EnvelopeError::MissingTarget(kind) => Self::MissingTarget(kind),
            EnvelopeError::UnknownKind(kind) => Self::UnknownKind(kind),
        }
    }
}

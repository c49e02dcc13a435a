//! Core type definitions and protocol constants for Sharee.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque per-connection identity (a UUID v4 string).
pub type ClientId = String;

/// Client-supplied room name.
pub type RoomId = String;

/// Seconds between server-initiated WebSocket pings.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Seconds a NAT probe may run before it is reported as inconclusive.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 20;

/// Number of UDP ports reserved for concurrent NAT probes.
pub const DEFAULT_PROBE_PORTS: u16 = 100;

/// Longest probe token a client datagram may carry.
pub const MAX_PROBE_TOKEN_LEN: usize = 64;

/// NAT behavior as reported by clients and the connectivity probe.
///
/// The wire labels match what browser clients display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatType {
    /// Detection has not run or was inconclusive.
    #[serde(rename = "Unknown")]
    Unknown,
    /// Endpoint-independent mapping; direct connections usually work.
    #[serde(rename = "Cone NAT")]
    Cone,
    /// Mapping changes per destination; a relayed path is likely needed.
    #[serde(rename = "Symmetric NAT")]
    Symmetric,
    /// No UDP reachability at all.
    #[serde(rename = "Blocked")]
    Blocked,
    /// Host address is publicly routable.
    #[serde(rename = "Public IP")]
    PublicIp,
}

impl NatType {
    /// Wire label for this classification.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Cone => "Cone NAT",
            Self::Symmetric => "Symmetric NAT",
            Self::Blocked => "Blocked",
            Self::PublicIp => "Public IP",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the NAT type labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNatType(pub String);

impl fmt::Display for UnknownNatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized natType: {}", self.0)
    }
}

impl std::error::Error for UnknownNatType {}

impl FromStr for NatType {
    type Err = UnknownNatType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(Self::Unknown),
            "Cone NAT" => Ok(Self::Cone),
            "Symmetric NAT" => Ok(Self::Symmetric),
            "Blocked" => Ok(Self::Blocked),
            "Public IP" => Ok(Self::PublicIp),
            other => Err(UnknownNatType(other.to_string())),
        }
    }
}

//! Common types shared across the Sharee signaling stack.
//!
//! This crate provides:
//! - JSON envelope parsing and encoding ([`envelope`])
//! - Identity aliases, NAT classification labels and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{EnvelopeError, ForwardKind, Forwarded, Inbound, Outbound, UserInfo};
pub use types::{ClientId, NatType, RoomId};

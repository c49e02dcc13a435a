//! Sharee relay server: WebSocket signaling for browser-to-browser file
//! transfer.
//!
//! Clients join named rooms, learn who else is there, and exchange WebRTC
//! negotiation and file-transfer control messages through the relay. The
//! relay never sees file contents.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Origin allow-list check for WebSocket upgrades.
pub mod admission;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Heartbeat sweep that drops unresponsive clients.
pub mod liveness;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// UDP round-trip NAT probing.
pub mod probe;
/// Connection and identity index of live clients.
pub mod registry;
/// Room membership table.
pub mod rooms;
/// Per-connection message dispatch.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};

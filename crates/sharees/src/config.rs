use clap::Parser;
use sharee_common::types::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_PROBE_PORTS, DEFAULT_PROBE_TIMEOUT_SECS,
};
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;

/// Accepted probe timeouts, in seconds.
const PROBE_TIMEOUT_RANGE: RangeInclusive<u64> = 15..=25;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sharees")]
#[command(about = "Sharee signaling relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "SHAREES_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SHAREES_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "SHAREES_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "32", env = "SHAREES_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "262144", env = "SHAREES_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Seconds between heartbeat pings.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_SECS, env = "SHAREES_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Seconds a new connection has to finish the WebSocket upgrade.
    #[arg(long, default_value = "10", env = "SHAREES_UPGRADE_TIMEOUT")]
    pub upgrade_timeout: u64,
    /// Origins allowed to connect (comma separated).
    #[arg(
        long = "allowed-origin",
        env = "SHAREES_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values = [
            "http://localhost:3000",
            "http://127.0.0.1:3000",
            "https://share-file-nuxt.netlify.app",
            "https://spacex-launch-timeline-nuxt.netlify.app",
        ]
    )]
    pub allowed_origins: Vec<String>,
    /// Address NAT probe sockets bind to.
    #[arg(long, default_value = "0.0.0.0", env = "SHAREES_PROBE_BIND")]
    pub probe_bind: IpAddr,
    /// First UDP port of the probe pool; 0 lets the OS pick each port.
    #[arg(long, default_value = "0", env = "SHAREES_PROBE_PORT_BASE")]
    pub probe_port_base: u16,
    /// Number of concurrent NAT probes.
    #[arg(long, default_value_t = DEFAULT_PROBE_PORTS, env = "SHAREES_PROBE_PORT_COUNT")]
    pub probe_port_count: u16,
    /// Seconds before an unanswered NAT probe is reported inconclusive.
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_SECS, env = "SHAREES_PROBE_TIMEOUT")]
    pub probe_timeout: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Seconds between heartbeat pings.
    pub ping_interval: u64,
    /// Seconds a new connection has to finish the WebSocket upgrade.
    pub upgrade_timeout: u64,
    /// Origins allowed to connect.
    pub allowed_origins: Vec<String>,
    /// Address NAT probe sockets bind to.
    pub probe_bind: IpAddr,
    /// First UDP port of the probe pool; 0 lets the OS pick each port.
    pub probe_port_base: u16,
    /// Number of concurrent NAT probes.
    pub probe_port_count: u16,
    /// Seconds before an unanswered NAT probe is reported inconclusive.
    pub probe_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 16 * 1024 * 1024;
        if self.max_message_size == 0 {
            return Err("max_message_size must be greater than 0".to_string());
        }
        if self.max_message_size > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_MESSAGE
            ));
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.upgrade_timeout == 0 {
            return Err("upgrade_timeout must be greater than 0".to_string());
        }
        if self.upgrade_timeout > 120 {
            return Err("upgrade_timeout exceeds reasonable limit (120 seconds)".to_string());
        }

        for origin in &self.allowed_origins {
            if !(origin.starts_with("http://") || origin.starts_with("https://")) {
                return Err(format!(
                    "allowed origin {origin:?} must start with http:// or https://"
                ));
            }
        }

        if self.probe_port_count == 0 {
            return Err("probe_port_count must be greater than 0".to_string());
        }
        if self.probe_port_base != 0
            && u32::from(self.probe_port_base) + u32::from(self.probe_port_count) > 65_536
        {
            return Err("probe_port_base + probe_port_count exceeds port range".to_string());
        }

        if !PROBE_TIMEOUT_RANGE.contains(&self.probe_timeout) {
            return Err(format!(
                "probe_timeout must be between {} and {} seconds",
                PROBE_TIMEOUT_RANGE.start(),
                PROBE_TIMEOUT_RANGE.end()
            ));
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_message_size: args.max_message_size,
            ping_interval: args.ping_interval,
            upgrade_timeout: args.upgrade_timeout,
            allowed_origins: args
                .allowed_origins
                .into_iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            probe_bind: args.probe_bind,
            probe_port_base: args.probe_port_base,
            probe_port_count: args.probe_port_count,
            probe_timeout: args.probe_timeout,
        }
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Loopback configuration with small limits for unit tests.
    pub(crate) fn for_tests() -> Self {
        Self {
            listen: "127.0.0.1:0".parse().unwrap(),
            metrics_addr: "127.0.0.1:0".parse().unwrap(),
            max_conns: 1000,
            max_conns_ip: 10,
            max_message_size: 262_144,
            ping_interval: 30,
            upgrade_timeout: 10,
            allowed_origins: vec!["https://share.example.com".into()],
            probe_bind: "127.0.0.1".parse().unwrap(),
            probe_port_base: 0,
            probe_port_count: 4,
            probe_timeout: 15,
        }
    }
}

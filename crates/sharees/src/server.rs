use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ShareesError;
use crate::liveness::LivenessMonitor;
use crate::probe::ProbeService;
use crate::registry::ClientRegistry;
use crate::rooms::RoomTable;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Connection and identity index of every live client.
    pub registry: ClientRegistry,
    /// Room membership.
    pub rooms: RoomTable,
    /// UDP round-trip probes.
    pub probes: ProbeService,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Accepted connections, counted from accept until the task ends.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Builds empty server state for `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let probes = ProbeService::from_config(&config);
        Self {
            config,
            registry: ClientRegistry::new(),
            rooms: RoomTable::new(),
            probes,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// Holds one of the `max_conns` slots from accept until the connection
/// task ends, including the time spent in the WebSocket upgrade.
struct ConnectionSlot(Arc<ServerState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ShareesError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop until `shutdown` changes or its sender is
/// dropped.
///
/// The liveness monitor runs alongside the accept loop. On shutdown both
/// stop, and in-flight connections get up to 30 seconds to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ShareesError> {
    let local_addr = listener.local_addr().map_err(ShareesError::Io)?;
    info!("server listening on {}", local_addr);
    let mut tasks = JoinSet::new();

    let monitor = LivenessMonitor::new(Duration::from_secs(state.config.ping_interval));
    let liveness = {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { monitor.run(&state.registry, shutdown).await })
    };

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);
                        let slot = ConnectionSlot(Arc::clone(&state));
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    liveness.abort();

    // Wait for in-flight connections to finish (with timeout)
    let drain_timeout = Duration::from_secs(30);
    let drained = tokio::time::timeout(drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.shutdown().await;
    }

    info!("server shut down gracefully");
    Ok(())
}

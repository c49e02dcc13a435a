#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use sharees::config::{Args, ServerConfig};
use sharees::metrics::{start_metrics_server, HealthState};
use sharees::run_with_shutdown;
use sharees::server::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    info!(
        origins = ?config.allowed_origins,
        ping_interval = config.ping_interval,
        probe_ports = config.probe_port_count,
        "starting relay"
    );

    let metrics_addr = config.metrics_addr;
    let listen = config.listen;
    let state = Arc::new(ServerState::new(config));

    let listener = TcpListener::bind(listen).await?;
    info!("bound to {}", listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });
    health_state.set_ready(true);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                // dropping the sender would stop the server
                std::future::pending::<()>().await;
            }
            health_state.set_ready(false);
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    if let Err(e) = run_with_shutdown(listener, state, shutdown_rx).await {
        tracing::error!("server error: {}", e);
    }

    Ok(())
}

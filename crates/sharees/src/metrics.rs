use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that starts out not ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// 200 once the relay listener is bound, 503 before.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Connection and room gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("sharee_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("sharee_connections_active").decrement(1.0);
    }

    /// Record the current number of rooms.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_rooms_active(rooms: usize) {
        metrics::gauge!("sharee_rooms_active").set(rooms as f64);
    }
}

/// Event counters.
pub mod counters {
    /// A connection was dropped by the origin check.
    pub fn origin_rejections_total() {
        metrics::counter!("sharee_origin_rejections_total").increment(1);
    }

    /// A point-to-point frame reached its target's queue.
    pub fn messages_forwarded_total(kind: &'static str) {
        metrics::counter!("sharee_messages_forwarded_total", "kind" => kind).increment(1);
    }

    /// A room-wide frame was fanned out.
    pub fn messages_broadcast_total() {
        metrics::counter!("sharee_messages_broadcast_total").increment(1);
    }

    /// A client frame was answered with an `error` envelope.
    pub fn message_errors_total(kind: &'static str) {
        metrics::counter!("sharee_message_errors_total", "kind" => kind).increment(1);
    }

    /// A frame could not be queued for a recipient.
    pub fn delivery_failures_total(reason: &'static str) {
        metrics::counter!("sharee_delivery_failures_total", "reason" => reason).increment(1);
    }

    /// The liveness monitor dropped an unresponsive connection.
    pub fn heartbeat_evictions_total() {
        metrics::counter!("sharee_heartbeat_evictions_total").increment(1);
    }

    /// A NAT probe finished with the given outcome label.
    pub fn nat_probes_total(outcome: &'static str) {
        metrics::counter!("sharee_nat_probes_total", "outcome" => outcome).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Time spent handling one client frame, in seconds.
    pub fn message_handle_seconds(value: f64) {
        metrics::histogram!("sharee_message_handle_seconds").record(value);
    }
}

use crate::admission::is_origin_allowed;
use crate::error::ShareesError;
use crate::metrics::{counters, gauges};
use crate::registry::{ClientSession, ConnHandle, Outgoing};
use crate::router::{ConnectionEvents, MessageRouter};
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Frames queued per connection before sends to it start failing.
const OUTGOING_QUEUE: usize = 256;

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

fn header(req: &Request<()>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Reserves a per-IP slot, or `None` if `ip` is at its limit.
fn acquire_ip_slot(state: &Arc<ServerState>, ip: IpAddr) -> Option<IpGuard> {
    match state.ip_connections.entry(ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            if *entry.get() >= state.config.max_conns_ip {
                return None;
            }
            *entry.get_mut() += 1;
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(1);
        }
    }
    Some(IpGuard {
        state: Arc::clone(state),
        ip,
    })
}

/// Pump frames between the socket and `events` until either side ends.
async fn run_message_loop<E: ConnectionEvents>(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    outgoing_rx: &mut mpsc::Receiver<Outgoing>,
    session: &ClientSession,
    events: &E,
) -> Result<(), ShareesError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => events.on_message(&text),
                    Some(Ok(Message::Binary(data))) => {
                        events.on_message(&String::from_utf8_lossy(&data));
                    }
                    // tungstenite queues the pong itself
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Pong(_))) => session.mark_alive(),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(ShareesError::WebSocket(e)),
                }
            }
            Some(item) = outgoing_rx.recv() => {
                let message = match item {
                    Outgoing::Text(text) => Message::Text(text),
                    Outgoing::Ping => Message::Ping(Vec::new()),
                };
                ws_tx.send(message).await.map_err(ShareesError::WebSocket)?;
            }
            () = session.terminated() => return Err(ShareesError::HeartbeatTimeout),
        }
    }
}

/// Serves one accepted TCP connection from upgrade to cleanup.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), ShareesError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };

    let origin = Arc::new(OnceLock::new());
    let host = Arc::new(OnceLock::new());
    let origin_cell = Arc::clone(&origin);
    let host_cell = Arc::clone(&host);
    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| {
            if let Some(value) = header(req, "origin") {
                let _ = origin_cell.set(value);
            }
            if let Some(value) = header(req, "host") {
                let _ = host_cell.set(value);
            }
            Ok(resp)
        },
        Some(ws_config),
    );
    let ws_stream = tokio::time::timeout(Duration::from_secs(state.config.upgrade_timeout), upgrade)
        .await
        .map_err(|_| {
            tracing::debug!(ip = %peer_addr.ip(), "websocket upgrade timed out");
            ShareesError::UpgradeTimeout
        })?
        .map_err(ShareesError::WebSocket)?;

    let origin = origin.get().map(String::as_str);
    let host = host.get().map(String::as_str);
    if !is_origin_allowed(origin, host, &state.config.allowed_origins) {
        counters::origin_rejections_total();
        tracing::warn!(
            origin = origin.unwrap_or("<none>"),
            host = host.unwrap_or("<none>"),
            ip = %peer_addr.ip(),
            "connection rejected: origin not allowed"
        );
        return Err(ShareesError::OriginRejected(
            origin.unwrap_or_default().to_string(),
        ));
    }

    let client_ip = peer_addr.ip();
    let Some(_ip_guard) = acquire_ip_slot(&state, client_ip) else {
        tracing::debug!(ip = %client_ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(ShareesError::ConnectionLimit);
    };

    let (handle, mut outgoing_rx) = ConnHandle::channel(OUTGOING_QUEUE);
    let session = state.registry.register(handle);
    gauges::inc_connections_active();
    tracing::info!(
        client_id = %session.id(),
        name = session.name(),
        conn = %session.conn_id(),
        origin = origin.unwrap_or("<none>"),
        total = state.registry.len(),
        "client connected"
    );

    let router = MessageRouter::new(Arc::clone(&state), Arc::clone(&session));
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut outgoing_rx,
        &session,
        &router,
    )
    .await;

    if let Err(e) = &result {
        router.on_error(e);
    }
    router.on_close();

    gauges::dec_connections_active();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn state_with_ip_limit(limit: usize) -> Arc<ServerState> {
        let mut config = ServerConfig::for_tests();
        config.max_conns_ip = limit;
        Arc::new(ServerState::new(config))
    }

    #[test]
    fn header_is_read_case_insensitively() {
        let req = Request::builder()
            .header("Origin", "https://share.example.com")
            .body(())
            .unwrap();
        assert_eq!(
            header(&req, "origin").as_deref(),
            Some("https://share.example.com")
        );
        assert_eq!(header(&req, "host"), None);
    }

    #[test]
    fn ip_slots_are_limited_per_address() {
        let state = state_with_ip_limit(2);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let other: IpAddr = "5.6.7.8".parse().unwrap();

        let a = acquire_ip_slot(&state, ip).unwrap();
        let _b = acquire_ip_slot(&state, ip).unwrap();
        assert!(acquire_ip_slot(&state, ip).is_none());
        assert!(acquire_ip_slot(&state, other).is_some());

        drop(a);
        assert!(acquire_ip_slot(&state, ip).is_some());
    }

    #[test]
    fn ip_guard_decrements_on_drop() {
        let state = state_with_ip_limit(10);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        state.ip_connections.insert(ip, 2);

        {
            let _guard = IpGuard {
                state: state.clone(),
                ip,
            };
        }

        assert_eq!(*state.ip_connections.get(&ip).unwrap(), 1);
    }

    #[test]
    fn ip_guard_removes_entry_at_zero() {
        let state = state_with_ip_limit(10);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        drop(acquire_ip_slot(&state, ip).unwrap());

        assert!(state.ip_connections.get(&ip).is_none());
    }
}

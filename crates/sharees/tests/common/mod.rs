#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sharee_common::envelope::RawEnvelope;
use sharees::config::ServerConfig;
use sharees::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALLOWED_ORIGIN: &str = "https://share.example.com";

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        max_message_size: 262_144,
        ping_interval: 30,
        upgrade_timeout: 10,
        allowed_origins: vec![ALLOWED_ORIGIN.to_string()],
        probe_bind: "127.0.0.1".parse().unwrap(),
        probe_port_base: 0,
        probe_port_count: 8,
        probe_timeout: 5,
    }
}

pub struct TestClient {
    pub ws_tx: SplitSink<WsStream, Message>,
    pub ws_rx: SplitStream<WsStream>,
    /// Identity learned from `room_joined`.
    pub id: String,
}

impl TestClient {
    /// Connects from loopback with no `Origin` header.
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::connect_with(addr, None, None).await.unwrap()
    }

    /// Connects with explicit `Origin` and `Host` headers.
    pub async fn connect_with(
        addr: &SocketAddr,
        origin: Option<&str>,
        host: Option<&str>,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{addr}");
        let mut req = url.into_client_request()?;
        if let Some(origin) = origin {
            req.headers_mut().insert("Origin", origin.parse().unwrap());
        }
        if let Some(host) = host {
            req.headers_mut().insert("Host", host.parse().unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (ws_tx, ws_rx) = ws.split();
        Ok(Self {
            ws_tx,
            ws_rx,
            id: String::new(),
        })
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> RawEnvelope {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for frame")
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<RawEnvelope> {
        let next = async {
            loop {
                let msg = self
                    .ws_rx
                    .next()
                    .await
                    .expect("connection closed")
                    .unwrap();
                match msg {
                    Message::Text(text) => return RawEnvelope::decode(&text).unwrap(),
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => panic!("expected text frame, got {other:?}"),
                }
            }
        };
        tokio::time::timeout(timeout, next).await.ok()
    }

    /// Receives until a frame of `kind` arrives.
    pub async fn recv_kind(&mut self, kind: &str) -> RawEnvelope {
        loop {
            let frame = self.recv().await;
            if frame.kind == kind {
                return frame;
            }
        }
    }

    /// Joins `room`, records the assigned identity and returns the
    /// `existing_users` list.
    pub async fn join(&mut self, room: &str) -> Vec<Value> {
        self.send_json(serde_json::json!({"type": "join_room", "payload": {"roomId": room}}))
            .await;
        let existing = self.recv().await;
        assert_eq!(existing.kind, "existing_users");
        let joined = self.recv().await;
        assert_eq!(joined.kind, "room_joined");
        assert_eq!(joined.payload["roomId"], room);
        self.id = joined.payload["clientId"].as_str().unwrap().to_string();
        existing.payload["users"].as_array().cloned().unwrap_or_default()
    }

    /// `true` if the server closes the connection within `timeout`.
    pub async fn closed_within(&mut self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                match self.ws_rx.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = sharees::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

/// Polls `cond` every 10 ms for up to 5 s.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

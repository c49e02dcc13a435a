use crate::error::{RelayError, ShareesError};
use crate::metrics::{counters, histograms};
use crate::probe::ProbeRequest;
use crate::registry::ClientSession;
use crate::server::ServerState;
use serde_json::{Map, Value};
use sharee_common::envelope::{ForwardKind, Forwarded, Inbound, Outbound};
use sharee_common::NatType;
use std::sync::Arc;
use std::time::Instant;

/// Callbacks a connection task drives for one client.
///
/// Calls for a single connection never overlap; different connections call
/// concurrently.
pub trait ConnectionEvents: Send + Sync {
    /// A text frame arrived.
    fn on_message(&self, text: &str);
    /// The connection is gone; release everything the client held.
    fn on_close(&self);
    /// The transport failed. [`on_close`](Self::on_close) follows.
    fn on_error(&self, err: &ShareesError);
}

/// Dispatches one client's frames against the shared registry and rooms.
pub struct MessageRouter {
    state: Arc<ServerState>,
    session: Arc<ClientSession>,
}

impl MessageRouter {
    /// Creates the router for `session`'s connection.
    #[must_use]
    pub fn new(state: Arc<ServerState>, session: Arc<ClientSession>) -> Self {
        Self { state, session }
    }

    /// The client this router serves.
    #[must_use]
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    fn dispatch(&self, message: Inbound) -> Result<(), RelayError> {
        match message {
            Inbound::JoinRoom { room_id } => self.join_room(&room_id),
            Inbound::BroadcastMessage { data } => self.broadcast_message(data),
            Inbound::Forward {
                kind,
                target_id,
                payload,
            } => self.forward(kind, &target_id, payload),
            Inbound::ShareNatType { nat_type } => {
                self.share_nat_type(nat_type);
                Ok(())
            }
            Inbound::StartNatProbe {
                mapped_address,
                local_address,
            } => self
                .state
                .probes
                .start(
                    &self.session,
                    ProbeRequest {
                        mapped_address,
                        local_address,
                    },
                )
                .map(|_| ()),
        }
    }

    fn join_room(&self, room_id: &str) -> Result<(), RelayError> {
        let me = &self.session;
        let outcome = self.state.rooms.enter(&self.state.registry, me, room_id)?;
        tracing::info!(
            client_id = %me.id(),
            room_id,
            room_size = outcome.existing.len() + 1,
            "client joined room"
        );
        Ok(())
    }

    fn broadcast_message(&self, data: Option<Value>) -> Result<(), RelayError> {
        let me = &self.session;
        let room_id = me.room_id().ok_or(RelayError::NotInRoom)?;
        let data = data.filter(is_truthy).ok_or(RelayError::EmptyPayload)?;

        let delivered = self.state.rooms.broadcast(
            &self.state.registry,
            &room_id,
            &Outbound::RoomMessage {
                sender_id: me.id().to_string(),
                sender_name: me.name().to_string(),
                data,
            },
            Some(me.id()),
        );
        counters::messages_broadcast_total();
        tracing::debug!(client_id = %me.id(), room_id = %room_id, delivered, "broadcast room message");
        Ok(())
    }

    fn forward(
        &self,
        kind: ForwardKind,
        target_id: &str,
        payload: Map<String, Value>,
    ) -> Result<(), RelayError> {
        let me = &self.session;
        let unreachable = || RelayError::UnreachableTarget(target_id.to_string());
        let target = self
            .state
            .registry
            .lookup_by_identity(target_id)
            .filter(|target| target.is_open())
            .ok_or_else(unreachable)?;

        let frame = Forwarded::new(kind, payload, me.id());
        if let Err(reason) = target.send_forwarded(&frame) {
            counters::delivery_failures_total(reason.as_str());
            tracing::warn!(
                client_id = %me.id(),
                target_id,
                kind = kind.as_str(),
                reason = reason.as_str(),
                "could not forward to target"
            );
            return Err(unreachable());
        }
        counters::messages_forwarded_total(kind.as_str());
        tracing::debug!(client_id = %me.id(), target_id, kind = kind.as_str(), "forwarded");
        Ok(())
    }

    fn share_nat_type(&self, nat_type: NatType) {
        let me = &self.session;
        me.set_nat_type(nat_type);
        if let Some(room_id) = me.room_id() {
            self.state.rooms.broadcast(
                &self.state.registry,
                &room_id,
                &Outbound::NatTypeInfo {
                    id: me.id().to_string(),
                    nat_type,
                },
                None,
            );
        }
        tracing::debug!(client_id = %me.id(), nat_type = %nat_type, "client shared NAT type");
    }

    fn report(&self, err: &RelayError) {
        counters::message_errors_total(err.kind());
        tracing::debug!(client_id = %self.session.id(), kind = err.kind(), error = %err, "rejected client message");
        self.session.reply(&Outbound::error(err.to_string()));
    }
}

impl ConnectionEvents for MessageRouter {
    fn on_message(&self, text: &str) {
        let started = Instant::now();
        let result = Inbound::parse(text)
            .map_err(RelayError::from)
            .and_then(|message| {
                tracing::debug!(client_id = %self.session.id(), kind = message.kind(), "received message");
                self.dispatch(message)
            });
        if let Err(err) = result {
            self.report(&err);
        }
        histograms::message_handle_seconds(started.elapsed().as_secs_f64());
    }

    fn on_close(&self) {
        let me = &self.session;
        self.state.rooms.depart(&self.state.registry, me);
        self.state.registry.remove(me.conn_id());
        me.cancel_probe();
        tracing::info!(
            client_id = %me.id(),
            total = self.state.registry.len(),
            "client disconnected"
        );
    }

    fn on_error(&self, err: &ShareesError) {
        match err {
            ShareesError::HeartbeatTimeout | ShareesError::ConnectionClosed => {
                tracing::debug!(client_id = %self.session.id(), error = %err, "connection ended");
            }
            _ => tracing::warn!(client_id = %self.session.id(), error = %err, "websocket error"),
        }
    }
}

/// `false` for values a browser client treats as "no data".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::{ConnHandle, Outgoing};
    use serde_json::json;
    use sharee_common::envelope::RawEnvelope;
    use tokio::sync::mpsc;

    struct Client {
        router: MessageRouter,
        rx: mpsc::Receiver<Outgoing>,
    }

    impl Client {
        fn connect(state: &Arc<ServerState>) -> Self {
            let (handle, rx) = ConnHandle::channel(32);
            let session = state.registry.register(handle);
            Self {
                router: MessageRouter::new(Arc::clone(state), session),
                rx,
            }
        }

        fn id(&self) -> String {
            self.router.session().id().to_string()
        }

        fn send(&self, value: serde_json::Value) {
            self.router.on_message(&value.to_string());
        }

        fn frames(&mut self) -> Vec<RawEnvelope> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                if let Outgoing::Text(text) = item {
                    out.push(RawEnvelope::decode(&text).unwrap());
                }
            }
            out
        }

        fn kinds(&mut self) -> Vec<String> {
            self.frames().into_iter().map(|f| f.kind).collect()
        }

        fn join(&mut self, room: &str) {
            self.send(json!({"type": "join_room", "payload": {"roomId": room}}));
        }
    }

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState::new(ServerConfig::for_tests()))
    }

    #[test]
    fn join_replies_existing_users_then_room_joined() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);

        a.join("r");
        let frames = a.frames();
        assert_eq!(frames[0].kind, "existing_users");
        assert_eq!(frames[0].payload["users"], json!([]));
        assert_eq!(frames[1].kind, "room_joined");
        assert_eq!(frames[1].payload["roomId"], "r");
        assert_eq!(frames[1].payload["clientId"], a.id());

        b.join("r");
        let frames = b.frames();
        assert_eq!(frames[0].payload["users"][0]["id"], a.id());
        assert_eq!(frames[1].kind, "room_joined");

        let frames = a.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "user_joined");
        assert_eq!(frames[0].payload["id"], b.id());
    }

    #[test]
    fn non_string_room_id_is_rejected_without_mutation() {
        let state = state();
        let mut a = Client::connect(&state);

        a.send(json!({"type": "join_room", "payload": {"roomId": 42}}));
        let frames = a.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "error");
        assert_eq!(frames[0].payload, "Invalid roomId for join_room");
        assert!(state.rooms.is_empty());
        assert_eq!(a.router.session().room_id(), None);
    }

    #[test]
    fn switching_rooms_notifies_old_room() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join("r1");
        b.join("r1");
        a.frames();
        b.frames();

        a.join("r2");
        let frames = b.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "user_left");
        assert_eq!(frames[0].payload["id"], a.id());
        assert_eq!(a.kinds(), vec!["existing_users", "room_joined"]);
        assert_eq!(state.rooms.members("r1"), vec![b.id()]);
    }

    #[test]
    fn rejoining_same_room_does_not_notify_self() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join("r");
        b.join("r");
        a.frames();
        b.frames();

        a.join("r");
        assert_eq!(a.kinds(), vec!["existing_users", "room_joined"]);
        assert_eq!(b.kinds(), vec!["user_left", "user_joined"]);
    }

    #[test]
    fn broadcast_reaches_others_but_not_sender() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        let mut c = Client::connect(&state);
        for client in [&mut a, &mut b, &mut c] {
            client.join("r");
        }
        for client in [&mut a, &mut b, &mut c] {
            client.frames();
        }

        a.send(json!({"type": "broadcast_message", "payload": {"data": "hi"}}));
        assert!(a.frames().is_empty());
        for client in [&mut b, &mut c] {
            let frames = client.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].kind, "room_message");
            assert_eq!(frames[0].payload["senderId"], a.id());
            assert_eq!(frames[0].payload["data"], "hi");
        }
    }

    #[test]
    fn broadcast_outside_room_is_rejected_before_emptiness() {
        let state = state();
        let mut a = Client::connect(&state);

        a.send(json!({"type": "broadcast_message", "payload": {}}));
        let frames = a.frames();
        assert_eq!(frames[0].payload, "You are not in a room to broadcast.");
    }

    #[test]
    fn falsy_broadcast_data_is_empty() {
        let state = state();
        let mut a = Client::connect(&state);
        a.join("r");
        a.frames();

        for data in [json!(null), json!(false), json!(0), json!("")] {
            a.send(json!({"type": "broadcast_message", "payload": {"data": data}}));
            let frames = a.frames();
            assert_eq!(frames[0].payload, "No data to broadcast.", "data = {data}");
        }
        a.send(json!({"type": "broadcast_message"}));
        assert_eq!(a.frames()[0].payload, "No data to broadcast.");
    }

    #[test]
    fn forward_overwrites_spoofed_sender() {
        let state = state();
        let a = Client::connect(&state);
        let mut b = Client::connect(&state);

        a.send(json!({
            "type": "candidate",
            "payload": {"targetId": b.id(), "senderId": "spoofed", "candidate": {"sdpMid": "0"}}
        }));
        let frames = b.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "candidate");
        assert_eq!(frames[0].payload["senderId"], a.id());
        assert_eq!(frames[0].payload["targetId"], b.id());
        assert_eq!(frames[0].payload["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn forward_to_unknown_target_reports_error() {
        let state = state();
        let mut a = Client::connect(&state);

        a.send(json!({"type": "offer", "payload": {"targetId": "ghost", "sdp": "x"}}));
        let frames = a.frames();
        assert_eq!(frames[0].kind, "error");
        assert_eq!(frames[0].payload, "User ghost not found or not connected.");
    }

    #[test]
    fn forward_to_closed_target_reports_error() {
        let state = state();
        let mut a = Client::connect(&state);
        let b = Client::connect(&state);
        let target = b.id();
        drop(b.rx);

        a.send(json!({"type": "answer", "payload": {"targetId": target}}));
        assert_eq!(
            a.frames()[0].payload,
            format!("User {target} not found or not connected.")
        );
    }

    #[test]
    fn forward_without_target_reports_missing_target() {
        let state = state();
        let mut a = Client::connect(&state);

        a.send(json!({"type": "file_transfer_request", "payload": {"fileName": "a.txt"}}));
        assert_eq!(
            a.frames()[0].payload,
            "Message type file_transfer_request requires a targetId."
        );
    }

    #[test]
    fn unknown_kind_and_bad_json_keep_session_usable() {
        let state = state();
        let mut a = Client::connect(&state);

        a.send(json!({"type": "teleport", "payload": {}}));
        assert_eq!(a.frames()[0].payload, "Unknown message type: teleport");

        a.router.on_message("{not json");
        let frames = a.frames();
        assert_eq!(frames[0].kind, "error");
        assert!(frames[0]
            .payload
            .as_str()
            .unwrap()
            .contains("Invalid JSON message"));

        a.join("r");
        assert_eq!(a.kinds(), vec!["existing_users", "room_joined"]);
    }

    #[test]
    fn share_nat_type_reaches_whole_room_including_sender() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join("r");
        b.join("r");
        a.frames();
        b.frames();

        a.send(json!({"type": "share_nat_type", "payload": {"natType": "Cone NAT"}}));
        for client in [&mut a, &mut b] {
            let frames = client.frames();
            assert_eq!(frames[0].kind, "nat_type_info");
            assert_eq!(frames[0].payload["natType"], "Cone NAT");
        }
        assert_eq!(a.router.session().nat_type(), Some(NatType::Cone));

        let mut c = Client::connect(&state);
        c.join("r");
        let frames = c.frames();
        let users = &frames[0].payload["users"];
        let a_entry = users
            .as_array()
            .unwrap()
            .iter()
            .find(|u| u["id"] == a.id())
            .unwrap();
        assert_eq!(a_entry["natType"], "Cone NAT");
    }

    #[test]
    fn share_nat_type_outside_room_only_stores() {
        let state = state();
        let mut a = Client::connect(&state);
        a.send(json!({"type": "share_nat_type", "payload": {"natType": "Symmetric NAT"}}));
        assert!(a.frames().is_empty());
        assert_eq!(a.router.session().nat_type(), Some(NatType::Symmetric));
    }

    #[test]
    fn close_cleans_up_and_notifies_room() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join("r");
        b.join("r");
        a.frames();
        b.frames();

        a.router.on_close();
        let frames = b.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "user_left");
        assert_eq!(frames[0].payload["id"], a.id());
        assert!(state.registry.lookup_by_identity(&a.id()).is_none());
        assert_eq!(state.rooms.members("r"), vec![b.id()]);

        b.router.on_close();
        assert!(state.rooms.is_empty());
        assert!(state.registry.is_empty());
    }

    #[test]
    fn close_without_room_is_quiet() {
        let state = state();
        let a = Client::connect(&state);
        a.router.on_close();
        a.router.on_close();
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn probe_request_is_routed_to_probe_service() {
        let state = state();
        let mut a = Client::connect(&state);

        a.send(json!({
            "type": "start_nat_probe",
            "payload": {"mappedAddress": "127.0.0.1:4000"}
        }));
        let frames = a.frames();
        assert_eq!(frames[0].kind, "nat_probe_ready");
        assert!(frames[0].payload["port"].as_u64().unwrap() > 0);

        a.send(json!({"type": "start_nat_probe", "payload": {}}));
        assert_eq!(a.frames()[0].payload, "A NAT probe is already in progress.");

        a.router.on_close();
        assert!(a.router.session().probe_slot().is_none());
    }

    #[test]
    fn truthiness_matches_browser_semantics() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(is_truthy(&json!(-1)));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }
}

use crate::metrics::counters;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use sharee_common::envelope::{Forwarded, Outbound, UserInfo};
use sharee_common::{ClientId, NatType, RoomId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;

const AVATARS: &[&str] = &[
    "i-twemoji-grinning-face-with-big-eyes",
    "i-twemoji-beaming-face-with-smiling-eyes",
    "i-twemoji-face-with-tears-of-joy",
    "i-twemoji-rolling-on-the-floor-laughing",
    "i-twemoji-smiling-face-with-halo",
    "i-twemoji-winking-face",
    "i-twemoji-star-struck",
    "i-twemoji-face-blowing-a-kiss",
    "i-twemoji-upside-down-face",
    "i-twemoji-zany-face",
    "i-twemoji-shushing-face",
    "i-twemoji-thinking-face",
    "i-twemoji-face-with-monocle",
    "i-twemoji-nerd-face",
    "i-twemoji-smiling-face-with-sunglasses",
    "i-twemoji-cowboy-hat-face",
    "i-twemoji-clown-face",
    "i-twemoji-ghost",
    "i-twemoji-alien",
    "i-twemoji-robot",
];

const ADJECTIVES: &[&str] = &[
    "Happy", "Clever", "Brave", "Lucky", "Swift", "Quiet", "Friendly", "Curious", "Busy", "Funny",
];

const NOUNS: &[&str] = &[
    "Cat", "Puppy", "Tiger", "Lion", "Elephant", "Monkey", "Panda", "Rabbit", "Squirrel",
    "Dolphin",
];

/// Opaque id of one accepted WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocates the next process-unique connection id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Item queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A JSON text frame.
    Text(String),
    /// A transport-level ping.
    Ping,
}

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The connection's writer has gone away.
    Closed,
    /// The writer is not keeping up and the queue is full.
    Full,
    /// The frame could not be serialized.
    Encode,
}

impl SendFailure {
    /// Static label used for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Full => "queue_full",
            Self::Encode => "encode",
        }
    }
}

/// Handle held by the registry, used to send frames to a connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Connection this handle writes to.
    pub conn_id: ConnId,
    /// Channel sender feeding the connection's writer.
    pub tx: mpsc::Sender<Outgoing>,
    /// Instant the connection was accepted.
    pub opened_at: Instant,
}

impl ConnHandle {
    /// Creates a handle and the receiving half for the connection task.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            conn_id: ConnId::next(),
            tx,
            opened_at: Instant::now(),
        };
        (handle, rx)
    }
}

/// In-flight NAT probe owned by a session.
#[derive(Debug)]
pub(crate) struct ProbeSlot {
    pub(crate) probe_id: String,
    pub(crate) abort: AbortHandle,
}

/// Per-connection client state.
///
/// `room_id` is written only by [`crate::rooms::RoomTable`] while it holds its
/// table lock.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    name: String,
    avatar: String,
    handle: ConnHandle,
    room_id: Mutex<Option<RoomId>>,
    nat_type: Mutex<Option<NatType>>,
    alive: AtomicBool,
    terminated: AtomicBool,
    terminate: Notify,
    probe: Mutex<Option<ProbeSlot>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ClientSession {
    fn new(handle: ConnHandle) -> Self {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Happy");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Cat");
        let avatar = AVATARS.choose(&mut rng).copied().unwrap_or(AVATARS[0]);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("{adjective} {noun}"),
            avatar: avatar.to_string(),
            handle,
            room_id: Mutex::new(None),
            nat_type: Mutex::new(None),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            terminate: Notify::new(),
            probe: Mutex::new(None),
        }
    }

    /// Client identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Avatar tag.
    #[must_use]
    pub fn avatar(&self) -> &str {
        &self.avatar
    }

    /// Connection this session belongs to.
    #[must_use]
    pub fn conn_id(&self) -> ConnId {
        self.handle.conn_id
    }

    /// Room the client is currently in.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        lock(&self.room_id).clone()
    }

    pub(crate) fn set_room_id(&self, room_id: Option<RoomId>) {
        *lock(&self.room_id) = room_id;
    }

    /// Last NAT classification the client shared.
    #[must_use]
    pub fn nat_type(&self) -> Option<NatType> {
        *lock(&self.nat_type)
    }

    /// Replaces the stored NAT classification.
    pub fn set_nat_type(&self, nat_type: NatType) {
        *lock(&self.nat_type) = Some(nat_type);
    }

    /// Public profile as listed in `existing_users`.
    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            nat_type: self.nat_type(),
        }
    }

    /// `true` while the connection can still accept frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.handle.tx.is_closed() && !self.terminated.load(Ordering::Acquire)
    }

    /// Queues an already-encoded text frame.
    ///
    /// # Errors
    ///
    /// Returns why the frame was not queued; nothing is retried.
    pub fn send_text(&self, text: String) -> Result<(), SendFailure> {
        self.handle
            .tx
            .try_send(Outgoing::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendFailure::Full,
                mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
            })
    }

    /// Encodes and queues a relay frame.
    ///
    /// # Errors
    ///
    /// Returns why the frame was not queued.
    pub fn send(&self, frame: &Outbound) -> Result<(), SendFailure> {
        let text = frame.encode().map_err(|e| {
            tracing::warn!(kind = frame.kind(), error = %e, "failed to encode frame");
            SendFailure::Encode
        })?;
        self.send_text(text)
    }

    /// Encodes and queues a point-to-point forward.
    ///
    /// # Errors
    ///
    /// Returns why the frame was not queued.
    pub fn send_forwarded(&self, frame: &Forwarded) -> Result<(), SendFailure> {
        let text = frame.encode().map_err(|e| {
            tracing::warn!(kind = frame.kind.as_str(), error = %e, "failed to encode forward");
            SendFailure::Encode
        })?;
        self.send_text(text)
    }

    /// Sends a reply to this client, logging instead of failing.
    pub fn reply(&self, frame: &Outbound) {
        if let Err(reason) = self.send(frame) {
            counters::delivery_failures_total(reason.as_str());
            tracing::debug!(client_id = %self.id, kind = frame.kind(), reason = reason.as_str(), "reply dropped");
        }
    }

    /// Queues a transport-level ping.
    ///
    /// # Errors
    ///
    /// Returns why the ping was not queued.
    pub fn send_ping(&self) -> Result<(), SendFailure> {
        self.handle.tx.try_send(Outgoing::Ping).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Records a pong.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Clears the liveness flag, returning its previous value.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Current liveness flag.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Asks the connection task to drop the connection.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.terminate.notify_one();
    }

    /// `true` once [`terminate`](Self::terminate) has been called.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Resolves when [`terminate`](Self::terminate) is called.
    pub async fn terminated(&self) {
        if self.is_terminated() {
            return;
        }
        self.terminate.notified().await;
    }

    pub(crate) fn probe_slot(&self) -> MutexGuard<'_, Option<ProbeSlot>> {
        lock(&self.probe)
    }

    /// Aborts the in-flight probe, if any.
    pub fn cancel_probe(&self) {
        if let Some(slot) = lock(&self.probe).take() {
            tracing::debug!(client_id = %self.id, probe_id = %slot.probe_id, "cancelling NAT probe");
            slot.abort.abort();
        }
    }
}

/// Concurrent connection ↔ identity index.
///
/// Both directions are O(1); each shard lock is held only for the map
/// update.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    by_conn: DashMap<ConnId, Arc<ClientSession>>,
    by_id: DashMap<ClientId, Arc<ClientSession>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session with a fresh identity and random profile for the
    /// given connection.
    pub fn register(&self, handle: ConnHandle) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(handle));
        self.by_id.insert(session.id.clone(), Arc::clone(&session));
        self.by_conn.insert(session.conn_id(), Arc::clone(&session));
        session
    }

    /// Look up a session by connection.
    #[must_use]
    pub fn lookup_by_connection(&self, conn_id: ConnId) -> Option<Arc<ClientSession>> {
        self.by_conn.get(&conn_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a session by identity.
    #[must_use]
    pub fn lookup_by_identity(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.by_id.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops both index entries for a connection, returning the session.
    ///
    /// Room membership is not touched.
    pub fn remove(&self, conn_id: ConnId) -> Option<Arc<ClientSession>> {
        let (_, session) = self.by_conn.remove(&conn_id)?;
        self.by_id.remove(session.id());
        Some(session)
    }

    /// Snapshot of all sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.by_conn
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    /// Returns `true` if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }
}

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::metrics::counters;
use crate::registry::{ClientSession, ProbeSlot};
use sharee_common::envelope::Outbound;
use sharee_common::types::MAX_PROBE_TOKEN_LEN;
use sharee_common::NatType;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Bounded set of UDP ports handed out to probes.
///
/// With a base of `0` every slot is port `0` and the OS picks the actual
/// port at bind time; the pool then only bounds concurrency.
#[derive(Debug, Clone)]
pub struct PortPool {
    free: Arc<Mutex<VecDeque<u16>>>,
    capacity: usize,
}

impl PortPool {
    /// Creates a pool of `count` ports starting at `base`.
    #[must_use]
    pub fn new(base: u16, count: u16) -> Self {
        let free: VecDeque<u16> = if base == 0 {
            std::iter::repeat(0).take(usize::from(count)).collect()
        } else {
            (0..count).filter_map(|i| base.checked_add(i)).collect()
        };
        let capacity = free.len();
        Self {
            free: Arc::new(Mutex::new(free)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<u16>> {
        self.free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Takes a free slot. `None` when every slot is leased.
    #[must_use]
    pub fn acquire(&self) -> Option<PortLease> {
        let port = self.lock().pop_front()?;
        Some(PortLease {
            pool: self.clone(),
            port,
        })
    }

    /// Number of slots not currently leased.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A leased pool slot, returned when dropped.
#[derive(Debug)]
pub struct PortLease {
    pool: PortPool,
    port: u16,
}

impl PortLease {
    /// Port to bind; `0` means any.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.lock().push_back(self.port);
    }
}

/// Addresses the client reported when it asked for a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Server-reflexive address from the client's STUN query.
    pub mapped_address: Option<SocketAddr>,
    /// The client's host candidate address.
    pub local_address: Option<SocketAddr>,
}

/// A probe that has been started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTicket {
    /// Token the client must send.
    pub probe_id: String,
    /// UDP port the token must be sent to.
    pub port: u16,
}

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Derived NAT classification.
    pub nat_type: NatType,
    /// `false` when there was not enough data to decide.
    pub conclusive: bool,
    /// Where the datagram came from, if one arrived.
    pub observed: Option<SocketAddr>,
}

impl Classification {
    fn timed_out() -> Self {
        Self {
            nat_type: NatType::Unknown,
            conclusive: false,
            observed: None,
        }
    }

    /// Static label used for metrics.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match (self.observed, self.nat_type) {
            (None, _) => "timeout",
            (Some(_), NatType::PublicIp) => "public_ip",
            (Some(_), NatType::Cone) => "cone",
            (Some(_), NatType::Symmetric) => "symmetric",
            (Some(_), NatType::Blocked) => "blocked",
            (Some(_), NatType::Unknown) => "inconclusive",
        }
    }
}

/// Applies the probe decision table to an observed source address.
#[must_use]
pub fn classify(observed: SocketAddr, reported: &ProbeRequest) -> Classification {
    let observed_ip = observed.ip().to_canonical();
    let (nat_type, conclusive) = if reported
        .local_address
        .is_some_and(|local| local.ip().to_canonical() == observed_ip)
    {
        (NatType::PublicIp, true)
    } else {
        match reported.mapped_address {
            None => (NatType::Unknown, false),
            Some(mapped) if mapped.port() == observed.port() => (NatType::Cone, true),
            Some(_) => (NatType::Symmetric, true),
        }
    };
    Classification {
        nat_type,
        conclusive,
        observed: Some(observed),
    }
}

/// Waits up to `timeout` for a datagram carrying `token` and classifies its
/// source address. Datagrams with any other body are ignored.
pub async fn probe_nat_behavior(
    socket: &UdpSocket,
    token: &str,
    reported: &ProbeRequest,
    timeout: Duration,
) -> Classification {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; MAX_PROBE_TOKEN_LEN * 2];
    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => return Classification::timed_out(),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "probe socket receive failed");
                return Classification::timed_out();
            }
            Ok(Ok((len, from))) => {
                if &buf[..len] == token.as_bytes() {
                    return classify(from, reported);
                }
                tracing::debug!(from = %from, len, "ignoring stray datagram on probe port");
            }
        }
    }
}

/// Runs UDP round-trip probes on behalf of clients.
#[derive(Debug)]
pub struct ProbeService {
    bind: IpAddr,
    pool: PortPool,
    timeout: Duration,
}

impl ProbeService {
    /// Creates a service binding on `bind` with ports from `pool`.
    #[must_use]
    pub fn new(bind: IpAddr, pool: PortPool, timeout: Duration) -> Self {
        Self {
            bind,
            pool,
            timeout,
        }
    }

    /// Builds the service from the probe settings in `config`.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.probe_bind,
            PortPool::new(config.probe_port_base, config.probe_port_count),
            Duration::from_secs(config.probe_timeout),
        )
    }

    /// The port pool backing this service.
    #[must_use]
    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    /// Reserves a port, tells the client where to send its token and spawns
    /// the probe task. The result arrives later as `nat_probe_result`.
    ///
    /// # Errors
    ///
    /// [`RelayError::ProbeInProgress`] if the session already has a probe
    /// running, [`RelayError::ResourceExhausted`] if no port can be leased
    /// or bound.
    pub fn start(
        &self,
        session: &Arc<ClientSession>,
        request: ProbeRequest,
    ) -> Result<ProbeTicket, RelayError> {
        let mut slot = session.probe_slot();
        if slot.as_ref().is_some_and(|s| !s.abort.is_finished()) {
            return Err(RelayError::ProbeInProgress);
        }

        let lease = self.pool.acquire().ok_or_else(|| {
            counters::nat_probes_total("exhausted");
            RelayError::ResourceExhausted
        })?;
        let socket = bind_udp(SocketAddr::new(self.bind, lease.port())).map_err(|e| {
            tracing::warn!(port = lease.port(), error = %e, "failed to bind probe socket");
            counters::nat_probes_total("bind_failed");
            RelayError::ResourceExhausted
        })?;
        let port = socket
            .local_addr()
            .map_err(|_| RelayError::ResourceExhausted)?
            .port();

        let probe_id = uuid::Uuid::new_v4().simple().to_string();
        session.reply(&Outbound::NatProbeReady {
            probe_id: probe_id.clone(),
            port,
        });
        tracing::debug!(client_id = %session.id(), probe_id = %probe_id, port, "NAT probe started");

        let task = {
            let session = Arc::clone(session);
            let probe_id = probe_id.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                let _lease = lease;
                let result = probe_nat_behavior(&socket, &probe_id, &request, timeout).await;
                counters::nat_probes_total(result.outcome());
                tracing::debug!(
                    client_id = %session.id(),
                    probe_id = %probe_id,
                    nat_type = %result.nat_type,
                    conclusive = result.conclusive,
                    "NAT probe finished"
                );
                session.reply(&Outbound::NatProbeResult {
                    probe_id: probe_id.clone(),
                    nat_type: result.nat_type,
                    conclusive: result.conclusive,
                    observed_address: result.observed.map(|a| a.to_string()),
                });
                let mut slot = session.probe_slot();
                if slot.as_ref().is_some_and(|s| s.probe_id == probe_id) {
                    *slot = None;
                }
            })
        };
        *slot = Some(ProbeSlot {
            probe_id: probe_id.clone(),
            abort: task.abort_handle(),
        });

        Ok(ProbeTicket { probe_id, port })
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientRegistry, ConnHandle, Outgoing};
    use tokio::sync::mpsc;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn service(count: u16, timeout: Duration) -> ProbeService {
        ProbeService::new(
            "127.0.0.1".parse().unwrap(),
            PortPool::new(0, count),
            timeout,
        )
    }

    fn session(registry: &ClientRegistry) -> (Arc<ClientSession>, mpsc::Receiver<Outgoing>) {
        let (handle, rx) = ConnHandle::channel(16);
        (registry.register(handle), rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outgoing>) -> Outbound {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outgoing::Text(text) = item else {
            panic!("expected text frame, got {item:?}");
        };
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn pool_lease_returns_slot_on_drop() {
        let pool = PortPool::new(40_000, 2);
        assert_eq!(pool.capacity(), 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.port(), b.port()), (40_000, 40_001));
        assert!(pool.acquire().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.acquire().unwrap().port(), 40_000);
    }

    #[test]
    fn os_assigned_pool_still_bounds_concurrency() {
        let pool = PortPool::new(0, 1);
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.port(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn matching_host_address_is_public_ip() {
        let reported = ProbeRequest {
            mapped_address: Some(addr("203.0.113.7:5000")),
            local_address: Some(addr("203.0.113.7:5000")),
        };
        let c = classify(addr("203.0.113.7:5000"), &reported);
        assert_eq!(c.nat_type, NatType::PublicIp);
        assert!(c.conclusive);
    }

    #[test]
    fn same_port_is_cone() {
        let reported = ProbeRequest {
            mapped_address: Some(addr("203.0.113.7:5000")),
            local_address: Some(addr("192.168.1.10:5000")),
        };
        let c = classify(addr("203.0.113.7:5000"), &reported);
        assert_eq!(c.nat_type, NatType::Cone);
        assert!(c.conclusive);
        assert_eq!(c.outcome(), "cone");
    }

    #[test]
    fn different_port_is_symmetric() {
        let reported = ProbeRequest {
            mapped_address: Some(addr("203.0.113.7:5000")),
            local_address: None,
        };
        let c = classify(addr("203.0.113.7:6123"), &reported);
        assert_eq!(c.nat_type, NatType::Symmetric);
        assert!(c.conclusive);
    }

    #[test]
    fn missing_mapped_address_is_inconclusive() {
        let c = classify(addr("203.0.113.7:5000"), &ProbeRequest::default());
        assert_eq!(c.nat_type, NatType::Unknown);
        assert!(!c.conclusive);
        assert_eq!(c.observed, Some(addr("203.0.113.7:5000")));
    }

    #[test]
    fn v4_mapped_v6_matches_v4_host() {
        let reported = ProbeRequest {
            mapped_address: None,
            local_address: Some(addr("198.51.100.4:1")),
        };
        let c = classify(addr("[::ffff:198.51.100.4]:9"), &reported);
        assert_eq!(c.nat_type, NatType::PublicIp);
    }

    #[tokio::test]
    async fn probe_classifies_first_matching_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let reported = ProbeRequest {
            mapped_address: Some(client_addr),
            local_address: Some(addr("10.1.2.3:1")),
        };

        client.send_to(b"not-the-token", target).await.unwrap();
        client.send_to(b"tok", target).await.unwrap();
        let c = probe_nat_behavior(&server, "tok", &reported, Duration::from_secs(5)).await;
        assert_eq!(c.nat_type, NatType::Cone);
        assert_eq!(c.observed, Some(client_addr));
    }

    #[tokio::test]
    async fn probe_times_out_without_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c = probe_nat_behavior(
            &server,
            "tok",
            &ProbeRequest::default(),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(c, Classification::timed_out());
        assert_eq!(c.outcome(), "timeout");
    }

    #[tokio::test]
    async fn start_replies_ready_then_result() {
        let registry = ClientRegistry::new();
        let (session, mut rx) = session(&registry);
        let probes = service(4, Duration::from_secs(5));
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = ProbeRequest {
            mapped_address: Some(addr("127.0.0.1:1")),
            local_address: None,
        };

        let ticket = probes.start(&session, request).unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            Outbound::NatProbeReady {
                probe_id: ticket.probe_id.clone(),
                port: ticket.port,
            }
        );
        assert_eq!(probes.pool().available(), 3);

        client
            .send_to(ticket.probe_id.as_bytes(), ("127.0.0.1", ticket.port))
            .await
            .unwrap();
        match next_frame(&mut rx).await {
            Outbound::NatProbeResult {
                probe_id,
                nat_type,
                conclusive,
                ..
            } => {
                assert_eq!(probe_id, ticket.probe_id);
                assert_eq!(nat_type, NatType::Symmetric);
                assert!(conclusive);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probes.pool().available(), 4);
        assert!(session.probe_slot().is_none());
    }

    #[tokio::test]
    async fn second_probe_from_same_session_is_rejected() {
        let registry = ClientRegistry::new();
        let (session, _rx) = session(&registry);
        let probes = service(4, Duration::from_secs(5));

        probes.start(&session, ProbeRequest::default()).unwrap();
        assert_eq!(
            probes.start(&session, ProbeRequest::default()),
            Err(RelayError::ProbeInProgress)
        );
    }

    #[tokio::test]
    async fn exhausted_pool_is_reported() {
        let registry = ClientRegistry::new();
        let (a, _ra) = session(&registry);
        let (b, _rb) = session(&registry);
        let probes = service(1, Duration::from_secs(5));

        probes.start(&a, ProbeRequest::default()).unwrap();
        assert_eq!(
            probes.start(&b, ProbeRequest::default()),
            Err(RelayError::ResourceExhausted)
        );
    }

    #[tokio::test]
    async fn cancel_releases_the_port() {
        let registry = ClientRegistry::new();
        let (session, _rx) = session(&registry);
        let probes = service(1, Duration::from_secs(30));

        probes.start(&session, ProbeRequest::default()).unwrap();
        assert_eq!(probes.pool().available(), 0);
        session.cancel_probe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while probes.pool().available() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

use crate::metrics::counters;
use crate::registry::ClientRegistry;
use std::time::Duration;
use tokio::sync::watch;

/// What one heartbeat cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that were sent a ping.
    pub pinged: usize,
    /// Sessions that missed the previous ping and were terminated.
    pub evicted: usize,
}

/// Periodic ping/pong sweep over every registered session.
///
/// Each cycle terminates sessions that never answered the previous cycle's
/// ping, then clears the liveness flag of the rest and pings them. A pong
/// sets the flag again, so a dead peer is dropped within one to two
/// intervals.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    interval: Duration,
}

impl LivenessMonitor {
    /// Creates a monitor that sweeps every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Runs one heartbeat cycle.
    pub fn sweep(&self, registry: &ClientRegistry) -> SweepReport {
        let mut report = SweepReport::default();
        for session in registry.sessions() {
            if session.is_terminated() {
                continue;
            }
            if !session.take_alive() {
                tracing::warn!(client_id = %session.id(), "terminating dead connection");
                counters::heartbeat_evictions_total();
                session.terminate();
                report.evicted += 1;
                continue;
            }
            match session.send_ping() {
                Ok(()) => report.pinged += 1,
                Err(reason) => {
                    counters::delivery_failures_total(reason.as_str());
                    tracing::debug!(client_id = %session.id(), reason = reason.as_str(), "ping not queued");
                }
            }
        }
        if report.evicted > 0 {
            tracing::debug!(pinged = report.pinged, evicted = report.evicted, "heartbeat sweep");
        }
        report
    }

    /// Sweeps `registry` every interval until `shutdown` changes or its
    /// sender is dropped.
    pub async fn run(self, registry: &ClientRegistry, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(registry);
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("liveness monitor stopped");
    }
}

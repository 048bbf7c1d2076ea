use chatmirror_messaging::OutboundTransport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Consecutive failed probes before the remote host is reported down.
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Unknown,
    Up,
    Down,
}

/// Debounces raw probe results: one success brings the host up, three
/// failures in a row take it down.
#[derive(Debug, Clone)]
pub struct ConnectivityTracker {
    state: Connectivity,
    consecutive_failures: u32,
}

impl ConnectivityTracker {
    pub fn new() -> Self {
        Self {
            state: Connectivity::Unknown,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> Connectivity {
        self.state
    }

    /// Record one probe; returns the new state when it changed.
    pub fn record(&mut self, reachable: bool) -> Option<Connectivity> {
        let next = if reachable {
            self.consecutive_failures = 0;
            Connectivity::Up
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= FAILURE_THRESHOLD {
                Connectivity::Down
            } else {
                self.state
            }
        };
        (next != self.state).then(|| {
            self.state = next;
            next
        })
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically pings the remote host through the outbound transport.
pub struct LivenessMonitor {
    transport: Arc<dyn OutboundTransport>,
    interval: Duration,
    state_tx: watch::Sender<Connectivity>,
}

impl LivenessMonitor {
    pub fn new(
        transport: Arc<dyn OutboundTransport>,
        interval: Duration,
    ) -> (Self, watch::Receiver<Connectivity>) {
        let (state_tx, state_rx) = watch::channel(Connectivity::Unknown);
        (
            Self {
                transport,
                interval,
                state_tx,
            },
            state_rx,
        )
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut tracker = ConnectivityTracker::new();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reachable = self.transport.ping().await;
                    if let Some(state) = tracker.record(reachable) {
                        match state {
                            Connectivity::Down => warn!("remote host unreachable"),
                            _ => info!(?state, "remote host connectivity changed"),
                        }
                        self.state_tx.send_replace(state);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

//! Local-IP liveness monitoring and transport recovery.
//!
//! Cellular and WiFi links change the drone's outbound address without
//! warning. The monitor samples the outbound local IP every few seconds (and
//! immediately on a reported network error) by connecting a UDP socket to a
//! stable external address and reading its local endpoint. On a change it
//! rebuilds the MAVLink sender socket and forces the control channel to
//! reconnect so both transports move to the new 5-tuple together.

use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlChannel;
use crate::endpoint::MavlinkEndpoint;
use crate::metrics::Metrics;

/// Address used to learn the outbound local IP. No traffic is sent; the UDP
/// connect only selects a route.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Sampling cadence between forced checks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of recording a sampled IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpChange {
    /// First sample of the process lifetime
    Initial,
    /// Same address as the previous sample
    Unchanged,
    /// The address moved
    Changed {
        /// Previous address
        old: String,
    },
}

#[derive(Debug, Default)]
struct LinkInner {
    current_ip: String,
    last_change: Option<Instant>,
    healthy: bool,
}

/// Shared link-health state.
///
/// The forwarder reads `healthy` before every upstream send; the session
/// manager reads `last_change` to skip refreshes during a rebuild; the
/// control channel calls [`LinkState::note_network_error`] when a socket
/// operation fails.
#[derive(Debug)]
pub struct LinkState {
    inner: RwLock<LinkInner>,
    force_check: Notify,
}

impl LinkState {
    /// Creates a healthy link with no sampled IP yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(LinkInner {
                healthy: true,
                ..Default::default()
            }),
            force_check: Notify::new(),
        })
    }

    /// Last sampled outbound IP, empty before the first sample.
    pub fn current_ip(&self) -> String {
        self.inner.read().current_ip.clone()
    }

    /// True while upstream forwarding is allowed.
    pub fn is_healthy(&self) -> bool {
        self.inner.read().healthy
    }

    /// Sets the health flag.
    pub fn set_healthy(&self, healthy: bool) {
        self.inner.write().healthy = healthy;
    }

    /// Reports a socket-level failure: marks the link unhealthy and wakes the
    /// monitor for an immediate check, bypassing the sampling cadence.
    pub fn note_network_error(&self) {
        {
            let mut inner = self.inner.write();
            if inner.healthy {
                warn!("network error reported, marking link unhealthy");
                inner.healthy = false;
            }
        }
        self.force_check.notify_one();
    }

    /// True if the IP changed within the given window.
    pub fn ip_changed_within(&self, window: Duration) -> bool {
        self.inner
            .read()
            .last_change
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }

    /// Records a sampled IP, stamping the change time on a move.
    pub fn record_ip(&self, ip: &str) -> IpChange {
        let mut inner = self.inner.write();
        if inner.current_ip.is_empty() {
            inner.current_ip = ip.to_string();
            IpChange::Initial
        } else if inner.current_ip != ip {
            let old = std::mem::replace(&mut inner.current_ip, ip.to_string());
            inner.last_change = Some(Instant::now());
            IpChange::Changed { old }
        } else {
            IpChange::Unchanged
        }
    }

    /// Waits for a forced-check notification.
    pub async fn forced_check(&self) {
        self.force_check.notified().await;
    }
}

/// Returns the local IP used for outbound traffic.
pub fn detect_local_ip() -> std::io::Result<String> {
    let socket = StdUdpSocket::bind("0.0.0.0:0")?;
    socket.connect(PROBE_ADDR)?;
    Ok(socket.local_addr()?.ip().to_string())
}

/// Periodic IP monitor that coordinates transport recovery.
pub struct LivenessMonitor {
    state: Arc<LinkState>,
    endpoint: Arc<MavlinkEndpoint>,
    control: Arc<ControlChannel>,
    metrics: Arc<Metrics>,
}

impl LivenessMonitor {
    /// Creates the monitor over the shared link state and both transports.
    pub fn new(
        state: Arc<LinkState>,
        endpoint: Arc<MavlinkEndpoint>,
        control: Arc<ControlChannel>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            endpoint,
            control,
            metrics,
        }
    }

    /// Runs until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        self.check_ip().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("liveness monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(CHECK_INTERVAL) => {
                    self.check_ip().await;
                }
                _ = self.state.forced_check() => {
                    debug!("forced liveness check");
                    self.check_ip().await;
                }
            }
        }
    }

    async fn check_ip(&self) {
        let current = match detect_local_ip() {
            Ok(ip) => ip,
            Err(e) => {
                debug!("failed to detect local IP: {}", e);
                return;
            }
        };

        match self.state.record_ip(&current) {
            IpChange::Initial => {
                info!("initial local IP: {}", current);
                self.metrics.set_ip(&current);
                self.metrics.add_log("INFO", format!("initial IP: {}", current));
                self.state.set_healthy(true);
            }
            IpChange::Unchanged => {}
            IpChange::Changed { old } => {
                warn!("local IP changed: {} -> {}, rebuilding transports", old, current);
                self.metrics.set_ip(&current);
                self.metrics
                    .add_log("WARN", format!("IP changed: {} -> {}", old, current));

                // Sender teardown completes before the control reconnect is
                // scheduled; the session manager skips its next refresh while
                // this is in flight.
                if let Err(e) = self.endpoint.rebuild_sender().await {
                    warn!("failed to rebuild sender socket: {}", e);
                    return;
                }
                self.control.force_reconnect().await;
                self.state.set_healthy(true);
                info!("transports rebuilt on new IP {}", current);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ip_transitions() {
        let state = LinkState::new();
        assert_eq!(state.record_ip("10.0.0.5"), IpChange::Initial);
        assert_eq!(state.record_ip("10.0.0.5"), IpChange::Unchanged);
        assert_eq!(
            state.record_ip("10.0.0.9"),
            IpChange::Changed {
                old: "10.0.0.5".to_string()
            }
        );
        assert_eq!(state.current_ip(), "10.0.0.9");
    }

    #[test]
    fn test_ip_changed_within_window() {
        let state = LinkState::new();
        state.record_ip("10.0.0.5");
        // Initial sample is not a change.
        assert!(!state.ip_changed_within(Duration::from_secs(10)));

        state.record_ip("10.0.0.9");
        assert!(state.ip_changed_within(Duration::from_secs(10)));
        assert!(!state.ip_changed_within(Duration::ZERO));
    }

    #[test]
    fn test_network_error_marks_unhealthy() {
        let state = LinkState::new();
        assert!(state.is_healthy());
        state.note_network_error();
        assert!(!state.is_healthy());
        state.set_healthy(true);
        assert!(state.is_healthy());
    }

    #[tokio::test]
    async fn test_forced_check_wakes_waiter() {
        let state = LinkState::new();
        let waiter = state.clone();
        let handle = tokio::spawn(async move { waiter.forced_check().await });
        // notify_one stores a permit even if the waiter is not yet parked
        state.note_network_error();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("join");
    }
}

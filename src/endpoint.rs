//! MAVLink UDP endpoint: local listener, remote sender, session heartbeat.
//!
//! Two logical nodes share this struct. The *listener* is bound on the local
//! MAVLink port (optionally joined by a broadcast socket for discovery) and
//! speaks to the flight controller with the GCS identity (system id 255).
//! The *sender* is a connected UDP socket toward the fleet router whose
//! outbound identity is the discovered flight-controller system id; it is
//! rebuilt on IP changes by an atomic swap so in-flight readers keep a
//! consistent handle.
//!
//! The endpoint also originates the MAVLink-wrapped `SESSION_HEARTBEAT` on
//! the sender socket, which bonds the session token to the same UDP 5-tuple
//! that carries the forwarded MAVLink data.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::mavlink_ext::SessionHeartbeat;
use crate::session::SharedSession;

/// MAVLink system id the listener presents toward the flight controller.
pub const GCS_SYSTEM_ID: u8 = 255;

/// Component id used for locally-originated messages.
const OUT_COMPONENT_ID: u8 = 1;

/// Fallback system id when discovery was skipped.
const DEFAULT_SYSTEM_ID: u8 = 1;

/// The bridge's pair of UDP nodes.
pub struct MavlinkEndpoint {
    listener: Arc<UdpSocket>,
    broadcast: Option<Arc<UdpSocket>>,
    target: String,
    sender: RwLock<Option<Arc<UdpSocket>>>,
    sender_swapped: Notify,
    out_system_id: AtomicU8,
    fc_addr: RwLock<Option<SocketAddr>>,
    session: SharedSession,
    heartbeat_emitted: AtomicBool,
    heartbeat_notify: Notify,
}

impl MavlinkEndpoint {
    /// Binds the listener (and the optional broadcast socket); the sender is
    /// built later, once discovery has produced a system id.
    ///
    /// `broadcast` is `(local_ip, port)` where port 0 picks a random port.
    pub async fn bind(
        listen_port: u16,
        broadcast: Option<(String, u16)>,
        target: String,
        session: SharedSession,
    ) -> Result<Arc<Self>> {
        let listener = UdpSocket::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| BridgeError::network(format!("bind UDP listener :{}", listen_port), e))?;
        info!(
            "MAVLink listener bound on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| format!("0.0.0.0:{}", listen_port))
        );

        let broadcast_socket = match broadcast {
            Some((local_ip, port)) => {
                let socket = UdpSocket::bind((local_ip.as_str(), port))
                    .await
                    .map_err(|e| {
                        BridgeError::network(format!("bind broadcast socket {}:{}", local_ip, port), e)
                    })?;
                socket
                    .set_broadcast(true)
                    .map_err(|e| BridgeError::network("enable SO_BROADCAST", e))?;
                info!(
                    "UDP broadcast discovery enabled on {}",
                    socket
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default()
                );
                Some(Arc::new(socket))
            }
            None => {
                debug!("UDP broadcast discovery disabled");
                None
            }
        };

        Ok(Arc::new(Self {
            listener: Arc::new(listener),
            broadcast: broadcast_socket,
            target,
            sender: RwLock::new(None),
            sender_swapped: Notify::new(),
            out_system_id: AtomicU8::new(DEFAULT_SYSTEM_ID),
            fc_addr: RwLock::new(None),
            session,
            heartbeat_emitted: AtomicBool::new(false),
            heartbeat_notify: Notify::new(),
        }))
    }

    /// The listener's bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The listener socket (shared with discovery and the forwarder).
    pub fn listener(&self) -> Arc<UdpSocket> {
        self.listener.clone()
    }

    /// The broadcast socket, when discovery fallback is enabled.
    pub fn broadcast_socket(&self) -> Option<Arc<UdpSocket>> {
        self.broadcast.clone()
    }

    /// Sets the outbound identity to the discovered system id.
    pub fn set_out_system_id(&self, system_id: u8) {
        self.out_system_id.store(system_id, Ordering::Release);
    }

    /// The current outbound system id.
    pub fn out_system_id(&self) -> u8 {
        self.out_system_id.load(Ordering::Acquire)
    }

    /// Records the flight controller's address for downstream writes.
    pub fn note_fc_addr(&self, addr: SocketAddr) {
        let mut guard = self.fc_addr.write();
        if *guard != Some(addr) {
            debug!("flight controller address recorded: {}", addr);
            *guard = Some(addr);
        }
    }

    /// The recorded flight-controller address, if discovered.
    pub fn fc_addr(&self) -> Option<SocketAddr> {
        *self.fc_addr.read()
    }

    /// Builds (or rebuilds) the sender socket toward the router.
    ///
    /// The new socket replaces the old behind the lock; pending readers are
    /// woken so they pick up the new handle.
    pub async fn rebuild_sender(&self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| BridgeError::network("bind sender socket", e))?;
        socket
            .connect(&self.target)
            .await
            .map_err(|e| BridgeError::network(format!("connect sender to {}", self.target), e))?;
        debug!(
            "sender socket ready toward {} (out_system_id={})",
            self.target,
            self.out_system_id()
        );

        *self.sender.write() = Some(Arc::new(socket));
        self.sender_swapped.notify_waiters();
        Ok(())
    }

    /// The current sender socket handle.
    pub fn sender_socket(&self) -> Option<Arc<UdpSocket>> {
        self.sender.read().clone()
    }

    /// Completes when the sender socket has been swapped.
    pub async fn sender_swapped(&self) {
        self.sender_swapped.notified().await;
    }

    /// Sends raw frame bytes to the router on the current sender socket.
    pub async fn send_upstream(&self, data: &[u8]) -> std::io::Result<()> {
        let socket = self.sender_socket().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "sender not built")
        })?;
        socket.send(data).await.map(|_| ())
    }

    /// Sends raw frame bytes to the flight controller via the listener
    /// socket. Returns `false` when no flight controller address is known.
    pub async fn send_downstream(&self, data: &[u8]) -> std::io::Result<bool> {
        let Some(addr) = self.fc_addr() else {
            return Ok(false);
        };
        self.listener.send_to(data, addr).await.map(|_| true)
    }

    /// Blocks until the first `SESSION_HEARTBEAT` has been emitted, or the
    /// grace period elapses.
    pub async fn wait_first_heartbeat(&self, grace: Duration) {
        if self.heartbeat_emitted.load(Ordering::Acquire) {
            return;
        }
        let notified = self.heartbeat_notify.notified();
        if self.heartbeat_emitted.load(Ordering::Acquire) {
            return;
        }
        if tokio::time::timeout(grace, notified).await.is_err() {
            warn!("timeout waiting for first session heartbeat, proceeding anyway");
        }
    }

    /// Emits `SESSION_HEARTBEAT` frames at the configured rate until
    /// cancelled. Emission starts once a session token exists.
    pub async fn run_session_heartbeat(
        self: Arc<Self>,
        frequency_hz: f64,
        cancel: CancellationToken,
    ) {
        let frequency = if frequency_hz > 0.0 { frequency_hz } else { 1.0 };
        let period = Duration::from_secs_f64(1.0 / frequency);
        info!("session heartbeat starting at {:.1} Hz", frequency);

        let mut payload_seq: u16 = 0;
        let mut packet_seq: u8 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("session heartbeat shutting down");
                    break;
                }
                _ = tokio::time::sleep(period) => {
                    let (token, expires_at) = {
                        let session = self.session.read();
                        (session.token.clone(), session.expires_at)
                    };
                    if token.is_empty() {
                        continue; // no session yet
                    }

                    let Some(heartbeat) =
                        SessionHeartbeat::from_session(&token, expires_at, payload_seq)
                    else {
                        warn!("session token too short for heartbeat ({} chars)", token.len());
                        continue;
                    };

                    let frame =
                        heartbeat.encode(self.out_system_id(), OUT_COMPONENT_ID, packet_seq);
                    match self.send_upstream(&frame).await {
                        Ok(()) => {
                            payload_seq = payload_seq.wrapping_add(1);
                            packet_seq = packet_seq.wrapping_add(1);
                            if !self.heartbeat_emitted.swap(true, Ordering::AcqRel) {
                                info!("first session heartbeat sent");
                                self.heartbeat_notify.notify_waiters();
                            }
                        }
                        Err(e) => {
                            error!("failed to send session heartbeat: {}", e);
                        }
                    }
                }
            }
        }
    }
}

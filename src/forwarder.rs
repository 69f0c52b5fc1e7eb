//! Flight-controller discovery and bidirectional MAVLink forwarding.
//!
//! Discovery waits for the first inbound `HEARTBEAT` to learn the flight
//! controller's address and system id; the forwarder then shuttles raw frames
//! between the local listener and the remote router. Upstream frames are
//! filtered (our own GCS identity never goes to the router), deduplicated by
//! `(system_id, sequence)`, counted per message type, and dropped instead of
//! buffered while the link is unhealthy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mavlink::common::MavMessage;
use mavlink::Message;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::SeqDedup;
use crate::endpoint::{MavlinkEndpoint, GCS_SYSTEM_ID};
use crate::error::{BridgeError, Result};
use crate::framing::{FrameParser, MavlinkFrame};
use crate::liveness::LinkState;
use crate::mavlink_names::message_name;
use crate::metrics::Metrics;

/// Human-readable summary logs are emitted at most this often per type.
const LOG_THROTTLE: Duration = Duration::from_secs(30);

/// Upstream statistics roll cadence, in forwarded frames.
const UPSTREAM_STATS_EVERY: u64 = 10_000;

/// Downstream statistics roll cadence, in frames.
const DOWNSTREAM_STATS_EVERY: u64 = 1_000;

/// Receives every upstream `PARAM_VALUE` for parameter caching.
pub trait ParamSink: Send + Sync {
    /// Called once per observed PARAM_VALUE.
    fn on_param_value(&self, msg: &mavlink::common::PARAM_VALUE_DATA);
}

/// Notified exactly once, on the first flight-controller heartbeat.
pub trait HeartbeatSink: Send + Sync {
    /// Called with the discovered system id.
    fn on_heartbeat(&self, system_id: u8);
}

/// Result of the discovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredLink {
    /// Whether a heartbeat was actually observed
    pub connected: bool,
    /// Discovered system id, or the default (1) on a permissive timeout
    pub system_id: u8,
    /// Source address of the heartbeat, when observed
    pub fc_addr: Option<SocketAddr>,
}

async fn recv_optional(
    socket: &Option<Arc<UdpSocket>>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Waits up to `wait` for a heartbeat on the listener or broadcast socket.
async fn wait_for_heartbeat(
    endpoint: &MavlinkEndpoint,
    wait: Duration,
) -> Option<(SocketAddr, u8)> {
    let listener = endpoint.listener();
    let broadcast = endpoint.broadcast_socket();
    let mut parser = FrameParser::new();
    let mut buf_listener = vec![0u8; 65535];
    let mut buf_broadcast = vec![0u8; 65535];

    let scan = async {
        loop {
            let (n, addr, from_broadcast) = tokio::select! {
                res = listener.recv_from(&mut buf_listener) => {
                    match res {
                        Ok((n, addr)) => (n, addr, false),
                        Err(e) => {
                            debug!("discovery recv error: {}", e);
                            continue;
                        }
                    }
                }
                res = recv_optional(&broadcast, &mut buf_broadcast), if broadcast.is_some() => {
                    match res {
                        Ok((n, addr)) => (n, addr, true),
                        Err(e) => {
                            debug!("discovery broadcast recv error: {}", e);
                            continue;
                        }
                    }
                }
            };

            let data = if from_broadcast {
                &buf_broadcast[..n]
            } else {
                &buf_listener[..n]
            };
            parser.push(data);
            while let Some(frame) = parser.parse_next() {
                let system_id = frame.header.system_id;
                if system_id == GCS_SYSTEM_ID {
                    continue;
                }
                if frame.message.message_id() == 0 {
                    return (addr, system_id);
                }
            }
        }
    };

    tokio::time::timeout(wait, scan).await.ok()
}

/// Runs the discovery phase.
///
/// Returns exactly one of a connected link with the observed system id, or a
/// permissive-timeout link with the default system id; a strict timeout is an
/// error and the control channel is never opened.
pub async fn discover(
    endpoint: &MavlinkEndpoint,
    timeout: Duration,
    allow_missing: bool,
    fallback_wait: Duration,
) -> Result<DiscoveredLink> {
    info!(
        "discovery: waiting up to {:?} for flight-controller heartbeat",
        timeout
    );
    if let Some((addr, system_id)) = wait_for_heartbeat(endpoint, timeout).await {
        info!(
            "discovery: flight controller at {} (system id {})",
            addr, system_id
        );
        return Ok(DiscoveredLink {
            connected: true,
            system_id,
            fc_addr: Some(addr),
        });
    }

    if !allow_missing {
        return Err(BridgeError::Discovery(format!(
            "no flight-controller heartbeat within {:?}",
            timeout
        )));
    }

    warn!(
        "discovery: timed out but allow_missing_pixhawk is set, waiting {:?} on broadcast fallback",
        fallback_wait
    );
    if let Some((addr, system_id)) = wait_for_heartbeat(endpoint, fallback_wait).await {
        info!(
            "discovery: heartbeat via fallback from {} (system id {})",
            addr, system_id
        );
        return Ok(DiscoveredLink {
            connected: true,
            system_id,
            fc_addr: Some(addr),
        });
    }

    warn!("discovery: no flight controller, using default system id 1");
    Ok(DiscoveredLink {
        connected: false,
        system_id: 1,
        fc_addr: None,
    })
}

/// Decision for one upstream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAction {
    /// Our own GCS identity echoed back; never forwarded
    DropGcs,
    /// Same `(system_id, sequence)` as the previous frame from that system
    DropDuplicate,
    /// The link is unhealthy; counted and dropped, never buffered
    DropUnhealthy,
    /// Forward the raw frame to the router
    Forward,
}

/// Bidirectional frame forwarder.
pub struct Forwarder {
    endpoint: Arc<MavlinkEndpoint>,
    link: Arc<LinkState>,
    metrics: Arc<Metrics>,
    dedup: Mutex<SeqDedup>,
    params: Option<Arc<dyn ParamSink>>,
    heartbeat_sink: Option<Arc<dyn HeartbeatSink>>,
    pixhawk_seen: AtomicBool,
    verbose: bool,
    stats_interval: Duration,
    log_throttle: Mutex<HashMap<u32, Instant>>,
    received: AtomicU64,
    forwarded: AtomicU64,
}

impl Forwarder {
    /// Creates a forwarder over the endpoint and link state.
    ///
    /// `pixhawk_already_seen` suppresses the one-shot heartbeat notification
    /// when discovery already observed (and reported) the first heartbeat.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Arc<MavlinkEndpoint>,
        link: Arc<LinkState>,
        metrics: Arc<Metrics>,
        verbose: bool,
        stats_interval: Duration,
        pixhawk_already_seen: bool,
        params: Option<Arc<dyn ParamSink>>,
        heartbeat_sink: Option<Arc<dyn HeartbeatSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            link,
            metrics,
            dedup: Mutex::new(SeqDedup::new()),
            params,
            heartbeat_sink,
            pixhawk_seen: AtomicBool::new(pixhawk_already_seen),
            verbose,
            stats_interval,
            log_throttle: Mutex::new(HashMap::new()),
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
        })
    }

    /// True once per `LOG_THROTTLE` window for the given message id.
    fn should_log(&self, msg_id: u32) -> bool {
        let mut throttle = self.log_throttle.lock();
        let now = Instant::now();
        match throttle.get(&msg_id) {
            Some(last) if now.duration_since(*last) < LOG_THROTTLE => false,
            _ => {
                throttle.insert(msg_id, now);
                true
            }
        }
    }

    /// Classifies an upstream frame, recording it in the dedup table.
    pub fn classify_upstream(&self, system_id: u8, sequence: u8) -> UpstreamAction {
        if system_id == GCS_SYSTEM_ID {
            return UpstreamAction::DropGcs;
        }
        if self.dedup.lock().check_and_insert(system_id, sequence) {
            return UpstreamAction::DropDuplicate;
        }
        if !self.link.is_healthy() {
            return UpstreamAction::DropUnhealthy;
        }
        UpstreamAction::Forward
    }

    fn observe_salient(&self, frame: &MavlinkFrame) {
        let system_id = frame.header.system_id;
        match &frame.message {
            MavMessage::HEARTBEAT(data) => {
                if !self.pixhawk_seen.swap(true, Ordering::AcqRel) {
                    info!(
                        "first heartbeat received from flight controller (system id {})",
                        system_id
                    );
                    if let Some(sink) = &self.heartbeat_sink {
                        sink.on_heartbeat(system_id);
                    }
                }
                if self.should_log(0) {
                    info!(
                        "FC heartbeat: type={:?} base_mode={:?} status={:?}",
                        data.mavtype, data.base_mode, data.system_status
                    );
                }
            }
            MavMessage::GPS_RAW_INT(data) => {
                if self.should_log(24) {
                    info!(
                        "FC gps: fix={:?} lat={:.6} lon={:.6} sats={}",
                        data.fix_type,
                        data.lat as f64 / 1e7,
                        data.lon as f64 / 1e7,
                        data.satellites_visible
                    );
                }
            }
            MavMessage::SYS_STATUS(data) => {
                if self.should_log(1) {
                    info!(
                        "FC status: voltage={:.2}V battery={}%",
                        data.voltage_battery as f64 / 1000.0,
                        data.battery_remaining
                    );
                }
            }
            MavMessage::PARAM_VALUE(data) => {
                if let Some(sink) = &self.params {
                    sink.on_param_value(data);
                }
                debug!(
                    "FC param value ({}/{}) = {}",
                    data.param_index, data.param_count, data.param_value
                );
            }
            _ => {}
        }
    }

    /// Processes one upstream frame end to end.
    pub async fn process_upstream_frame(&self, frame: &MavlinkFrame, src: SocketAddr) {
        let system_id = frame.header.system_id;
        let sequence = frame.header.sequence;
        let msg_id = frame.message.message_id();
        let name = message_name(msg_id);

        self.received.fetch_add(1, Ordering::Relaxed);

        match self.classify_upstream(system_id, sequence) {
            UpstreamAction::DropGcs => {
                debug!("skipping GCS frame {} (system id {})", name, system_id);
            }
            UpstreamAction::DropDuplicate => {
                debug!(
                    "skipping duplicate {} (system id {}, seq {})",
                    name, system_id, sequence
                );
            }
            UpstreamAction::DropUnhealthy => {
                self.endpoint.note_fc_addr(src);
                self.observe_salient(frame);
                self.metrics.inc_failed_unhealthy(&name);
            }
            UpstreamAction::Forward => {
                self.endpoint.note_fc_addr(src);
                self.observe_salient(frame);

                match self.endpoint.send_upstream(&frame.raw).await {
                    Ok(()) => {
                        self.metrics.inc_sent(&name);
                        let forwarded = self.forwarded.fetch_add(1, Ordering::Relaxed) + 1;
                        if forwarded % UPSTREAM_STATS_EVERY == 0 {
                            let received = self.received.load(Ordering::Relaxed);
                            let dropped = received.saturating_sub(forwarded);
                            info!(
                                "forwarded {} frames ({} received, {:.1}% dropped)",
                                forwarded,
                                received,
                                dropped as f64 / received as f64 * 100.0
                            );
                        }
                    }
                    Err(e) => {
                        error!("failed to forward {}: {}", name, e);
                        self.metrics.inc_failed_send(&name);
                    }
                }
            }
        }
    }

    /// Upstream loop: flight controller -> router. Runs until cancelled.
    pub async fn run_upstream(self: Arc<Self>, cancel: CancellationToken) {
        let listener = self.endpoint.listener();
        let broadcast = self.endpoint.broadcast_socket();
        let mut parser = FrameParser::new();
        let mut buf_listener = vec![0u8; 65535];
        let mut buf_broadcast = vec![0u8; 65535];

        info!("upstream forwarding started");
        loop {
            let (n, addr, from_broadcast) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("upstream forwarder shutting down");
                    break;
                }
                res = listener.recv_from(&mut buf_listener) => {
                    match res {
                        Ok((n, addr)) => (n, addr, false),
                        Err(e) => {
                            error!("UDP recv error: {}", e);
                            continue;
                        }
                    }
                }
                res = recv_optional(&broadcast, &mut buf_broadcast), if broadcast.is_some() => {
                    match res {
                        Ok((n, addr)) => (n, addr, true),
                        Err(e) => {
                            error!("UDP broadcast recv error: {}", e);
                            continue;
                        }
                    }
                }
            };

            let data = if from_broadcast {
                &buf_broadcast[..n]
            } else {
                &buf_listener[..n]
            };
            parser.push(data);
            while let Some(frame) = parser.parse_next() {
                self.process_upstream_frame(&frame, addr).await;
            }
        }
    }

    /// Downstream loop: router -> flight controller. Runs until cancelled.
    ///
    /// Re-acquires the sender socket whenever the liveness monitor swaps it.
    pub async fn run_downstream(self: Arc<Self>, cancel: CancellationToken) {
        let mut parser = FrameParser::new();
        let mut buf = vec![0u8; 65535];
        let mut received: u64 = 0;
        let mut last_roll = Instant::now();

        info!("downstream forwarding started");
        loop {
            let Some(socket) = self.endpoint.sender_socket() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.endpoint.sender_swapped() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                }
            };

            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("downstream forwarder shutting down");
                    break;
                }
                _ = self.endpoint.sender_swapped() => continue,
                res = socket.recv(&mut buf) => {
                    match res {
                        Ok(n) => n,
                        Err(e) => {
                            debug!("router socket recv error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    }
                }
            };

            parser.push(&buf[..n]);
            while let Some(frame) = parser.parse_next() {
                received += 1;
                let now = Instant::now();
                if received % DOWNSTREAM_STATS_EVERY == 0
                    || now.duration_since(last_roll) > self.stats_interval
                {
                    info!("received {} frames from router", received);
                    last_roll = now;
                }

                if self.verbose {
                    self.log_downstream_verbose(&frame);
                }

                match self.endpoint.send_downstream(&frame.raw).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("dropping router frame: flight controller address unknown");
                    }
                    Err(e) => {
                        error!("failed to forward frame to flight controller: {}", e);
                    }
                }
            }
        }
    }

    /// Detailed field logging of downstream traffic; never affects forwarding.
    fn log_downstream_verbose(&self, frame: &MavlinkFrame) {
        let system_id = frame.header.system_id;
        match &frame.message {
            MavMessage::HEARTBEAT(m) => {
                info!(
                    "[verbose] HEARTBEAT from router (sys {}): type={:?} autopilot={:?} status={:?}",
                    system_id, m.mavtype, m.autopilot, m.system_status
                );
            }
            MavMessage::SYS_STATUS(m) => {
                info!(
                    "[verbose] SYS_STATUS from router: load={}% battery={}mV ({}%)",
                    m.load / 10,
                    m.voltage_battery,
                    m.battery_remaining
                );
            }
            MavMessage::GPS_RAW_INT(m) => {
                info!(
                    "[verbose] GPS_RAW_INT from router: fix={:?} lat={:.7} lon={:.7} sats={}",
                    m.fix_type,
                    m.lat as f64 / 1e7,
                    m.lon as f64 / 1e7,
                    m.satellites_visible
                );
            }
            MavMessage::ATTITUDE(m) => {
                info!(
                    "[verbose] ATTITUDE from router: roll={:.2} pitch={:.2} yaw={:.2}",
                    m.roll, m.pitch, m.yaw
                );
            }
            MavMessage::GLOBAL_POSITION_INT(m) => {
                info!(
                    "[verbose] GLOBAL_POSITION_INT from router: lat={:.7} lon={:.7} alt={}mm",
                    m.lat as f64 / 1e7,
                    m.lon as f64 / 1e7,
                    m.alt
                );
            }
            MavMessage::VFR_HUD(m) => {
                info!(
                    "[verbose] VFR_HUD from router: airspeed={:.2} groundspeed={:.2} alt={:.2}",
                    m.airspeed, m.groundspeed, m.alt
                );
            }
            MavMessage::PARAM_VALUE(m) => {
                info!(
                    "[verbose] PARAM_VALUE from router: value={:.2} ({}/{})",
                    m.param_value, m.param_index, m.param_count
                );
            }
            MavMessage::COMMAND_ACK(m) => {
                info!(
                    "[verbose] COMMAND_ACK from router: command={:?} result={:?}",
                    m.command, m.result
                );
            }
            other => {
                debug!(
                    "[verbose] {} from router (sys {})",
                    message_name(other.message_id()),
                    system_id
                );
            }
        }
    }
}

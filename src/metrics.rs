//! Write-only statistics sink shared by the forwarder, session manager and
//! liveness monitor.
//!
//! Counters are keyed by MAVLink message-type name. The sink also tracks the
//! current outbound IP, the session snapshot and a bounded ring of recent log
//! lines for external surfaces (web/IPC) to query.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const RECENT_LOG_CAPACITY: usize = 100;

/// One retained log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Unix seconds of the entry
    pub time: u64,
    /// "INFO", "WARN", ...
    pub level: String,
    /// Human-readable message
    pub message: String,
}

#[derive(Debug, Default)]
struct MetricsInner {
    sent: HashMap<String, u64>,
    failed: HashMap<String, u64>,
    failed_unhealthy: HashMap<String, u64>,
    failed_send: HashMap<String, u64>,
    current_ip: String,
    auth_status: String,
    session_expires_at: u64,
    refresh_interval_secs: u64,
    recent_logs: VecDeque<LogEntry>,
}

/// Shared metrics handle. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct Metrics {
    inner: RwLock<MetricsInner>,
    start_time: Instant,
}

/// Point-in-time copy of all counters and status fields.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Forwarded frames per message type
    pub sent: HashMap<String, u64>,
    /// All failed frames per message type
    pub failed: HashMap<String, u64>,
    /// Frames dropped because the link was unhealthy
    pub failed_unhealthy: HashMap<String, u64>,
    /// Frames whose UDP send failed
    pub failed_send: HashMap<String, u64>,
    /// Last sampled outbound IP
    pub current_ip: String,
    /// Authentication status string
    pub auth_status: String,
    /// Session expiry (unix seconds)
    pub session_expires_at: u64,
    /// Refresh interval in seconds
    pub refresh_interval_secs: u64,
    /// Process uptime
    pub uptime: Duration,
    /// Retained log lines, oldest first
    pub recent_logs: Vec<LogEntry>,
}

impl Metrics {
    /// Creates an empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(MetricsInner {
                auth_status: "Initializing".to_string(),
                ..Default::default()
            }),
            start_time: Instant::now(),
        })
    }

    /// Counts a successfully forwarded frame.
    pub fn inc_sent(&self, msg_type: &str) {
        let mut inner = self.inner.write();
        *inner.sent.entry(msg_type.to_string()).or_default() += 1;
    }

    /// Counts a frame dropped while the link was unhealthy.
    pub fn inc_failed_unhealthy(&self, msg_type: &str) {
        let mut inner = self.inner.write();
        *inner.failed.entry(msg_type.to_string()).or_default() += 1;
        *inner
            .failed_unhealthy
            .entry(msg_type.to_string())
            .or_default() += 1;
    }

    /// Counts a frame whose UDP send failed.
    pub fn inc_failed_send(&self, msg_type: &str) {
        let mut inner = self.inner.write();
        *inner.failed.entry(msg_type.to_string()).or_default() += 1;
        *inner.failed_send.entry(msg_type.to_string()).or_default() += 1;
    }

    /// Records the current outbound IP.
    pub fn set_ip(&self, ip: &str) {
        self.inner.write().current_ip = ip.to_string();
    }

    /// Records the authentication status string.
    pub fn set_auth_status(&self, status: &str) {
        self.inner.write().auth_status = status.to_string();
    }

    /// Records the current session expiry and refresh interval.
    pub fn set_session_info(&self, expires_at: u64, interval: Duration) {
        let mut inner = self.inner.write();
        inner.session_expires_at = expires_at;
        inner.refresh_interval_secs = interval.as_secs();
    }

    /// Appends a log line, keeping the most recent entries only.
    pub fn add_log(&self, level: &str, message: impl Into<String>) {
        let mut inner = self.inner.write();
        if inner.recent_logs.len() >= RECENT_LOG_CAPACITY {
            inner.recent_logs.pop_front();
        }
        inner.recent_logs.push_back(LogEntry {
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Total forwarded frames across all message types.
    pub fn total_sent(&self) -> u64 {
        self.inner.read().sent.values().sum()
    }

    /// Forwarded count for one message type.
    pub fn sent_for(&self, msg_type: &str) -> u64 {
        self.inner.read().sent.get(msg_type).copied().unwrap_or(0)
    }

    /// Unhealthy-drop count for one message type.
    pub fn failed_unhealthy_for(&self, msg_type: &str) -> u64 {
        self.inner
            .read()
            .failed_unhealthy
            .get(msg_type)
            .copied()
            .unwrap_or(0)
    }

    /// Returns a point-in-time copy of everything the sink holds.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read();
        MetricsSnapshot {
            sent: inner.sent.clone(),
            failed: inner.failed.clone(),
            failed_unhealthy: inner.failed_unhealthy.clone(),
            failed_send: inner.failed_send.clone(),
            current_ip: inner.current_ip.clone(),
            auth_status: inner.auth_status.clone(),
            session_expires_at: inner.session_expires_at,
            refresh_interval_secs: inner.refresh_interval_secs,
            uptime: self.start_time.elapsed(),
            recent_logs: inner.recent_logs.iter().cloned().collect(),
        }
    }
}

//! Session lifecycle management.
//!
//! A session is the triple `(token, expires_at, refresh_interval)` issued by
//! the router on a successful authentication. The session manager keeps it
//! alive with periodic `SESSION_REFRESH` requests and escalates to cheaper or
//! more expensive recovery depending on how a refresh fails:
//! a protocol rejection with an invalid-token code means the router forgot the
//! session (full re-auth), while a socket error means the path is broken
//! (reconnect and retry on the next tick).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlChannel;
use crate::error::Result;
use crate::liveness::LinkState;
use crate::metrics::Metrics;

/// Seconds since the unix epoch.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session has been requested yet
    None,
    /// An authentication handshake is in flight
    Pending,
    /// The session is live and being refreshed
    Active,
    /// The local TTL elapsed without a successful refresh
    Expired,
    /// The router rejected the token; re-authentication required
    Invalid,
}

/// The current session triple plus its lifecycle status.
///
/// Mutated only by the control channel (on acks) and the session manager
/// (status transitions); read by the heartbeat emitter and metrics surfaces.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Opaque session token from the router
    pub token: String,
    /// Expiry in unix seconds
    pub expires_at: u64,
    /// Router-recommended refresh interval
    pub refresh_interval: Duration,
    /// Lifecycle status
    pub status: SessionStatus,
}

/// Shared handle to the session state.
pub type SharedSession = Arc<RwLock<SessionState>>;

impl SessionState {
    /// An empty, never-authenticated session.
    pub fn new() -> Self {
        Self {
            token: String::new(),
            expires_at: 0,
            refresh_interval: Duration::ZERO,
            status: SessionStatus::None,
        }
    }

    /// Creates a fresh shared handle.
    pub fn new_shared() -> SharedSession {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Replaces the whole triple; entry to `Active` via an AUTH/SESSION ack.
    pub fn install(&mut self, token: String, expires_at: u64, interval_secs: u16) {
        self.token = token;
        self.expires_at = expires_at;
        self.refresh_interval = Duration::from_secs(interval_secs as u64);
        self.status = SessionStatus::Active;
    }

    /// Extends the TTL after a refresh ack. The token and interval are kept.
    pub fn extend(&mut self, expires_at: u64) {
        self.expires_at = expires_at;
        self.status = SessionStatus::Active;
    }

    /// Marks the session unusable after a router-side rejection.
    pub fn invalidate(&mut self) {
        self.status = SessionStatus::Invalid;
    }

    /// True while a token exists and its TTL has not elapsed.
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty() && now_unix() < self.expires_at
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the periodic refresh loop and session recovery.
pub struct SessionManager {
    control: Arc<ControlChannel>,
    session: SharedSession,
    link: Arc<LinkState>,
    metrics: Arc<Metrics>,
    /// Skip a refresh cycle if the local IP changed this recently
    ip_change_threshold: Duration,
    /// Refresh period when the router has not advertised one
    default_interval: Duration,
    /// Serializes recovery so authenticate() is never run concurrently
    recovery: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// Creates a manager around an authenticated control channel.
    pub fn new(
        control: Arc<ControlChannel>,
        session: SharedSession,
        link: Arc<LinkState>,
        metrics: Arc<Metrics>,
        default_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            control,
            session,
            link,
            metrics,
            ip_change_threshold: Duration::from_secs(10),
            default_interval,
            recovery: tokio::sync::Mutex::new(()),
        })
    }

    fn refresh_period(&self) -> Duration {
        let configured = self.session.read().refresh_interval;
        if configured.is_zero() {
            if self.default_interval.is_zero() {
                Duration::from_secs(30)
            } else {
                self.default_interval
            }
        } else {
            configured
        }
    }

    /// Runs the refresh loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "session refresh loop starting (period {:?})",
            self.refresh_period()
        );
        loop {
            let period = self.refresh_period();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("session refresh loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(period) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One refresh cycle.
    async fn tick(&self) {
        // A fresh IP change means the liveness monitor is mid-rebuild; a
        // refresh now would race the old socket.
        if self.link.ip_changed_within(self.ip_change_threshold) {
            info!("skipping session refresh: local IP changed recently");
            return;
        }

        match self.control.refresh_session().await {
            Ok(()) => {
                self.link.set_healthy(true);
                debug!("session refreshed");
            }
            Err(e) if e.is_session_invalid() => {
                warn!("session invalid on router ({}), re-authenticating", e);
                self.session.write().invalidate();
                let _guard = self.recovery.lock().await;
                match self.control.authenticate().await {
                    Ok(()) => {
                        info!("re-authentication successful, session recovered");
                        self.metrics.add_log("INFO", "session recovered via re-auth");
                    }
                    Err(e) => warn!("re-authentication failed: {}", e),
                }
            }
            Err(e) if e.is_network() => {
                // The control channel already closed the socket and notified
                // the liveness monitor; the next tick reconnects and retries.
                warn!("session refresh hit a network error: {}", e);
            }
            Err(e) => {
                warn!("session refresh rejected: {}", e);
            }
        }
    }

    /// Recovers the session with the cheapest correct option.
    ///
    /// Refresh the existing token while it is within TTL; if that fails but
    /// the TCP connection is alive, request a new session on it; otherwise
    /// fall back to a full authentication.
    pub async fn trigger_session_recovery(&self) -> Result<()> {
        let _guard = self.recovery.lock().await;

        let locally_valid = self.session.read().is_valid();
        if locally_valid {
            match self.control.refresh_session().await {
                Ok(()) => {
                    debug!("session recovery: refresh succeeded");
                    return Ok(());
                }
                Err(e) => warn!("session recovery: refresh failed: {}", e),
            }
            if self.control.has_connection().await {
                match self.control.request_session().await {
                    Ok(()) => {
                        info!("session recovery: new session on existing connection");
                        return Ok(());
                    }
                    Err(e) => warn!("session recovery: session request failed: {}", e),
                }
            }
            return self.control.authenticate().await;
        }

        if self.control.has_connection().await {
            match self.control.request_session().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("session recovery: session request failed: {}", e),
            }
        }
        self.control.authenticate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_empty() {
        let s = SessionState::new();
        assert_eq!(s.status, SessionStatus::None);
        assert!(!s.is_valid());
    }

    #[test]
    fn test_install_replaces_whole_triple() {
        let mut s = SessionState::new();
        s.install("token-a".to_string(), now_unix() + 3600, 30);
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.is_valid());
        assert_eq!(s.refresh_interval, Duration::from_secs(30));

        s.install("token-b".to_string(), now_unix() + 7200, 60);
        assert_eq!(s.token, "token-b");
        assert_eq!(s.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_extend_keeps_token_and_interval() {
        let mut s = SessionState::new();
        let t0 = now_unix();
        s.install("token-a".to_string(), t0 + 3600, 30);
        s.extend(t0 + 7200);
        assert_eq!(s.token, "token-a");
        assert_eq!(s.expires_at, t0 + 7200);
        assert_eq!(s.refresh_interval, Duration::from_secs(30));
        assert_eq!(s.status, SessionStatus::Active);
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let mut s = SessionState::new();
        s.install("token-a".to_string(), now_unix().saturating_sub(10), 30);
        assert!(!s.is_valid());
    }

    #[test]
    fn test_invalidate() {
        let mut s = SessionState::new();
        s.install("token-a".to_string(), now_unix() + 3600, 30);
        s.invalidate();
        assert_eq!(s.status, SessionStatus::Invalid);
        // The token still exists and is within TTL; only the status changed.
        assert!(s.is_valid());
    }

    #[test]
    fn test_auth_ack_invariant() {
        // For every successful install: now < expires_at and
        // 0 < interval <= expires_at - now.
        let mut s = SessionState::new();
        let now = now_unix();
        s.install("t".to_string(), now + 3600, 30);
        assert!(now < s.expires_at);
        assert!(s.refresh_interval.as_secs() > 0);
        assert!(s.refresh_interval.as_secs() <= s.expires_at - now);
    }
}

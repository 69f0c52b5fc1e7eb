//! Control channel to the fleet router.
//!
//! One long-lived TCP connection carries registration, authentication,
//! session refresh and command traffic. Requests are strictly serialized: a
//! caller takes the connection lock, writes its request and reads the reply
//! inside the lock, so request/reply pairs are always contiguous on the wire
//! and at most one request is outstanding at any time.
//!
//! Failure classification:
//! * socket error / read deadline -> the connection is closed, the liveness
//!   monitor is notified, and the error is `network`;
//! * a refresh rejected with `session expired` / `invalid token` -> the
//!   connection stays open and the error is `session-invalid`;
//! * any other protocol rejection -> `command-failure`, surfaced to the caller.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::crypto;
use crate::error::{BridgeError, Result};
use crate::liveness::LinkState;
use crate::metrics::Metrics;
use crate::protocol::{
    self, AuthAck, AuthChallenge, AuthInit, AuthResponse, CodecError, RegisterAck,
    RegisterChallenge, RegisterInit, RegisterResponse, SessionAck, SessionRefresh,
    SessionRefreshAck, SessionRequest,
};
use crate::secret_store::SecretStore;
use crate::session::{now_unix, SessionStatus, SharedSession};

/// Deadline for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read deadline for handshake replies (register/auth).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Read deadline for session refresh replies.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
/// TCP keepalive idle time and probe interval.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Client side of the custom control protocol.
pub struct ControlChannel {
    host: String,
    port: u16,
    drone_uuid: String,
    shared_secret: String,
    store: SecretStore,
    /// In-memory cache of the per-drone secret key
    secret: RwLock<Option<String>>,
    /// The single TCP connection; the lock serializes request/reply pairs
    conn: tokio::sync::Mutex<Option<TcpStream>>,
    session: SharedSession,
    link: Arc<LinkState>,
    metrics: Arc<Metrics>,
}

/// Writes a request and accumulates the reply until `decode` succeeds.
///
/// Control messages carry no outer framing, so a reply fragmented by TCP is
/// recognized by decoding: `Truncated` means more bytes are needed, anything
/// else is final.
async fn send_recv<T>(
    stream: &mut TcpStream,
    packet: &[u8],
    deadline: Duration,
    what: &'static str,
    decode: impl Fn(&[u8]) -> std::result::Result<T, CodecError>,
) -> Result<T> {
    stream
        .write_all(packet)
        .await
        .map_err(|e| BridgeError::network(what, e))?;

    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = timeout(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| BridgeError::timeout(what))?
            .map_err(|e| BridgeError::network(what, e))?;
        if n == 0 {
            return Err(BridgeError::network(
                what,
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by router"),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        match decode(&buf) {
            Ok(v) => return Ok(v),
            Err(CodecError::Truncated(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

impl ControlChannel {
    /// Creates a channel; no connection is opened until the first operation.
    pub fn new(
        auth: &AuthConfig,
        store: SecretStore,
        session: SharedSession,
        link: Arc<LinkState>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: auth.host.clone(),
            port: auth.port,
            drone_uuid: auth.uuid.clone(),
            shared_secret: auth.shared_secret.clone(),
            store,
            secret: RwLock::new(None),
            conn: tokio::sync::Mutex::new(None),
            session,
            link,
            metrics,
        })
    }

    /// The drone UUID this channel authenticates as.
    pub fn drone_uuid(&self) -> &str {
        &self.drone_uuid
    }

    /// True while a TCP connection is held.
    pub async fn has_connection(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// True while the session token exists and is within TTL.
    pub fn is_authenticated(&self) -> bool {
        self.session.read().is_valid()
    }

    /// Closes the connection; the next operation dials a fresh 5-tuple.
    pub async fn force_reconnect(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            info!("control channel: connection closed for reconnect");
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!("control channel: connecting to {}", addr);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| BridgeError::timeout("connect"))?
            .map_err(|e| BridgeError::network(format!("connect to {}", addr), e))?;

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_PERIOD)
            .with_interval(KEEPALIVE_PERIOD);
        SockRef::from(&stream)
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| BridgeError::network("set keepalive", e))?;

        if let Ok(local) = stream.local_addr() {
            debug!("control channel: connected from {}", local);
        }
        Ok(stream)
    }

    /// Drops the connection after a socket failure and wakes the liveness
    /// monitor.
    fn on_network_failure(&self, guard: &mut Option<TcpStream>) {
        *guard = None;
        self.link.note_network_error();
    }

    pub(crate) fn cached_secret(&self) -> Option<String> {
        self.secret.read().clone()
    }

    fn ensure_secret(&self) -> Result<String> {
        if let Some(secret) = self.cached_secret() {
            return Ok(secret);
        }
        let record = self.store.load()?;
        if record.drone_uuid != self.drone_uuid {
            warn!(
                "secret file UUID ({}) does not match configured UUID ({})",
                record.drone_uuid, self.drone_uuid
            );
        }
        info!("loaded secret key from storage");
        *self.secret.write() = Some(record.secret_key.clone());
        Ok(record.secret_key)
    }

    /// One-time registration with the fleet.
    ///
    /// Runs `REGISTER_INIT -> REGISTER_CHALLENGE -> REGISTER_RESPONSE ->
    /// REGISTER_ACK` signing the challenge with the fleet shared secret,
    /// persists the returned per-drone secret key, and closes the connection
    /// so the subsequent authentication starts on a fresh 5-tuple.
    pub async fn register(&self) -> Result<()> {
        if self.shared_secret.is_empty() {
            return Err(BridgeError::config(
                "shared secret is required for registration",
            ));
        }

        info!("starting registration for drone {}", self.drone_uuid);
        let mut stream = self.dial().await?;

        let init = RegisterInit {
            drone_uuid: self.drone_uuid.clone(),
        };
        let challenge: RegisterChallenge = send_recv(
            &mut stream,
            &init.encode(),
            HANDSHAKE_TIMEOUT,
            "REGISTER_INIT",
            RegisterChallenge::decode,
        )
        .await?;
        debug!(
            "received registration challenge ({} byte nonce, {}s window)",
            challenge.nonce.len(),
            challenge.timeout_sec
        );

        let timestamp = now_unix();
        let response = RegisterResponse {
            drone_uuid: self.drone_uuid.clone(),
            hmac: crypto::compute_hmac(
                &self.shared_secret,
                &self.drone_uuid,
                &challenge.nonce,
                timestamp,
            ),
            timestamp,
        };
        let ack: RegisterAck = send_recv(
            &mut stream,
            &response.encode(),
            HANDSHAKE_TIMEOUT,
            "REGISTER_RESPONSE",
            RegisterAck::decode,
        )
        .await?;

        if ack.result != protocol::RESULT_SUCCESS {
            return Err(BridgeError::Command {
                op: "REGISTER",
                code: ack.error_code,
            });
        }

        self.store.save(&self.drone_uuid, &ack.secret_key)?;
        *self.secret.write() = Some(ack.secret_key);

        // Dropping the stream closes it: the session is obtained by the
        // authentication flow on a fresh connection, never inherited from
        // registration.
        drop(stream);

        info!("registration complete, secret key saved");
        self.metrics.add_log("INFO", "registration successful");
        Ok(())
    }

    /// Authenticates and obtains a session.
    ///
    /// Runs `AUTH_INIT -> AUTH_CHALLENGE -> AUTH_RESPONSE -> AUTH_ACK`
    /// signing with the combined key, reusing the held connection or dialing
    /// a new one. On success the whole session triple is replaced.
    pub async fn authenticate(&self) -> Result<()> {
        let secret = self.ensure_secret()?;
        self.session.write().status = SessionStatus::Pending;

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let stream = guard.as_mut().ok_or_else(|| {
            BridgeError::internal("connection slot empty after dial")
        })?;

        let result = self.authenticate_on(stream, &secret).await;
        if let Err(e) = &result {
            if e.is_network() {
                self.on_network_failure(&mut guard);
            }
        }
        result
    }

    async fn authenticate_on(&self, stream: &mut TcpStream, secret: &str) -> Result<()> {
        let init = AuthInit {
            drone_uuid: self.drone_uuid.clone(),
        };
        let challenge: AuthChallenge = send_recv(
            stream,
            &init.encode(),
            HANDSHAKE_TIMEOUT,
            "AUTH_INIT",
            AuthChallenge::decode,
        )
        .await?;

        let auth_key = if self.shared_secret.is_empty() {
            warn!("no shared secret configured, signing with the raw secret key");
            secret.to_string()
        } else {
            crypto::combined_key(&self.shared_secret, secret)
        };

        let timestamp = now_unix();
        let ip = {
            let current = self.link.current_ip();
            if current.is_empty() {
                "0.0.0.0".to_string()
            } else {
                current
            }
        };
        let response = AuthResponse {
            drone_uuid: self.drone_uuid.clone(),
            hmac: crypto::compute_hmac(&auth_key, &self.drone_uuid, &challenge.nonce, timestamp),
            timestamp,
            ip,
        };
        let ack: AuthAck = send_recv(
            stream,
            &response.encode(),
            HANDSHAKE_TIMEOUT,
            "AUTH_RESPONSE",
            AuthAck::decode,
        )
        .await?;

        if ack.result != protocol::RESULT_SUCCESS {
            if ack.wait_sec > 0 {
                warn!(
                    "authentication rejected (error=0x{:02x}), router asks to wait {}s",
                    ack.error_code, ack.wait_sec
                );
            }
            return Err(BridgeError::Command {
                op: "AUTH",
                code: ack.error_code,
            });
        }
        if ack.session_token.is_empty() {
            return Err(BridgeError::internal(
                "authentication succeeded but no session token received",
            ));
        }

        self.session.write().install(
            ack.session_token.clone(),
            ack.expires_at,
            ack.interval,
        );
        self.metrics.set_auth_status("Authenticated");
        self.metrics
            .set_session_info(ack.expires_at, Duration::from_secs(ack.interval as u64));
        self.metrics
            .add_log("INFO", format!("authenticated as {}", self.drone_uuid));

        info!(
            "authenticated, session active (expires_at={}, interval={}s)",
            ack.expires_at, ack.interval
        );
        Ok(())
    }

    /// Extends the current session's TTL.
    ///
    /// Sends `SESSION_REFRESH` with a short read deadline. Only `expires_at`
    /// changes on success; the token stays the same.
    pub async fn refresh_session(&self) -> Result<()> {
        let token = self.session.read().token.clone();
        if token.is_empty() {
            return Err(BridgeError::SessionInvalid {
                code: protocol::ERR_INVALID_TOKEN,
            });
        }

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            debug!("control channel: reconnecting for session refresh");
            match self.dial().await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    if e.is_network() {
                        self.link.note_network_error();
                    }
                    return Err(e);
                }
            }
        }
        let stream = guard.as_mut().ok_or_else(|| {
            BridgeError::internal("connection slot empty after dial")
        })?;

        let refresh = SessionRefresh {
            session_token: token,
            drone_uuid: self.drone_uuid.clone(),
        };
        let ack: SessionRefreshAck = match send_recv(
            stream,
            &refresh.encode(),
            REFRESH_TIMEOUT,
            "SESSION_REFRESH",
            SessionRefreshAck::decode,
        )
        .await
        {
            Ok(ack) => ack,
            Err(e) => {
                if e.is_network() {
                    self.on_network_failure(&mut guard);
                }
                return Err(e);
            }
        };

        if ack.result != protocol::RESULT_SUCCESS {
            // A rejected refresh means the connection itself is fine; only
            // invalid-token class codes escalate to re-authentication.
            if ack.error_code == protocol::ERR_INVALID_TOKEN
                || ack.error_code == protocol::ERR_SESSION_EXPIRED
            {
                return Err(BridgeError::SessionInvalid {
                    code: ack.error_code,
                });
            }
            return Err(BridgeError::Command {
                op: "SESSION_REFRESH",
                code: ack.error_code,
            });
        }

        {
            let mut session = self.session.write();
            session.extend(ack.expires_at);
            self.metrics
                .set_session_info(ack.expires_at, session.refresh_interval);
        }
        debug!("session extended (expires_at={})", ack.expires_at);
        Ok(())
    }

    /// Requests a session on the live connection (`SESSION_NEW`), offering
    /// the previous token for reuse. Used by the recovery path; does not dial.
    pub async fn request_session(&self) -> Result<()> {
        let old_token = self.session.read().token.clone();

        let mut guard = self.conn.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            BridgeError::network(
                "SESSION_NEW",
                io::Error::new(io::ErrorKind::NotConnected, "no control connection"),
            )
        })?;

        let request = SessionRequest {
            drone_uuid: self.drone_uuid.clone(),
            old_session_token: old_token,
        };
        let ack: SessionAck = match send_recv(
            stream,
            &request.encode(),
            HANDSHAKE_TIMEOUT,
            "SESSION_NEW",
            SessionAck::decode,
        )
        .await
        {
            Ok(ack) => ack,
            Err(e) => {
                if e.is_network() {
                    self.on_network_failure(&mut guard);
                }
                return Err(e);
            }
        };

        if ack.result != protocol::RESULT_SUCCESS {
            return Err(BridgeError::Command {
                op: "SESSION_NEW",
                code: ack.error_code,
            });
        }

        self.session
            .write()
            .install(ack.token, ack.expires_at, ack.interval);
        self.metrics
            .set_session_info(ack.expires_at, Duration::from_secs(ack.interval as u64));
        info!(
            "session issued (expires_at={}, interval={}s)",
            ack.expires_at, ack.interval
        );
        Ok(())
    }

    /// Current session token for request building in API-key operations.
    pub(crate) fn session_token(&self) -> Option<String> {
        let session = self.session.read();
        if session.token.is_empty() {
            None
        } else {
            Some(session.token.clone())
        }
    }

    /// Runs one request/reply with the standard lock-reconnect-classify
    /// discipline. Shared by the API-key operations.
    pub(crate) async fn command<T>(
        &self,
        packet: Vec<u8>,
        deadline: Duration,
        what: &'static str,
        decode: impl Fn(&[u8]) -> std::result::Result<T, CodecError>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            debug!("control channel: reconnecting for {}", what);
            *guard = Some(self.dial().await?);
        }
        let stream = guard.as_mut().ok_or_else(|| {
            BridgeError::internal("connection slot empty after dial")
        })?;

        match send_recv(stream, &packet, deadline, what, decode).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_network() {
                    self.on_network_failure(&mut guard);
                }
                Err(e)
            }
        }
    }
}

//! End-to-end control-channel tests against an in-process router.
//!
//! The fake router speaks the real wire protocol over a real TCP socket:
//! registration and authentication handshakes with HMAC verification, session
//! refresh with configurable outcomes, and API-key replies (including the
//! legacy length-prefixed variant).

#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use dronebridge_rs::config::AuthConfig;
use dronebridge_rs::control::ControlChannel;
use dronebridge_rs::crypto;
use dronebridge_rs::liveness::LinkState;
use dronebridge_rs::metrics::Metrics;
use dronebridge_rs::protocol::*;
use dronebridge_rs::secret_store::SecretStore;
use dronebridge_rs::session::{
    now_unix, SessionManager, SessionState, SessionStatus, SharedSession,
};

const UUID: &str = "00000001-0000-0000-0000-000000000001";
const SHARED_SECRET: &str = "SHARED-XYZ";
const SECRET_KEY: &str = "per-drone-secret-key-0123456789ab";
const NONCE: [u8; 16] = [0x42; 16];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefreshBehavior {
    ExtendTo(u64),
    Reject(u8),
}

struct FakeRouter {
    accepted: AtomicUsize,
    refresh_count: AtomicUsize,
    refresh_behavior: Mutex<RefreshBehavior>,
    legacy_api_key_frame: AtomicUsize, // nonzero -> emit length-prefixed form
    token_counter: AtomicUsize,
}

impl FakeRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            accepted: AtomicUsize::new(0),
            refresh_count: AtomicUsize::new(0),
            refresh_behavior: Mutex::new(RefreshBehavior::ExtendTo(0)),
            legacy_api_key_frame: AtomicUsize::new(0),
            token_counter: AtomicUsize::new(0),
        })
    }

    fn issue_token(&self) -> String {
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
        // 64 hex characters of binary token material plus a readable suffix.
        format!("{:064x}-session-{}", n, n)
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            self.accepted.fetch_add(1, Ordering::SeqCst);
            let router = self.clone();
            tokio::spawn(router.handle_conn(stream));
        }
    }

    async fn handle_conn(self: Arc<Self>, mut stream: TcpStream) {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok(n) = stream.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            let data = &buf[..n];
            let reply = match data[0] {
                MSG_REGISTER_INIT => {
                    let init = RegisterInit::decode(data).expect("REGISTER_INIT");
                    assert_eq!(init.drone_uuid, UUID);
                    RegisterChallenge {
                        nonce: NONCE.to_vec(),
                        timeout_sec: 30,
                    }
                    .encode()
                }
                MSG_REGISTER_RESPONSE => {
                    let resp = RegisterResponse::decode(data).expect("REGISTER_RESPONSE");
                    let ok = crypto::verify_hmac(
                        SHARED_SECRET,
                        &resp.drone_uuid,
                        &NONCE,
                        resp.timestamp,
                        &resp.hmac,
                    );
                    if ok {
                        RegisterAck {
                            result: RESULT_SUCCESS,
                            secret_key: SECRET_KEY.to_string(),
                            ..Default::default()
                        }
                        .encode()
                    } else {
                        RegisterAck {
                            result: RESULT_FAILURE,
                            error_code: ERR_INVALID_HMAC,
                            ..Default::default()
                        }
                        .encode()
                    }
                }
                MSG_AUTH_INIT => {
                    let init = AuthInit::decode(data).expect("AUTH_INIT");
                    assert_eq!(init.drone_uuid, UUID);
                    AuthChallenge {
                        nonce: NONCE.to_vec(),
                        timeout_sec: 30,
                    }
                    .encode()
                }
                MSG_AUTH_RESPONSE => {
                    let resp = AuthResponse::decode(data).expect("AUTH_RESPONSE");
                    let key = crypto::combined_key(SHARED_SECRET, SECRET_KEY);
                    let ok = crypto::verify_hmac(
                        &key,
                        &resp.drone_uuid,
                        &NONCE,
                        resp.timestamp,
                        &resp.hmac,
                    );
                    if ok {
                        AuthAck {
                            result: RESULT_SUCCESS,
                            session_token: self.issue_token(),
                            expires_at: now_unix() + 3600,
                            interval: 30,
                            ..Default::default()
                        }
                        .encode()
                    } else {
                        AuthAck {
                            result: RESULT_FAILURE,
                            error_code: ERR_INVALID_HMAC,
                            ..Default::default()
                        }
                        .encode()
                    }
                }
                MSG_SESSION_REFRESH => {
                    SessionRefresh::decode(data).expect("SESSION_REFRESH");
                    self.refresh_count.fetch_add(1, Ordering::SeqCst);
                    // Hold the reply briefly so overlapping client requests
                    // would interleave on the wire if they were allowed to.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    match *self.refresh_behavior.lock() {
                        RefreshBehavior::ExtendTo(expires_at) => SessionRefreshAck {
                            result: RESULT_SUCCESS,
                            expires_at: if expires_at == 0 {
                                now_unix() + 3600
                            } else {
                                expires_at
                            },
                            interval: 30,
                            ..Default::default()
                        }
                        .encode(),
                        RefreshBehavior::Reject(code) => SessionRefreshAck {
                            result: RESULT_FAILURE,
                            error_code: code,
                            ..Default::default()
                        }
                        .encode(),
                    }
                }
                MSG_SESSION_NEW => {
                    SessionRequest::decode(data).expect("SESSION_NEW");
                    SessionAck {
                        result: RESULT_SUCCESS,
                        token: self.issue_token(),
                        expires_at: now_unix() + 3600,
                        interval: 30,
                        ..Default::default()
                    }
                    .encode()
                }
                MSG_API_KEY_REQUEST => {
                    let req = ApiKeyRequest::decode(data).expect("API_KEY_REQUEST");
                    assert!(req.expiration_hours >= 1 && req.expiration_hours <= 720);
                    let canonical = ApiKeyResponse {
                        result: RESULT_SUCCESS,
                        error_code: 0,
                        api_key: "ak_generated".to_string(),
                        expires_at: now_unix() + 86_400,
                    }
                    .encode();
                    if self.legacy_api_key_frame.load(Ordering::SeqCst) != 0 {
                        let mut framed =
                            Vec::from((canonical.len() as u16).to_le_bytes());
                        framed.extend_from_slice(&canonical);
                        framed
                    } else {
                        canonical
                    }
                }
                other => panic!("fake router: unexpected message type 0x{:02x}", other),
            };
            stream.write_all(&reply).await.expect("router write");
        }
    }
}

struct Harness {
    router: Arc<FakeRouter>,
    control: Arc<ControlChannel>,
    session: SharedSession,
    store: SecretStore,
    _dir: TempDir,
}

async fn start_harness() -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind router");
    let port = listener.local_addr().expect("addr").port();

    let router = FakeRouter::new();
    tokio::spawn(router.clone().serve(listener));

    let dir = TempDir::new().expect("tempdir");
    let store = SecretStore::at(dir.path().join(".drone_secret"));

    let auth = AuthConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port,
        uuid: UUID.to_string(),
        shared_secret: SHARED_SECRET.to_string(),
        keepalive_interval: 30,
        session_heartbeat_frequency: 1.0,
    };
    let session = SessionState::new_shared();
    let control = ControlChannel::new(
        &auth,
        store.clone(),
        session.clone(),
        LinkState::new(),
        Metrics::new(),
    );

    Harness {
        router,
        control,
        session,
        store,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_fresh_register_then_authenticate() {
    let h = start_harness().await;

    // Registration persists the secret and closes its connection.
    h.control.register().await.expect("register");
    let record = h.store.load().expect("load secret");
    assert_eq!(record.drone_uuid, UUID);
    assert_eq!(record.secret_key, SECRET_KEY);
    assert!(!h.control.has_connection().await);

    // Authentication starts a fresh 5-tuple and yields a session.
    h.control.authenticate().await.expect("authenticate");
    assert!(h.control.is_authenticated());

    let session = h.session.read().clone();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(!session.token.is_empty());
    assert!(session.expires_at >= now_unix() + 30);
    assert_eq!(session.refresh_interval, Duration::from_secs(30));

    // register dialed once, authenticate dialed once more.
    assert_eq!(h.router.accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_session_refresh_extends_ttl() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");

    let before = h.session.read().clone();
    let new_expiry = before.expires_at + 3600;
    *h.router.refresh_behavior.lock() = RefreshBehavior::ExtendTo(new_expiry);

    h.control.refresh_session().await.expect("refresh");

    let after = h.session.read().clone();
    assert_eq!(after.token, before.token, "refresh must not change the token");
    assert_eq!(after.expires_at, new_expiry);
    assert_eq!(after.refresh_interval, before.refresh_interval);
}

#[tokio::test]
async fn test_invalid_token_refresh_triggers_reauth_without_closing_socket() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");
    let accepted_after_auth = h.router.accepted.load(Ordering::SeqCst);
    let old_token = h.session.read().token.clone();

    *h.router.refresh_behavior.lock() = RefreshBehavior::Reject(ERR_INVALID_TOKEN);
    let err = h.control.refresh_session().await.expect_err("must reject");
    assert!(err.is_session_invalid());

    // The connection survived the protocol failure...
    assert!(h.control.has_connection().await);

    // ...and re-authentication on it yields a new token.
    h.control.authenticate().await.expect("re-authenticate");
    let new_token = h.session.read().token.clone();
    assert_ne!(new_token, old_token);
    assert_eq!(
        h.router.accepted.load(Ordering::SeqCst),
        accepted_after_auth,
        "no new TCP connection may be opened for a protocol failure"
    );
}

#[tokio::test]
async fn test_expired_session_code_also_classified_invalid() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");

    *h.router.refresh_behavior.lock() = RefreshBehavior::Reject(ERR_SESSION_EXPIRED);
    let err = h.control.refresh_session().await.expect_err("must reject");
    assert!(err.is_session_invalid());
}

#[tokio::test]
async fn test_concurrent_refreshes_are_serialized() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let control = h.control.clone();
        tasks.push(tokio::spawn(async move { control.refresh_session().await }));
    }
    for task in tasks {
        task.await.expect("join").expect("refresh");
    }

    // Every request produced a well-formed reply on one connection; an
    // interleaved write would have corrupted the stream.
    assert_eq!(h.router.refresh_count.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_session_recovery_prefers_refresh() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");
    let token = h.session.read().token.clone();

    let manager = SessionManager::new(
        h.control.clone(),
        h.session.clone(),
        LinkState::new(),
        Metrics::new(),
        Duration::from_secs(30),
    );
    manager
        .trigger_session_recovery()
        .await
        .expect("recovery via refresh");
    assert_eq!(h.session.read().token, token, "refresh keeps the token");
}

#[tokio::test]
async fn test_session_recovery_falls_back_to_session_new() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");
    let token = h.session.read().token.clone();

    // Refresh is rejected with a non-token code (command failure), so
    // recovery requests a fresh session on the live connection.
    *h.router.refresh_behavior.lock() = RefreshBehavior::Reject(ERR_INTERNAL_ERROR);

    let manager = SessionManager::new(
        h.control.clone(),
        h.session.clone(),
        LinkState::new(),
        Metrics::new(),
        Duration::from_secs(30),
    );
    manager
        .trigger_session_recovery()
        .await
        .expect("recovery via SESSION_NEW");
    assert_ne!(h.session.read().token, token);
}

#[tokio::test]
async fn test_api_key_request_and_legacy_framing() {
    let h = start_harness().await;
    h.control.register().await.expect("register");
    h.control.authenticate().await.expect("authenticate");

    let response = h.control.request_api_key(24).await.expect("api key");
    assert_eq!(response.api_key, "ak_generated");

    // The legacy length-prefixed reply decodes identically.
    h.router.legacy_api_key_frame.store(1, Ordering::SeqCst);
    let legacy = h.control.request_api_key(9999).await.expect("legacy reply");
    assert_eq!(legacy.api_key, "ak_generated");
}

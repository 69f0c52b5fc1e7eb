//! Binary control-protocol codec.
//!
//! Every control message exchanged with the fleet router over TCP is a single
//! byte string starting with a one-byte message type. Multi-byte integers are
//! little-endian; strings and variable blobs carry a `u16` length prefix.
//! Messages have no outer framing, so a receiver accumulates bytes and retries
//! decoding until a whole message is present (`CodecError::Truncated` means
//! "need more data", any other error is a hard reject).

use bytes::BufMut;
use thiserror::Error;

// Message types

/// Drone → Router: send UUID only (request challenge)
pub const MSG_AUTH_INIT: u8 = 0x01;
/// Router → Drone: send nonce
pub const MSG_AUTH_CHALLENGE: u8 = 0x02;
/// Drone → Router: UUID + HMAC after solving the challenge
pub const MSG_AUTH_RESPONSE: u8 = 0x03;
/// Router → Drone: auth result, carries the session on success
pub const MSG_AUTH_ACK: u8 = 0x04;

/// Drone → Router: request new/existing session
pub const MSG_SESSION_NEW: u8 = 0x10;
/// Router → Drone: session token + expiry
pub const MSG_SESSION_ACK: u8 = 0x11;
/// Drone → Router: refresh existing session
pub const MSG_SESSION_REFRESH: u8 = 0x12;
/// Router → Drone: refresh result
pub const MSG_SESSION_REFRESH_ACK: u8 = 0x13;

/// Drone → Router: request new API key
pub const MSG_API_KEY_REQUEST: u8 = 0x20;
/// Router → Drone: API key response
pub const MSG_API_KEY_RESPONSE: u8 = 0x21;
/// Drone → Router: revoke API key
pub const MSG_API_KEY_REVOKE: u8 = 0x22;
/// Router → Drone: revoke acknowledgement
pub const MSG_API_KEY_REVOKE_ACK: u8 = 0x23;
/// Drone → Router: get current API key status
pub const MSG_API_KEY_STATUS: u8 = 0x24;
/// Router → Drone: current API key status
pub const MSG_API_KEY_STATUS_RESP: u8 = 0x25;
/// Drone → Router: delete API key completely
pub const MSG_API_KEY_DELETE: u8 = 0x26;
/// Router → Drone: delete acknowledgement
pub const MSG_API_KEY_DELETE_ACK: u8 = 0x27;

/// Drone → Router: start registration (UUID only)
pub const MSG_REGISTER_INIT: u8 = 0xA0;
/// Router → Drone: registration nonce
pub const MSG_REGISTER_CHALLENGE: u8 = 0xA1;
/// Drone → Router: UUID + HMAC with the fleet shared secret
pub const MSG_REGISTER_RESPONSE: u8 = 0xA2;
/// Router → Drone: registration result, carries the per-drone secret
pub const MSG_REGISTER_ACK: u8 = 0xA3;

// Result codes

/// Operation succeeded
pub const RESULT_SUCCESS: u8 = 0x00;
/// Operation failed; an error code follows
pub const RESULT_FAILURE: u8 = 0x01;

// Error codes

/// HMAC verification failed on the router
pub const ERR_INVALID_HMAC: u8 = 0x00;
/// Timestamp outside the router's skew window (resync clock)
pub const ERR_TIMESTAMP_OUT_OF_RANGE: u8 = 0x01;
/// UUID unknown to the router
pub const ERR_UNKNOWN_DRONE_ID: u8 = 0x02;
/// Too many attempts; wait before retrying
pub const ERR_RATE_LIMITED: u8 = 0x03;
/// Router-side failure
pub const ERR_INTERNAL_ERROR: u8 = 0x05;
/// Session exists but its TTL has elapsed
pub const ERR_SESSION_EXPIRED: u8 = 0x06;
/// Session not found or token invalid
pub const ERR_INVALID_TOKEN: u8 = 0x07;
/// Operation requires an authenticated session
pub const ERR_NOT_AUTHENTICATED: u8 = 0x10;

/// Wire-level decode failure.
///
/// `Truncated` is recoverable on a stream (read more bytes and retry);
/// `UnexpectedType` is a hard protocol violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the named field was complete.
    #[error("packet too short for {0}")]
    Truncated(&'static str),

    /// The type byte does not match the message being decoded.
    #[error("invalid message type: 0x{got:02x} (expected 0x{expected:02x})")]
    UnexpectedType {
        /// Expected type byte
        expected: u8,
        /// Received type byte
        got: u8,
    },

    /// A MAVLink frame carried a different message id than expected.
    #[error("invalid message id: {got} (expected {expected})")]
    UnexpectedMessageId {
        /// Expected MAVLink message id
        expected: u32,
        /// Received MAVLink message id
        got: u32,
    },

    /// A MAVLink frame failed its checksum.
    #[error("crc mismatch")]
    CrcMismatch,
}

type CodecResult<T> = std::result::Result<T, CodecError>;

/// Bounds-checked little-endian reader over a received byte string.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self, what: &'static str) -> CodecResult<u8> {
        if self.remaining() < 1 {
            return Err(CodecError::Truncated(what));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16_le(&mut self, what: &'static str) -> CodecResult<u16> {
        if self.remaining() < 2 {
            return Err(CodecError::Truncated(what));
        }
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u64_le(&mut self, what: &'static str) -> CodecResult<u64> {
        if self.remaining() < 8 {
            return Err(CodecError::Truncated(what));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(buf))
    }

    /// Length-prefixed blob: `[len:u16 LE][bytes:len]`.
    fn blob(&mut self, what: &'static str) -> CodecResult<Vec<u8>> {
        let len = self.u16_le(what)? as usize;
        if self.remaining() < len {
            return Err(CodecError::Truncated(what));
        }
        let v = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    /// Length-prefixed UTF-8 string; invalid bytes are replaced.
    fn string(&mut self, what: &'static str) -> CodecResult<String> {
        let bytes = self.blob(what)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn expect_type(&mut self, expected: u8) -> CodecResult<()> {
        let got = self.u8("message type")?;
        if got != expected {
            return Err(CodecError::UnexpectedType { expected, got });
        }
        Ok(())
    }
}

fn put_blob(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u16_le(data.len() as u16);
    out.put_slice(data);
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_blob(out, s.as_bytes());
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// AUTH_INIT: `[type:1][uuid_len:2][uuid:var]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInit {
    /// Drone UUID string
    pub drone_uuid: String,
}

impl AuthInit {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.drone_uuid.len());
        out.put_u8(MSG_AUTH_INIT);
        put_string(&mut out, &self.drone_uuid);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_AUTH_INIT)?;
        Ok(Self {
            drone_uuid: r.string("uuid")?,
        })
    }
}

/// AUTH_CHALLENGE: `[type:1][nonce_len:2][nonce:var][timeout_sec:2]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Router-generated nonce to sign
    pub nonce: Vec<u8>,
    /// Seconds the drone has to answer
    pub timeout_sec: u16,
}

impl AuthChallenge {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.nonce.len());
        out.put_u8(MSG_AUTH_CHALLENGE);
        put_blob(&mut out, &self.nonce);
        out.put_u16_le(self.timeout_sec);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_AUTH_CHALLENGE)?;
        let nonce = r.blob("nonce")?;
        let timeout_sec = r.u16_le("timeout")?;
        Ok(Self { nonce, timeout_sec })
    }
}

/// AUTH_RESPONSE:
/// `[type:1][uuid_len:2][uuid][hmac_len:2][hmac:32][timestamp:8][ip_len:2][ip]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Drone UUID string
    pub drone_uuid: String,
    /// HMAC-SHA256 signature over the canonical challenge string
    pub hmac: Vec<u8>,
    /// Unix timestamp used in the signature
    pub timestamp: u64,
    /// Current local IP (informational)
    pub ip: String,
}

impl AuthResponse {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(1 + 2 + self.drone_uuid.len() + 2 + self.hmac.len() + 8 + 2 + self.ip.len());
        out.put_u8(MSG_AUTH_RESPONSE);
        put_string(&mut out, &self.drone_uuid);
        put_blob(&mut out, &self.hmac);
        out.put_u64_le(self.timestamp);
        put_string(&mut out, &self.ip);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_AUTH_RESPONSE)?;
        let drone_uuid = r.string("uuid")?;
        let hmac = r.blob("hmac")?;
        let timestamp = r.u64_le("timestamp")?;
        let ip = r.string("ip")?;
        Ok(Self {
            drone_uuid,
            hmac,
            timestamp,
            ip,
        })
    }
}

/// AUTH_ACK.
///
/// Success: `[type:1][result:1][token_len:2][token][expires_at:8][interval:2]`
/// Failure: `[type:1][result:1][error_code:1][wait_sec:2?]` — `wait_sec` is a
/// rate-limit hint some router versions omit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthAck {
    /// `RESULT_SUCCESS` or `RESULT_FAILURE`
    pub result: u8,
    /// Error code when `result == RESULT_FAILURE`
    pub error_code: u8,
    /// Optional retry hint on rate-limited failures
    pub wait_sec: u16,
    /// Session token on success
    pub session_token: String,
    /// Session expiry (unix seconds) on success
    pub expires_at: u64,
    /// Router-recommended refresh interval (seconds) on success
    pub interval: u16,
}

impl AuthAck {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_AUTH_ACK);
        out.put_u8(self.result);
        if self.result == RESULT_SUCCESS {
            put_string(&mut out, &self.session_token);
            out.put_u64_le(self.expires_at);
            out.put_u16_le(self.interval);
        } else {
            out.put_u8(self.error_code);
            out.put_u16_le(self.wait_sec);
        }
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_AUTH_ACK)?;
        let result = r.u8("result")?;
        let mut ack = Self {
            result,
            ..Default::default()
        };
        if result != RESULT_SUCCESS {
            // Trailing fields of the failure form are optional.
            if let Ok(code) = r.u8("error code") {
                ack.error_code = code;
            }
            if let Ok(wait) = r.u16_le("wait_sec") {
                ack.wait_sec = wait;
            }
        } else {
            ack.session_token = r.string("session token")?;
            ack.expires_at = r.u64_le("expires_at")?;
            ack.interval = r.u16_le("interval")?;
        }
        Ok(ack)
    }
}

// ---------------------------------------------------------------------------
// Session management
// ---------------------------------------------------------------------------

/// SESSION_NEW: `[type:1][uuid_len:2][uuid][old_token_len:2][old_token]`
///
/// The previous token is carried so the router may re-issue a still-valid
/// session instead of creating a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Drone UUID string
    pub drone_uuid: String,
    /// Previous session token, empty if none
    pub old_session_token: String,
}

impl SessionRequest {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_SESSION_NEW);
        put_string(&mut out, &self.drone_uuid);
        put_string(&mut out, &self.old_session_token);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_SESSION_NEW)?;
        let drone_uuid = r.string("uuid")?;
        let old_session_token = r.string("old token")?;
        Ok(Self {
            drone_uuid,
            old_session_token,
        })
    }
}

/// SESSION_ACK.
///
/// Success: `[type:1][result:1][token_len:2][token][expires_at:8][interval:2]`
/// Failure: `[type:1][result:1][error_code:1]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionAck {
    /// `RESULT_SUCCESS` or `RESULT_FAILURE`
    pub result: u8,
    /// Error code when `result == RESULT_FAILURE`
    pub error_code: u8,
    /// Session token on success
    pub token: String,
    /// Session expiry (unix seconds) on success
    pub expires_at: u64,
    /// Refresh interval (seconds) on success
    pub interval: u16,
}

impl SessionAck {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_SESSION_ACK);
        out.put_u8(self.result);
        if self.result == RESULT_SUCCESS {
            put_string(&mut out, &self.token);
            out.put_u64_le(self.expires_at);
            out.put_u16_le(self.interval);
        } else {
            out.put_u8(self.error_code);
        }
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_SESSION_ACK)?;
        let result = r.u8("result")?;
        let mut ack = Self {
            result,
            ..Default::default()
        };
        if result != RESULT_SUCCESS {
            if let Ok(code) = r.u8("error code") {
                ack.error_code = code;
            }
            return Ok(ack);
        }
        ack.token = r.string("token")?;
        ack.expires_at = r.u64_le("expires_at")?;
        ack.interval = r.u16_le("interval")?;
        Ok(ack)
    }
}

/// SESSION_REFRESH: `[type:1][token_len:2][token][uuid_len:2][uuid]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRefresh {
    /// Current session token
    pub session_token: String,
    /// Drone UUID string
    pub drone_uuid: String,
}

impl SessionRefresh {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_SESSION_REFRESH);
        put_string(&mut out, &self.session_token);
        put_string(&mut out, &self.drone_uuid);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_SESSION_REFRESH)?;
        let session_token = r.string("token")?;
        let drone_uuid = r.string("uuid")?;
        Ok(Self {
            session_token,
            drone_uuid,
        })
    }
}

/// SESSION_REFRESH_ACK.
///
/// Success: `[type:1][result:1][expires_at:8][interval:2]`
/// Failure: `[type:1][result:1][error_code:1]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionRefreshAck {
    /// `RESULT_SUCCESS` or `RESULT_FAILURE`
    pub result: u8,
    /// Error code when `result == RESULT_FAILURE`
    pub error_code: u8,
    /// New expiry (unix seconds) on success
    pub expires_at: u64,
    /// Refresh interval (seconds) on success
    pub interval: u16,
}

impl SessionRefreshAck {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_SESSION_REFRESH_ACK);
        out.put_u8(self.result);
        if self.result == RESULT_SUCCESS {
            out.put_u64_le(self.expires_at);
            out.put_u16_le(self.interval);
        } else {
            out.put_u8(self.error_code);
        }
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_SESSION_REFRESH_ACK)?;
        let result = r.u8("result")?;
        let mut ack = Self {
            result,
            ..Default::default()
        };
        if result != RESULT_SUCCESS {
            if let Ok(code) = r.u8("error code") {
                ack.error_code = code;
            }
            return Ok(ack);
        }
        ack.expires_at = r.u64_le("expires_at")?;
        ack.interval = r.u16_le("interval")?;
        Ok(ack)
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// REGISTER_INIT: `[type:1][uuid_len:2][uuid]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInit {
    /// Drone UUID string
    pub drone_uuid: String,
}

impl RegisterInit {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.drone_uuid.len());
        out.put_u8(MSG_REGISTER_INIT);
        put_string(&mut out, &self.drone_uuid);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_REGISTER_INIT)?;
        Ok(Self {
            drone_uuid: r.string("uuid")?,
        })
    }
}

/// REGISTER_CHALLENGE: `[type:1][nonce_len:2][nonce][timeout_sec:2]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterChallenge {
    /// Router-generated nonce to sign with the shared secret
    pub nonce: Vec<u8>,
    /// Seconds the drone has to answer
    pub timeout_sec: u16,
}

impl RegisterChallenge {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.nonce.len());
        out.put_u8(MSG_REGISTER_CHALLENGE);
        put_blob(&mut out, &self.nonce);
        out.put_u16_le(self.timeout_sec);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_REGISTER_CHALLENGE)?;
        let nonce = r.blob("nonce")?;
        let timeout_sec = r.u16_le("timeout")?;
        Ok(Self { nonce, timeout_sec })
    }
}

/// REGISTER_RESPONSE: `[type:1][uuid_len:2][uuid][hmac_len:2][hmac:32][timestamp:8]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    /// Drone UUID string
    pub drone_uuid: String,
    /// HMAC-SHA256 with the fleet shared secret
    pub hmac: Vec<u8>,
    /// Unix timestamp used in the signature
    pub timestamp: u64,
}

impl RegisterResponse {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_REGISTER_RESPONSE);
        put_string(&mut out, &self.drone_uuid);
        put_blob(&mut out, &self.hmac);
        out.put_u64_le(self.timestamp);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_REGISTER_RESPONSE)?;
        let drone_uuid = r.string("uuid")?;
        let hmac = r.blob("hmac")?;
        let timestamp = r.u64_le("timestamp")?;
        Ok(Self {
            drone_uuid,
            hmac,
            timestamp,
        })
    }
}

/// REGISTER_ACK.
///
/// Success: `[type:1][result:1][secret_key_len:2][secret_key]
/// [token_len:2][token][expires_at:8][interval:2]`
/// Failure: `[type:1][result:1][error_code:1]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterAck {
    /// `RESULT_SUCCESS` or `RESULT_FAILURE`
    pub result: u8,
    /// Error code when `result == RESULT_FAILURE`
    pub error_code: u8,
    /// Newly provisioned per-drone secret key on success
    pub secret_key: String,
    /// Session token on success (may be empty; the session is normally
    /// obtained by the subsequent authentication)
    pub session_token: String,
    /// Session expiry (unix seconds) on success
    pub expires_at: u64,
    /// Refresh interval (seconds) on success
    pub interval: u16,
}

impl RegisterAck {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_REGISTER_ACK);
        out.put_u8(self.result);
        if self.result == RESULT_SUCCESS {
            put_string(&mut out, &self.secret_key);
            put_string(&mut out, &self.session_token);
            out.put_u64_le(self.expires_at);
            out.put_u16_le(self.interval);
        } else {
            out.put_u8(self.error_code);
        }
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_REGISTER_ACK)?;
        let result = r.u8("result")?;
        let mut ack = Self {
            result,
            ..Default::default()
        };
        if result != RESULT_SUCCESS {
            if let Ok(code) = r.u8("error code") {
                ack.error_code = code;
            }
            return Ok(ack);
        }
        ack.secret_key = r.string("secret key")?;
        ack.session_token = r.string("session token")?;
        ack.expires_at = r.u64_le("expires_at")?;
        ack.interval = r.u16_le("interval")?;
        Ok(ack)
    }
}

// ---------------------------------------------------------------------------
// API key management
// ---------------------------------------------------------------------------

/// API_KEY_REQUEST: `[type:1][uuid_len:2][uuid][token_len:2][token][expiration:2]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRequest {
    /// Drone UUID string
    pub drone_uuid: String,
    /// Current session token for verification
    pub session_token: String,
    /// Requested key lifetime in hours (1-720)
    pub expiration_hours: u16,
}

impl ApiKeyRequest {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_API_KEY_REQUEST);
        put_string(&mut out, &self.drone_uuid);
        put_string(&mut out, &self.session_token);
        out.put_u16_le(self.expiration_hours);
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_API_KEY_REQUEST)?;
        let drone_uuid = r.string("uuid")?;
        let session_token = r.string("token")?;
        let expiration_hours = r.u16_le("expiration")?;
        Ok(Self {
            drone_uuid,
            session_token,
            expiration_hours,
        })
    }
}

/// API_KEY_RESPONSE.
///
/// Canonical form: `[type:1][result:1][error_code:1]` followed on success by
/// `[key_len:2][key][expires_at:8]`. A legacy router variant prefixes the
/// whole message with a `u16` payload length; the decoder accepts it by
/// sniffing the type byte at offset 2. Only the canonical form is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiKeyResponse {
    /// `RESULT_SUCCESS` or `RESULT_FAILURE`
    pub result: u8,
    /// Error code when `result == RESULT_FAILURE`
    pub error_code: u8,
    /// Generated API key on success
    pub api_key: String,
    /// Key expiry (unix seconds) on success
    pub expires_at: u64,
}

impl ApiKeyResponse {
    /// Serializes the message to its canonical wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_API_KEY_RESPONSE);
        out.put_u8(self.result);
        out.put_u8(self.error_code);
        if self.result == RESULT_SUCCESS {
            put_string(&mut out, &self.api_key);
            out.put_u64_le(self.expires_at);
        }
        out
    }

    /// Parses either the canonical or the legacy length-prefixed wire form.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() {
            return Err(CodecError::Truncated("message type"));
        }
        // Legacy variant: [length:2][type:1]...
        if data.len() >= 3 && data[2] == MSG_API_KEY_RESPONSE {
            let payload_len = u16::from_le_bytes([data[0], data[1]]) as usize;
            if data.len() < payload_len + 2 {
                return Err(CodecError::Truncated("legacy payload"));
            }
            return Self::decode_at(&data[2..]);
        }
        if data[0] == MSG_API_KEY_RESPONSE {
            return Self::decode_at(data);
        }
        Err(CodecError::UnexpectedType {
            expected: MSG_API_KEY_RESPONSE,
            got: data[0],
        })
    }

    fn decode_at(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_API_KEY_RESPONSE)?;
        let result = r.u8("result")?;
        let error_code = r.u8("error code")?;
        let mut resp = Self {
            result,
            error_code,
            ..Default::default()
        };
        if result == RESULT_SUCCESS {
            resp.api_key = r.string("api key")?;
            resp.expires_at = r.u64_le("expires_at")?;
        }
        Ok(resp)
    }
}

/// API_KEY_REVOKE / API_KEY_STATUS / API_KEY_DELETE all share the layout
/// `[type:1][uuid_len:2][uuid][token_len:2][token]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyCommand {
    /// One of `MSG_API_KEY_REVOKE`, `MSG_API_KEY_STATUS`, `MSG_API_KEY_DELETE`
    pub msg_type: u8,
    /// Drone UUID string
    pub drone_uuid: String,
    /// Current session token for verification
    pub session_token: String,
}

impl ApiKeyCommand {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(self.msg_type);
        put_string(&mut out, &self.drone_uuid);
        put_string(&mut out, &self.session_token);
        out
    }

    /// Parses the wire form back into a message, checking the type byte.
    pub fn decode(msg_type: u8, data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(msg_type)?;
        let drone_uuid = r.string("uuid")?;
        let session_token = r.string("token")?;
        Ok(Self {
            msg_type,
            drone_uuid,
            session_token,
        })
    }
}

/// API_KEY_REVOKE_ACK / API_KEY_DELETE_ACK: `[type:1][result:1][error_code:1]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyAck {
    /// `MSG_API_KEY_REVOKE_ACK` or `MSG_API_KEY_DELETE_ACK`
    pub msg_type: u8,
    /// `RESULT_SUCCESS` or `RESULT_FAILURE`
    pub result: u8,
    /// Error code when `result == RESULT_FAILURE`
    pub error_code: u8,
}

impl ApiKeyAck {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.msg_type, self.result, self.error_code]
    }

    /// Parses the wire form back into a message, checking the type byte.
    pub fn decode(msg_type: u8, data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(msg_type)?;
        let result = r.u8("result")?;
        let error_code = r.u8("error code")?;
        Ok(Self {
            msg_type,
            result,
            error_code,
        })
    }
}

/// API_KEY_STATUS_RESP:
/// `[type:1][has_key:1][status_len:2][status][key_len:2][key]` followed, when
/// `has_key == 0x01`, by `[created_at:8][expires_at:8][user_uuid_len:2]
/// [user_uuid][user_activated_at:8]`. The tail may be truncated after any
/// whole field by older routers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiKeyStatusResponse {
    /// 0x01 when an active key exists
    pub has_active_key: u8,
    /// "pending", "connected", "expired" or "none"
    pub status: String,
    /// Raw API key for display
    pub api_key: String,
    /// Key creation timestamp (unix seconds)
    pub created_at: u64,
    /// Key expiry timestamp (unix seconds)
    pub expires_at: u64,
    /// Connected operator UUID, if any
    pub user_uuid: String,
    /// Operator activation timestamp (unix seconds)
    pub user_activated_at: u64,
}

impl ApiKeyStatusResponse {
    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(MSG_API_KEY_STATUS_RESP);
        out.put_u8(self.has_active_key);
        put_string(&mut out, &self.status);
        put_string(&mut out, &self.api_key);
        if self.has_active_key == 0x01 {
            out.put_u64_le(self.created_at);
            out.put_u64_le(self.expires_at);
            put_string(&mut out, &self.user_uuid);
            out.put_u64_le(self.user_activated_at);
        }
        out
    }

    /// Parses the wire form back into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        r.expect_type(MSG_API_KEY_STATUS_RESP)?;
        let has_active_key = r.u8("has_active_key")?;
        let status = r.string("status")?;
        let api_key = r.string("api key")?;
        let mut resp = Self {
            has_active_key,
            status,
            api_key,
            ..Default::default()
        };
        if has_active_key == 0x01 {
            if let Ok(v) = r.u64_le("created_at") {
                resp.created_at = v;
            }
            if let Ok(v) = r.u64_le("expires_at") {
                resp.expires_at = v;
            }
            if let Ok(v) = r.string("user uuid") {
                resp.user_uuid = v;
            }
            if let Ok(v) = r.u64_le("user_activated_at") {
                resp.user_activated_at = v;
            }
        }
        Ok(resp)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn rand_string(rng: &mut impl Rng, max_len: usize) -> String {
        let len = rng.gen_range(0..=max_len);
        (0..len)
            .map(|_| char::from(rng.gen_range(b'!'..=b'~')))
            .collect()
    }

    fn rand_bytes(rng: &mut impl Rng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_auth_init_roundtrip() {
        let msg = AuthInit {
            drone_uuid: "970cbc93-d7df-49dc-8ee0-91c138e7ec98".to_string(),
        };
        let wire = msg.encode();
        assert_eq!(wire[0], MSG_AUTH_INIT);
        assert_eq!(AuthInit::decode(&wire).expect("decode"), msg);
    }

    #[test]
    fn test_randomized_roundtrips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5e55_10);
        for _ in 0..200 {
            let nonce_len = rng.gen_range(0..64);
            let challenge = AuthChallenge {
                nonce: rand_bytes(&mut rng, nonce_len),
                timeout_sec: rng.gen(),
            };
            assert_eq!(
                AuthChallenge::decode(&challenge.encode()).expect("challenge"),
                challenge
            );

            let resp = AuthResponse {
                drone_uuid: rand_string(&mut rng, 40),
                hmac: rand_bytes(&mut rng, 32),
                timestamp: rng.gen(),
                ip: rand_string(&mut rng, 15),
            };
            assert_eq!(AuthResponse::decode(&resp.encode()).expect("response"), resp);

            let ack = AuthAck {
                result: RESULT_SUCCESS,
                session_token: rand_string(&mut rng, 80),
                expires_at: rng.gen(),
                interval: rng.gen(),
                ..Default::default()
            };
            assert_eq!(AuthAck::decode(&ack.encode()).expect("ack"), ack);

            let refresh = SessionRefresh {
                session_token: rand_string(&mut rng, 80),
                drone_uuid: rand_string(&mut rng, 36),
            };
            assert_eq!(
                SessionRefresh::decode(&refresh.encode()).expect("refresh"),
                refresh
            );

            let reg_ack = RegisterAck {
                result: RESULT_SUCCESS,
                secret_key: rand_string(&mut rng, 64),
                session_token: rand_string(&mut rng, 80),
                expires_at: rng.gen(),
                interval: rng.gen(),
                ..Default::default()
            };
            assert_eq!(
                RegisterAck::decode(&reg_ack.encode()).expect("register ack"),
                reg_ack
            );

            let session_req = SessionRequest {
                drone_uuid: rand_string(&mut rng, 36),
                old_session_token: rand_string(&mut rng, 80),
            };
            assert_eq!(
                SessionRequest::decode(&session_req.encode()).expect("session req"),
                session_req
            );
        }
    }

    #[test]
    fn test_auth_ack_failure_with_wait() {
        let ack = AuthAck {
            result: RESULT_FAILURE,
            error_code: ERR_RATE_LIMITED,
            wait_sec: 30,
            ..Default::default()
        };
        let decoded = AuthAck::decode(&ack.encode()).expect("decode");
        assert_eq!(decoded.result, RESULT_FAILURE);
        assert_eq!(decoded.error_code, ERR_RATE_LIMITED);
        assert_eq!(decoded.wait_sec, 30);
    }

    #[test]
    fn test_auth_ack_failure_without_wait() {
        // Some router versions send only [type][result][error_code].
        let wire = vec![MSG_AUTH_ACK, RESULT_FAILURE, ERR_INVALID_HMAC];
        let decoded = AuthAck::decode(&wire).expect("decode");
        assert_eq!(decoded.error_code, ERR_INVALID_HMAC);
        assert_eq!(decoded.wait_sec, 0);
    }

    #[test]
    fn test_truncated_is_distinguished() {
        let msg = AuthResponse {
            drone_uuid: "u".repeat(36),
            hmac: vec![0xAB; 32],
            timestamp: 1_700_000_000,
            ip: "10.0.0.5".to_string(),
        };
        let wire = msg.encode();
        for cut in 1..wire.len() {
            let err = AuthResponse::decode(&wire[..cut]).expect_err("must fail");
            assert!(matches!(err, CodecError::Truncated(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_wrong_type_rejected() {
        let wire = AuthInit {
            drone_uuid: "x".to_string(),
        }
        .encode();
        let err = RegisterInit::decode(&wire).expect_err("must fail");
        assert_eq!(
            err,
            CodecError::UnexpectedType {
                expected: MSG_REGISTER_INIT,
                got: MSG_AUTH_INIT
            }
        );
    }

    #[test]
    fn test_length_exceeding_buffer_rejected() {
        // Advertised uuid length of 100 with only 4 bytes present.
        let mut wire = vec![MSG_AUTH_INIT, 100, 0];
        wire.extend_from_slice(b"abcd");
        assert!(matches!(
            AuthInit::decode(&wire),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_api_key_response_legacy_length_prefix() {
        let resp = ApiKeyResponse {
            result: RESULT_SUCCESS,
            error_code: 0,
            api_key: "ak_1234567890".to_string(),
            expires_at: 1_800_000_000,
        };
        let canonical = resp.encode();

        // Legacy form: [length:2 LE][canonical message]
        let mut legacy = Vec::new();
        legacy.put_u16_le(canonical.len() as u16);
        legacy.extend_from_slice(&canonical);

        assert_eq!(ApiKeyResponse::decode(&canonical).expect("canonical"), resp);
        assert_eq!(ApiKeyResponse::decode(&legacy).expect("legacy"), resp);
    }

    #[test]
    fn test_api_key_status_optional_tail() {
        let full = ApiKeyStatusResponse {
            has_active_key: 0x01,
            status: "connected".to_string(),
            api_key: "ak_key".to_string(),
            created_at: 100,
            expires_at: 200,
            user_uuid: "11111111-2222-3333-4444-555555555555".to_string(),
            user_activated_at: 150,
        };
        let wire = full.encode();
        assert_eq!(ApiKeyStatusResponse::decode(&wire).expect("full"), full);

        // Old routers stop after expires_at; the decoder must tolerate it.
        let short = &wire[..wire.len() - (2 + full.user_uuid.len() + 8)];
        let decoded = ApiKeyStatusResponse::decode(short).expect("short");
        assert_eq!(decoded.created_at, 100);
        assert_eq!(decoded.expires_at, 200);
        assert!(decoded.user_uuid.is_empty());
        assert_eq!(decoded.user_activated_at, 0);
    }

    #[test]
    fn test_api_key_status_no_key() {
        let resp = ApiKeyStatusResponse {
            has_active_key: 0x00,
            status: "none".to_string(),
            ..Default::default()
        };
        assert_eq!(
            ApiKeyStatusResponse::decode(&resp.encode()).expect("decode"),
            resp
        );
    }

    #[test]
    fn test_api_key_command_shapes() {
        for msg_type in [MSG_API_KEY_REVOKE, MSG_API_KEY_STATUS, MSG_API_KEY_DELETE] {
            let cmd = ApiKeyCommand {
                msg_type,
                drone_uuid: "uuid".to_string(),
                session_token: "token".to_string(),
            };
            assert_eq!(
                ApiKeyCommand::decode(msg_type, &cmd.encode()).expect("decode"),
                cmd
            );
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            AuthAck::decode(&[]),
            Err(CodecError::Truncated(_))
        ));
        assert!(matches!(
            ApiKeyResponse::decode(&[]),
            Err(CodecError::Truncated(_))
        ));
    }
}

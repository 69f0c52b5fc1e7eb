//! Custom error types for dronebridge-rs.
//!
//! This module defines structured error types covering the failure classes
//! the bridge distinguishes at runtime: fatal configuration/identity/discovery
//! problems, recoverable network errors on the control channel, protocol-level
//! rejections from the router, and per-message codec failures.

use std::io;
use thiserror::Error;

use crate::protocol::CodecError;

/// Main error type for dronebridge-rs operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The drone has no persisted secret key and cannot authenticate.
    #[error("Drone is not registered: {0}. Run with --register first")]
    NotRegistered(String),

    /// Flight-controller discovery failed within the configured timeout.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Network I/O errors on the control channel or UDP sockets.
    ///
    /// These are recoverable: the connection is closed and rebuilt on the
    /// next operation.
    #[error("Network error during {context}: {source}")]
    Network {
        /// What the bridge was doing when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The router replied with `result = failure` during a session refresh
    /// with an error code that invalidates the token (expired / unknown).
    ///
    /// The TCP connection is still alive; the session manager must
    /// re-authenticate.
    #[error("Session invalid on router (error=0x{code:02x})")]
    SessionInvalid {
        /// Router error code (0x06 expired, 0x07 invalid token)
        code: u8,
    },

    /// The router replied with `result = failure` for any other reason.
    #[error("{op} rejected by router (error=0x{code:02x})")]
    Command {
        /// The operation that was rejected
        op: &'static str,
        /// Router error code
        code: u8,
    },

    /// Wire-level decode failure of a single control-protocol message.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// File system errors (secret file, config file)
    #[error("Filesystem error at '{path}': {source}")]
    Filesystem {
        /// Path that caused the error
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Internal invariant violations (no session when one is required, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(context: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            context: context.into(),
            source,
        }
    }

    /// Create a network error representing an elapsed read deadline
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Network {
            context: context.into(),
            source: io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed"),
        }
    }

    /// Create a new filesystem error
    pub fn filesystem(path: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for socket-level failures that require closing and rebuilding
    /// the control connection.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// True when the router declared the session token unusable and a full
    /// re-authentication is required. The TCP connection stays open.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid { .. })
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            context: "io".to_string(),
            source: err,
        }
    }
}

use crate::error::{BridgeError, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

/// Configuration for the bridge.
///
/// Loaded from a YAML file using [`Config::load`].
///
/// # Example
/// ```yaml
/// log:
///   level: info
///   verbose: false
///   stats_interval: 30
///
/// auth:
///   enabled: true
///   host: router.fleet.example
///   port: 5770
///   uuid: "970cbc93-d7df-49dc-8ee0-91c138e7ec98"
///   shared_secret: "SHARED-XYZ"
///   keepalive_interval: 30
///   session_heartbeat_frequency: 1.0
///
/// network:
///   local_listen_port: 14550
///   broadcast_port: -1
///   target_host: router.fleet.example
///   target_port: 14560
///
/// ethernet:
///   allow_missing_pixhawk: false
///   pixhawk_connection_timeout: 30
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Logging behavior.
    #[serde(default)]
    pub log: LogConfig,
    /// Router authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// MAVLink UDP network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Flight-controller link discovery hints.
    #[serde(default)]
    pub ethernet: EthernetConfig,
    /// Local web surface settings (consumed by a collaborator, not the core).
    #[serde(default)]
    pub web: WebConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable verbose field-by-field parsing of downstream messages
    #[serde(default)]
    pub verbose: bool,
    /// "time" or "unix" timestamps in log lines
    #[serde(default)]
    pub timestamp_format: String,
    /// Interval in seconds for printing stats summaries
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

/// Router authentication settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Whether to run register/authenticate at all
    #[serde(default)]
    pub enabled: bool,
    /// Router host for the TCP control channel
    #[serde(default)]
    pub host: String,
    /// Router port for the TCP control channel
    #[serde(default = "default_auth_port")]
    pub port: u16,
    /// Drone identity; must be a canonical 8-4-4-4-12 UUID
    #[serde(default)]
    pub uuid: String,
    /// Fleet-wide shared secret used in registration and the combined key
    #[serde(default)]
    pub shared_secret: String,
    /// Seconds between refreshes if the router does not override
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    /// Hz of SESSION_HEARTBEAT emission
    #[serde(default = "default_heartbeat_frequency")]
    pub session_heartbeat_frequency: f64,
}

/// MAVLink UDP network settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NetworkConfig {
    /// Local UDP port receiving MAVLink from the flight controller
    #[serde(default)]
    pub local_listen_port: u16,
    /// Local bind port for broadcast discovery: -1 disabled, 0 random, >0 bind
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: i32,
    /// Remote UDP host for forwarded MAVLink
    #[serde(default)]
    pub target_host: String,
    /// Remote UDP port for forwarded MAVLink
    #[serde(default)]
    pub target_port: u16,
}

/// Flight-controller link discovery hints.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EthernetConfig {
    /// Interface name (eth0, end0, ...) - empty for auto-detect
    #[serde(default)]
    pub interface: String,
    /// Local IP to bind the broadcast listener - empty for auto-detect
    #[serde(default)]
    pub local_ip: String,
    /// Broadcast IP - empty for auto-detect from the local IP
    #[serde(default)]
    pub broadcast_ip: String,
    /// Flight-controller IP hint
    #[serde(default)]
    pub pixhawk_ip: String,
    /// Auto-configure the interface IP if not set (collaborator script)
    #[serde(default)]
    pub auto_setup: bool,
    /// Subnet mask bits (e.g. "24")
    #[serde(default = "default_subnet")]
    pub subnet: String,
    /// Allow startup without a flight controller
    #[serde(default)]
    pub allow_missing_pixhawk: bool,
    /// Seconds to wait for the first flight-controller heartbeat
    #[serde(default = "default_pixhawk_timeout")]
    pub pixhawk_connection_timeout: u64,
}

/// Local web surface settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    /// Web server port (collaborator surface)
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_stats_interval() -> u64 {
    30
}
fn default_auth_port() -> u16 {
    5770
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_heartbeat_frequency() -> f64 {
    1.0
}
fn default_broadcast_port() -> i32 {
    -1
}
fn default_subnet() -> String {
    "24".to_string()
}
fn default_pixhawk_timeout() -> u64 {
    30
}
fn default_web_port() -> u16 {
    8080
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: false,
            timestamp_format: String::new(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

/// Checks for the canonical hyphenated 8-4-4-4-12 hex UUID form.
///
/// `uuid::Uuid` also accepts simple/braced/urn forms, so the shape is pinned
/// before parsing.
pub fn is_valid_uuid(s: &str) -> bool {
    let b = s.as_bytes();
    s.len() == 36
        && b[8] == b'-'
        && b[13] == b'-'
        && b[18] == b'-'
        && b[23] == b'-'
        && uuid::Uuid::try_parse(s).is_ok()
}

impl Config {
    /// Loads the bridge configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns a `BridgeError` if the file cannot be read or parsed, or if
    /// the configuration fails validation.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| BridgeError::filesystem(&path_str, e))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration: UUID shape, port and interval ranges.
    pub fn validate(&self) -> Result<()> {
        if self.auth.enabled {
            if self.auth.host.is_empty() {
                return Err(BridgeError::config(
                    "auth.host cannot be empty when auth is enabled",
                ));
            }
            if self.auth.port == 0 {
                return Err(BridgeError::config("auth.port must be between 1 and 65535"));
            }
            if !is_valid_uuid(&self.auth.uuid) {
                return Err(BridgeError::config(format!(
                    "invalid drone UUID '{}': strictly 8-4-4-4-12 hex required",
                    self.auth.uuid
                )));
            }
            if self.auth.keepalive_interval == 0 {
                return Err(BridgeError::config(
                    "auth.keepalive_interval must be greater than 0",
                ));
            }
            if self.auth.session_heartbeat_frequency <= 0.0 {
                return Err(BridgeError::config(
                    "auth.session_heartbeat_frequency must be greater than 0",
                ));
            }
        }
        if self.network.local_listen_port == 0 {
            return Err(BridgeError::config(
                "network.local_listen_port must be between 1 and 65535",
            ));
        }
        if self.network.target_host.is_empty() {
            return Err(BridgeError::config("network.target_host cannot be empty"));
        }
        if self.network.target_port == 0 {
            return Err(BridgeError::config(
                "network.target_port must be between 1 and 65535",
            ));
        }
        if self.network.broadcast_port > 65535 {
            return Err(BridgeError::config(
                "network.broadcast_port must be -1, 0 or a valid port",
            ));
        }
        Ok(())
    }

    /// Returns the remote MAVLink target as `host:port`.
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.network.target_host, self.network.target_port)
    }

    /// Returns the control-channel endpoint as `host:port`.
    pub fn auth_addr(&self) -> String {
        format!("{}:{}", self.auth.host, self.auth.port)
    }
}

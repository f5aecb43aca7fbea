//! # Sync Configuration
//!
//! Configuration management for the sync server.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FOLIO_PORT=8766                                                    │
//! │     FOLIO_JWT_SECRET=...                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     explicit path, or                                                  │
//! │     ~/.config/folio/sync.toml (Linux)                                  │
//! │     ~/Library/Application Support/app.folio.folio/sync.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8766
//! max_connections = 10000
//! heartbeat_interval_secs = 30
//! write_timeout_secs = 10
//!
//! [auth]
//! jwt_secret = "..."
//! auth_timeout_secs = 30
//! token_leeway_secs = 0
//!
//! [dispatcher]
//! queue_capacity = 1000
//!
//! [deferred]
//! drain_interval_secs = 5
//!
//! [database]
//! path = "/var/lib/folio/folio.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::connection::ConnectionTimeouts;
use crate::error::{SyncError, SyncResult};

/// Allowed range for the write deadline.
const WRITE_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 5..=10;

// =============================================================================
// Server Settings
// =============================================================================

/// Listener, admission and per-connection deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Open connections allowed at once, counted from accept, so devices
    /// still in the handshake hold a slot.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Server heartbeat period for authenticated devices (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Write deadline (seconds). Must be within 5..=10.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Read deadline before authentication (seconds).
    #[serde(default = "default_unauthenticated_read_timeout")]
    pub unauthenticated_read_timeout_secs: u64,

    /// Read deadline after authentication (seconds).
    #[serde(default = "default_authenticated_read_timeout")]
    pub authenticated_read_timeout_secs: u64,

    /// Per-connection buffer cap for an undelimited frame (bytes).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8766
}

fn default_max_connections() -> usize {
    10_000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    10
}

fn default_unauthenticated_read_timeout() -> u64 {
    30
}

fn default_authenticated_read_timeout() -> u64 {
    60
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_connections: default_max_connections(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            write_timeout_secs: default_write_timeout(),
            unauthenticated_read_timeout_secs: default_unauthenticated_read_timeout(),
            authenticated_read_timeout_secs: default_authenticated_read_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Deadlines handed to every accepted connection.
    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            unauthenticated_read: Duration::from_secs(self.unauthenticated_read_timeout_secs),
            authenticated_read: Duration::from_secs(self.authenticated_read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Bearer-token settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 shared secret. Required.
    #[serde(default)]
    pub jwt_secret: String,

    /// Lifetime of tokens issued by this process (seconds).
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: i64,

    /// Handshake deadline (seconds).
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Clock skew tolerated when checking `exp` (seconds). 0 means a token
    /// is rejected the second it expires.
    #[serde(default)]
    pub token_leeway_secs: u64,
}

fn default_token_lifetime() -> i64 {
    86_400
}

fn default_auth_timeout() -> u64 {
    30
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            jwt_secret: String::new(),
            token_lifetime_secs: default_token_lifetime(),
            auth_timeout_secs: default_auth_timeout(),
            token_leeway_secs: 0,
        }
    }
}

impl AuthSettings {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"<redacted>")
            .field("token_lifetime_secs", &self.token_lifetime_secs)
            .field("auth_timeout_secs", &self.auth_timeout_secs)
            .field("token_leeway_secs", &self.token_leeway_secs)
            .finish()
    }
}

// =============================================================================
// Dispatcher / Deferred / Database Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Bounded event queue size. Submits beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredSettings {
    /// Periodic drain interval (seconds).
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
}

fn default_drain_interval() -> u64 {
    5
}

impl Default for DeferredSettings {
    fn default() -> Self {
        DeferredSettings {
            drain_interval_secs: default_drain_interval(),
        }
    }
}

impl DeferredSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Pool size.
    #[serde(default = "default_database_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("app", "folio", "folio")
        .map(|dirs| dirs.data_dir().join("folio.db"))
        .unwrap_or_else(|| PathBuf::from("folio.db"))
}

fn default_database_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_database_connections(),
        }
    }
}

// =============================================================================
// Main Config
// =============================================================================

/// Complete sync server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    #[serde(default)]
    pub deferred: DeferredSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "auth.jwt_secret must be set (or FOLIO_JWT_SECRET)".into(),
            ));
        }

        if !WRITE_TIMEOUT_RANGE.contains(&self.server.write_timeout_secs) {
            return Err(SyncError::InvalidConfig(format!(
                "server.write_timeout_secs must be within {}..={}, got {}",
                WRITE_TIMEOUT_RANGE.start(),
                WRITE_TIMEOUT_RANGE.end(),
                self.server.write_timeout_secs
            )));
        }

        let positive = [
            ("server.max_connections", self.server.max_connections as u64),
            ("server.heartbeat_interval_secs", self.server.heartbeat_interval_secs),
            ("server.max_frame_bytes", self.server.max_frame_bytes as u64),
            ("server.unauthenticated_read_timeout_secs", self.server.unauthenticated_read_timeout_secs),
            ("server.authenticated_read_timeout_secs", self.server.authenticated_read_timeout_secs),
            ("auth.auth_timeout_secs", self.auth.auth_timeout_secs),
            ("dispatcher.queue_capacity", self.dispatcher.queue_capacity as u64),
            ("deferred.drain_interval_secs", self.deferred.drain_interval_secs),
            ("database.max_connections", self.database.max_connections as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        // The gate's deadline has to fire before the read deadline does.
        if self.auth.auth_timeout_secs > self.server.unauthenticated_read_timeout_secs {
            return Err(SyncError::InvalidConfig(
                "auth.auth_timeout_secs must not exceed server.unauthenticated_read_timeout_secs"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Applies `FOLIO_*` environment overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FOLIO_BIND_ADDR") {
            self.server.bind_addr = addr;
        }

        if let Some(port) = env_parse::<u16>("FOLIO_PORT") {
            debug!(port, "Overriding port from environment");
            self.server.port = port;
        }

        if let Some(max) = env_parse::<usize>("FOLIO_MAX_CONNECTIONS") {
            self.server.max_connections = max;
        }

        if let Some(secs) = env_parse::<u64>("FOLIO_HEARTBEAT_INTERVAL_SECS") {
            self.server.heartbeat_interval_secs = secs;
        }

        if let Some(secs) = env_parse::<u64>("FOLIO_WRITE_TIMEOUT_SECS") {
            self.server.write_timeout_secs = secs;
        }

        if let Ok(secret) = std::env::var("FOLIO_JWT_SECRET") {
            debug!("Overriding JWT secret from environment");
            self.auth.jwt_secret = secret;
        }

        if let Some(secs) = env_parse::<u64>("FOLIO_AUTH_TIMEOUT_SECS") {
            self.auth.auth_timeout_secs = secs;
        }

        if let Some(secs) = env_parse::<u64>("FOLIO_TOKEN_LEEWAY_SECS") {
            self.auth.token_leeway_secs = secs;
        }

        if let Some(capacity) = env_parse::<usize>("FOLIO_QUEUE_CAPACITY") {
            self.dispatcher.queue_capacity = capacity;
        }

        if let Some(secs) = env_parse::<u64>("FOLIO_DRAIN_INTERVAL_SECS") {
            self.deferred.drain_interval_secs = secs;
        }

        if let Ok(path) = std::env::var("FOLIO_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "folio", "folio")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }
}

/// Reads and parses an environment variable, ignoring unparsable values.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

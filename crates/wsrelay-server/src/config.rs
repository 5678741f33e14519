//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a JSON config file is given and exists, deep-merge its values over defaults
//! 3. Apply `WSRELAY_*` environment variable overrides
//!
//! CLI flags are layered on top by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::ConfigError;

/// Configuration for the websocket server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`, `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent websocket sessions. Further upgrades get 503.
    pub max_connections: usize,
    /// Keepalive ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a session when no pong arrived for this many seconds.
    pub heartbeat_timeout_secs: u64,
    /// Max payload of a single frame in bytes.
    pub max_frame_size: usize,
    /// Max size of a reassembled message in bytes.
    pub max_message_size: usize,
    /// Max size of the HTTP upgrade request head in bytes.
    pub max_handshake_size: usize,
    /// A connection must finish its HTTP upgrade within this many seconds.
    pub handshake_timeout_secs: u64,
    /// Frames buffered per session before sends to it start failing.
    pub send_queue_size: usize,
    /// A single frame write stalled longer than this drops the transport.
    pub write_timeout_secs: u64,
    /// Bytes reserved per socket read.
    pub read_buffer_size: usize,
    /// How long graceful shutdown waits for sessions to finish.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_connections: 1024,
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 60,
            max_frame_size: 16 * 1024 * 1024,   // 16 MB
            max_message_size: 64 * 1024 * 1024, // 64 MB
            max_handshake_size: 8 * 1024,
            handshake_timeout_secs: 10,
            send_queue_size: 256,
            write_timeout_secs: 10,
            read_buffer_size: 8192,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be at least 1".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.max_frame_size == 0 || self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue("size limits must be non-zero".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue("read_buffer_size must be non-zero".into()));
        }
        if self.send_queue_size == 0 {
            return Err(ConfigError::InvalidValue("send_queue_size must be non-zero".into()));
        }
        if self.handshake_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "handshake_timeout_secs and write_timeout_secs must be at least 1".into(),
            ));
        }
        // The request line alone needs some room.
        if self.max_handshake_size < 256 {
            return Err(ConfigError::InvalidValue(format!(
                "max_handshake_size ({}) must be at least 256",
                self.max_handshake_size
            )));
        }
        Ok(())
    }
}

/// Load configuration with process env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_config`] with an injectable environment lookup.
pub fn load_config_with_env(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `WSRELAY_*` overrides.
///
/// Integers must parse and fall within range; invalid values are logged and
/// ignored (falling back to file/default).
pub fn apply_env_overrides(config: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| env(name).filter(|v| !v.trim().is_empty());
    let ranged = |name: &str, min: u64, max: u64| {
        let val = env(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, min, max, "invalid env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("WSRELAY_HOST") {
        config.host = v;
    }
    if let Some(v) = ranged("WSRELAY_PORT", 0, u64::from(u16::MAX)) {
        config.port = v as u16;
    }
    if let Some(v) = ranged("WSRELAY_MAX_CONNECTIONS", 1, 1_000_000) {
        config.max_connections = v as usize;
    }
    if let Some(v) = ranged("WSRELAY_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = ranged("WSRELAY_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        config.heartbeat_timeout_secs = v;
    }
    if let Some(v) = ranged("WSRELAY_MAX_FRAME_SIZE", 125, 1 << 31) {
        config.max_frame_size = v as usize;
    }
    if let Some(v) = ranged("WSRELAY_MAX_MESSAGE_SIZE", 125, 1 << 32) {
        config.max_message_size = v as usize;
    }
    if let Some(v) = ranged("WSRELAY_MAX_HANDSHAKE_SIZE", 256, 1 << 20) {
        config.max_handshake_size = v as usize;
    }
    if let Some(v) = ranged("WSRELAY_READ_BUFFER_SIZE", 512, 1 << 24) {
        config.read_buffer_size = v as usize;
    }
    if let Some(v) = ranged("WSRELAY_SHUTDOWN_TIMEOUT_SECS", 0, 3_600) {
        config.shutdown_timeout_secs = v;
    }
    if let Some(v) = ranged("WSRELAY_HANDSHAKE_TIMEOUT_SECS", 1, 600) {
        config.handshake_timeout_secs = v;
    }
    if let Some(v) = ranged("WSRELAY_SEND_QUEUE_SIZE", 1, 1 << 20) {
        config.send_queue_size = v as usize;
    }
    if let Some(v) = ranged("WSRELAY_WRITE_TIMEOUT_SECS", 1, 3_600) {
        config.write_timeout_secs = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

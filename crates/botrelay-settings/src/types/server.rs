//! Server, heartbeat, and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` for auto-assign).
    pub port: u16,
    /// Upgrade path for Adapter connections.
    pub adapter_path: String,
    /// Upgrade path for Processor connections.
    pub processor_path: String,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Graceful shutdown timeout in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            adapter_path: "/ws/adapter".to_string(),
            processor_path: "/ws/processor".to_string(),
            max_message_size: 16 * 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Ping cadence and read deadlines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Interval between server-initiated Ping frames.
    pub ping_interval_secs: u64,
    /// Read deadline for Adapter connections.
    pub adapter_read_timeout_secs: u64,
    /// Read deadline for Processor connections.
    pub processor_read_timeout_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            adapter_read_timeout_secs: 120,
            processor_read_timeout_secs: 60,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ScanError};

/// Default location of the Docker engine API socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// layerscan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Container runtime API settings
    pub docker: DockerConfig,

    /// Pub/sub broker settings
    pub broker: BrokerConfig,

    /// Result correlation settings
    pub scan: CorrelatorConfig,
}

impl ScanConfig {
    /// Load configuration from a YAML file.
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScanError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ScanConfig = serde_yaml::from_str(&content)?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values that would make the runtime hang or misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.docker.connect_timeout_secs == 0 || self.docker.request_timeout_secs == 0 {
            return Err(ScanError::ConfigError(
                "docker timeouts must be greater than 0".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ScanError::ConfigError(
                "broker port must be greater than 0".to_string(),
            ));
        }
        if self.broker.ack_timeout_secs == 0 {
            return Err(ScanError::ConfigError(
                "broker ack_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.broker.channel_capacity == 0 {
            return Err(ScanError::ConfigError(
                "broker channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.scan.scan_timeout_secs == 0 {
            return Err(ScanError::ConfigError(
                "scan_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Container runtime (Docker engine API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Path to the engine's unix socket
    pub socket_path: PathBuf,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Per-request timeout in seconds (applied to each read of a streamed body)
    pub request_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            connect_timeout_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

impl DockerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Pub/sub broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client identifier presented to the broker
    pub client_id: String,

    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,

    /// How long to wait for the broker to acknowledge a publish or subscribe
    pub ack_timeout_secs: u64,

    /// Capacity of the inbound message channel
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "layerscan.client".to_string(),
            keep_alive_secs: 30,
            ack_timeout_secs: 30,
            channel_capacity: 256,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Result correlation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Longest a result stream waits without a new result or a terminal
    /// status before reporting the scan as stalled
    pub scan_timeout_secs: u64,

    /// Longest shutdown waits for registered scans to complete and drain
    pub drain_timeout_secs: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 600,
            drain_timeout_secs: 60,
        }
    }
}

impl CorrelatorConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

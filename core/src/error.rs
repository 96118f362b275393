use std::time::Duration;

use thiserror::Error;

/// layerscan error types
#[derive(Error, Debug)]
pub enum ScanError {
    /// Image archive is missing its manifest or carries a malformed layer
    #[error("Archive format error: {0}")]
    ArchiveFormat(String),

    /// Malformed os-release or package database content
    #[error("Parse error: {0}")]
    Parse(String),

    /// Requested object does not exist on the remote side
    #[error("Not found: {0}")]
    NotFound(String),

    /// Container runtime API failure
    #[error("Transport error: {endpoint} - {message}")]
    Transport { endpoint: String, message: String },

    /// Pub/sub broker failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// A scan never reached its terminal status
    #[error("Scan {scan_id} stalled: no progress for {waited:?}")]
    CorrelationStall { scan_id: String, waited: Duration },

    /// Scan id is not registered (or its results were already consumed)
    #[error("Unknown scan: {0}")]
    UnknownScan(String),

    /// Operation was cancelled before it could complete
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ScanError {
    /// Whether this error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ScanError::NotFound(_))
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ScanError {
    fn from(err: serde_yaml::Error) -> Self {
        ScanError::SerializationError(err.to_string())
    }
}

/// Result type alias for layerscan operations
pub type Result<T> = std::result::Result<T, ScanError>;

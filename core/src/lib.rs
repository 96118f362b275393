//! layerscan core - foundational types shared by the runtime and the CLI.
//!
//! This crate carries the error taxonomy, the configuration model and the
//! JSON message shapes exchanged with the remote package scanner.

pub mod config;
pub mod error;
pub mod message;

// Re-export commonly used types
pub use config::{BrokerConfig, CorrelatorConfig, DockerConfig, ScanConfig};
pub use error::{Result, ScanError};
pub use message::{ResultMessage, ResultType, ScanStartMessage, ScanStatus, ScanStatusMessage};

/// layerscan version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

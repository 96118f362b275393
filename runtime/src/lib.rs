//! layerscan runtime - image inspection and scan correlation.
//!
//! This crate reconstructs the filesystem of a saved container image,
//! extracts its OS identity and installed packages, talks to the container
//! runtime to obtain images, and correlates scan results coming back over
//! a publish/subscribe broker.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod broker;
pub mod detect;
pub mod docker;
pub mod inventory;
pub mod scan;

// Re-export common types
pub use archive::{ArchiveEntry, ArchiveSource, EntryKind, ImageArchive, ImageManifest, Layer};
pub use broker::{Broker, BrokerMessage, MemoryBroker, MqttBroker};
pub use detect::{DpkgStatus, OsRelease, Package};
pub use docker::{DockerClient, ImageDetails, ImageSummary, InspectOutcome};
pub use inventory::{collect_inventory, inventory_from_file, ImageInventory};
pub use scan::{ResultStream, ScanCorrelator};

/// layerscan runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

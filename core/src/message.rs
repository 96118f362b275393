//! Message shapes exchanged with the package scanner over the broker.
//!
//! Every message carries a common envelope (`message_id`, `group_id`,
//! `message_type`, `created`) plus a `scan_id` that correlates a scan
//! request with the results and status updates it produces.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ScanError};

/// Discriminator carried in every message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "scan.start")]
    ScanStart,
    #[serde(rename = "scan.status")]
    ScanStatus,
    #[serde(rename = "result.scan")]
    Result,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn dump<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

fn load<T: DeserializeOwned>(payload: &[u8], kind: &str) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| ScanError::SerializationError(format!("Invalid {} message: {}", kind, e)))
}

/// Request to scan a host's package list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStartMessage {
    pub message_id: String,
    pub group_id: String,
    pub message_type: MessageType,
    pub created: f64,
    pub scan_id: String,
    pub host_ip: String,
    pub host_name: String,
    /// Scanner-facing operating system identifier, e.g. `"debian 11"`
    pub os_release: String,
    /// Installed packages as `name-version`
    pub package_list: Vec<String>,
}

impl ScanStartMessage {
    pub const TOPIC: &'static str = "scanner/package/cmd/notus";

    pub fn new(
        scan_id: impl Into<String>,
        host_ip: impl Into<String>,
        host_name: impl Into<String>,
        os_release: impl Into<String>,
        package_list: Vec<String>,
    ) -> Self {
        Self {
            message_id: new_id(),
            group_id: new_id(),
            message_type: MessageType::ScanStart,
            created: now(),
            scan_id: scan_id.into(),
            host_ip: host_ip.into(),
            host_name: host_name.into(),
            os_release: os_release.into(),
            package_list,
        }
    }

    pub fn dump(&self) -> Result<Vec<u8>> {
        dump(self)
    }

    pub fn load(payload: &[u8]) -> Result<Self> {
        load(payload, "scan start")
    }
}

/// Kind of finding carried by a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResultType {
    #[default]
    #[serde(rename = "ALARM")]
    Alarm,
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alarm => write!(f, "ALARM"),
        }
    }
}

fn default_port() -> String {
    "package".to_string()
}

/// A single finding reported by the scanner for one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default = "new_id")]
    pub message_id: String,
    #[serde(default = "new_id")]
    pub group_id: String,
    #[serde(default = "result_type_tag")]
    pub message_type: MessageType,
    #[serde(default)]
    pub created: f64,
    pub scan_id: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_name: String,
    pub oid: String,
    pub value: String,
    #[serde(default)]
    pub result_type: ResultType,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default)]
    pub uri: Option<String>,
}

fn result_type_tag() -> MessageType {
    MessageType::Result
}

impl ResultMessage {
    pub const TOPIC: &'static str = "scanner/scan/info";

    pub fn new(scan_id: impl Into<String>, oid: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            message_id: new_id(),
            group_id: new_id(),
            message_type: MessageType::Result,
            created: now(),
            scan_id: scan_id.into(),
            host_ip: String::new(),
            host_name: String::new(),
            oid: oid.into(),
            value: value.into(),
            result_type: ResultType::Alarm,
            port: default_port(),
            uri: None,
        }
    }

    pub fn dump(&self) -> Result<Vec<u8>> {
        dump(self)
    }

    pub fn load(payload: &[u8]) -> Result<Self> {
        load(payload, "result")
    }
}

/// Progress of a scan as reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScanStatus {
    Requested,
    Queued,
    Init,
    Running,
    Stopped,
    Finished,
    Interrupted,
    /// Any status value this client does not know about
    Other(String),
}

impl ScanStatus {
    /// Whether no further results will be produced for the scan.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Finished)
    }
}

impl From<String> for ScanStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "requested" => Self::Requested,
            "queued" => Self::Queued,
            "init" => Self::Init,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "finished" => Self::Finished,
            "interrupted" => Self::Interrupted,
            _ => Self::Other(value),
        }
    }
}

impl From<ScanStatus> for String {
    fn from(status: ScanStatus) -> Self {
        status.to_string()
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Queued => write!(f, "queued"),
            Self::Init => write!(f, "init"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Finished => write!(f, "finished"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Other(value) => write!(f, "{}", value),
        }
    }
}

/// Status change of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatusMessage {
    #[serde(default = "new_id")]
    pub message_id: String,
    #[serde(default = "new_id")]
    pub group_id: String,
    #[serde(default = "status_type_tag")]
    pub message_type: MessageType,
    #[serde(default)]
    pub created: f64,
    pub scan_id: String,
    pub status: ScanStatus,
}

fn status_type_tag() -> MessageType {
    MessageType::ScanStatus
}

impl ScanStatusMessage {
    pub const TOPIC: &'static str = "scanner/status";

    pub fn new(scan_id: impl Into<String>, status: ScanStatus) -> Self {
        Self {
            message_id: new_id(),
            group_id: new_id(),
            message_type: MessageType::ScanStatus,
            created: now(),
            scan_id: scan_id.into(),
            status,
        }
    }

    pub fn dump(&self) -> Result<Vec<u8>> {
        dump(self)
    }

    pub fn load(payload: &[u8]) -> Result<Self> {
        load(payload, "scan status")
    }
}

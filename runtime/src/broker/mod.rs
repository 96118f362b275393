//! Publish/subscribe broker seam.
//!
//! The correlator only needs four operations from the bus: subscribe to a
//! topic, publish with acknowledged delivery, receive inbound messages and
//! disconnect. [`MqttBroker`] speaks MQTT to a real broker; [`MemoryBroker`]
//! keeps everything in process for tests and dry runs.

mod memory;
mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttBroker;

use async_trait::async_trait;
use layerscan_core::error::{Result, ScanError};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A message received from (or published to) the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Connection to a publish/subscribe bus.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to a topic. Returns once the broker confirmed it.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publish a payload. Returns once the broker acknowledged it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Take the inbound message channel. Can only be taken once.
    fn incoming(&self) -> Result<mpsc::Receiver<BrokerMessage>>;

    /// Close the connection. The inbound channel ends afterwards.
    async fn disconnect(&self) -> Result<()>;
}

/// Holder for a receiver that is handed out exactly once.
pub(crate) struct TakeOnce<T> {
    inner: Mutex<Option<T>>,
}

impl<T> TakeOnce<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Some(value)),
        }
    }

    pub(crate) fn take(&self) -> Result<T> {
        self.inner
            .lock()
            .take()
            .ok_or_else(|| ScanError::Broker("Inbound channel already taken".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_once() {
        let slot = TakeOnce::new(7);
        assert_eq!(slot.take().unwrap(), 7);
        assert!(matches!(slot.take().unwrap_err(), ScanError::Broker(_)));
    }

    #[test]
    fn test_message_new() {
        let message = BrokerMessage::new("scanner/status", b"{}".to_vec());
        assert_eq!(message.topic, "scanner/status");
        assert_eq!(message.payload, b"{}");
    }
}

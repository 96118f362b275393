//! In-process broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use layerscan_core::error::{Result, ScanError};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::{Broker, BrokerMessage, TakeOnce};

/// Broker living entirely in memory.
///
/// Published messages go to every [`tap`](MemoryBroker::tap) receiver and
/// loop back to the inbound channel when their topic is subscribed.
/// [`deliver`](MemoryBroker::deliver) injects messages as if a remote
/// peer had published them.
pub struct MemoryBroker {
    subscriptions: Mutex<HashSet<String>>,
    inbound: Mutex<Option<mpsc::Sender<BrokerMessage>>>,
    receiver: TakeOnce<mpsc::Receiver<BrokerMessage>>,
    tap: broadcast::Sender<BrokerMessage>,
    failing: AtomicBool,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (tap, _) = broadcast::channel(capacity.max(1));
        Self {
            subscriptions: Mutex::new(HashSet::new()),
            inbound: Mutex::new(Some(sender)),
            receiver: TakeOnce::new(receiver),
            tap,
            failing: AtomicBool::new(false),
        }
    }

    /// Observe every message published through this broker.
    pub fn tap(&self) -> broadcast::Receiver<BrokerMessage> {
        self.tap.subscribe()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether a topic is currently subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains(topic)
    }

    /// Inject an inbound message. Messages on unsubscribed topics are dropped.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        if !self.is_subscribed(topic) {
            tracing::debug!(topic, "Dropping message for unsubscribed topic");
            return Ok(());
        }

        let sender = self
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| ScanError::Broker("Broker is disconnected".to_string()))?;

        sender
            .send(BrokerMessage::new(topic, payload))
            .await
            .map_err(|_| ScanError::Broker("Inbound channel closed".to_string()))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        if self.inbound.lock().is_none() {
            return Err(ScanError::Broker("Broker is disconnected".to_string()));
        }
        self.subscriptions.lock().insert(topic.to_string());
        tracing::debug!(topic, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.inbound.lock().is_none() {
            return Err(ScanError::Broker("Broker is disconnected".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ScanError::Broker(format!("Publish to {} rejected", topic)));
        }

        let message = BrokerMessage::new(topic, payload);
        let _ = self.tap.send(message.clone());

        if self.is_subscribed(topic) {
            self.deliver(topic, message.payload).await?;
        }
        Ok(())
    }

    fn incoming(&self) -> Result<mpsc::Receiver<BrokerMessage>> {
        self.receiver.take()
    }

    async fn disconnect(&self) -> Result<()> {
        self.inbound.lock().take();
        self.subscriptions.lock().clear();
        tracing::debug!("Memory broker disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_tap() {
        let broker = MemoryBroker::default();
        let mut tap = broker.tap();

        broker.publish("a/b", b"hello".to_vec()).await.unwrap();

        let message = tap.recv().await.unwrap();
        assert_eq!(message, BrokerMessage::new("a/b", b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_deliver_respects_subscriptions() {
        let broker = MemoryBroker::default();
        let mut incoming = broker.incoming().unwrap();

        broker.deliver("ignored", b"x".to_vec()).await.unwrap();
        broker.subscribe("wanted").await.unwrap();
        broker.deliver("wanted", b"y".to_vec()).await.unwrap();

        let message = incoming.recv().await.unwrap();
        assert_eq!(message.topic, "wanted");
        assert!(incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_loops_back_when_subscribed() {
        let broker = MemoryBroker::default();
        let mut incoming = broker.incoming().unwrap();
        broker.subscribe("echo").await.unwrap();

        broker.publish("echo", b"ping".to_vec()).await.unwrap();
        assert_eq!(incoming.recv().await.unwrap().payload, b"ping");
    }

    #[tokio::test]
    async fn test_incoming_taken_once() {
        let broker = MemoryBroker::default();
        assert!(broker.incoming().is_ok());
        assert!(broker.incoming().is_err());
    }

    #[tokio::test]
    async fn test_failing_publish() {
        let broker = MemoryBroker::default();
        broker.fail_publishes(true);
        assert!(matches!(
            broker.publish("t", Vec::new()).await.unwrap_err(),
            ScanError::Broker(_)
        ));
        broker.fail_publishes(false);
        assert!(broker.publish("t", Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_closes_inbound() {
        let broker = MemoryBroker::default();
        let mut incoming = broker.incoming().unwrap();
        broker.subscribe("t").await.unwrap();

        broker.disconnect().await.unwrap();

        assert!(incoming.recv().await.is_none());
        assert!(broker.publish("t", Vec::new()).await.is_err());
    }
}

//! MQTT broker connection.
//!
//! A background task drives the rumqttc event loop and forwards inbound
//! publishes to the inbound channel. Acknowledged operations are matched by
//! packet id: a request is queued before it is handed to the client, picks
//! up its packet id from the matching `Outgoing` event and is released by
//! the PUBACK or SUBACK carrying that id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layerscan_core::config::BrokerConfig;
use layerscan_core::error::{Result, ScanError};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerMessage, TakeOnce};

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Up,
    Down(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Publish,
    Subscribe,
}

/// Resolved with `true` when the broker accepted the request. Resubscribes
/// issued by the event loop carry no waiter.
type Waiter = Option<oneshot::Sender<bool>>;

/// Requests waiting for a packet id and packet ids waiting for an ack.
#[derive(Default)]
struct Pending {
    publishes: VecDeque<Waiter>,
    subscribes: VecDeque<Waiter>,
    in_flight: HashMap<(AckKind, u16), VecDeque<Waiter>>,
    /// Publishes held back because their packet id was still in flight.
    collided: HashSet<u16>,
    topics: Vec<String>,
    closed: bool,
}

impl Pending {
    fn queue(&mut self, kind: AckKind) -> &mut VecDeque<Waiter> {
        match kind {
            AckKind::Publish => &mut self.publishes,
            AckKind::Subscribe => &mut self.subscribes,
        }
    }

    /// The event loop wrote a request with this packet id.
    fn sent(&mut self, kind: AckKind, pkid: u16) {
        let key = (kind, pkid);
        let collided = kind == AckKind::Publish && self.collided.remove(&pkid);
        if !collided && self.in_flight.get(&key).is_some_and(|w| !w.is_empty()) {
            // Retransmission of an unacknowledged publish after reconnect.
            return;
        }
        let Some(waiter) = self.queue(kind).pop_front() else {
            tracing::debug!(?kind, pkid, "Outgoing packet without a queued request");
            return;
        };
        self.in_flight.entry(key).or_default().push_back(waiter);
    }

    /// The broker acknowledged this packet id.
    fn acked(&mut self, kind: AckKind, pkid: u16, accepted: bool) {
        let key = (kind, pkid);
        let Some(waiters) = self.in_flight.get_mut(&key) else {
            tracing::debug!(?kind, pkid, "Acknowledgement for unknown packet id");
            return;
        };
        let waiter = waiters.pop_front();
        if waiters.is_empty() {
            self.in_flight.remove(&key);
        }
        if let Some(Some(tx)) = waiter {
            let _ = tx.send(accepted);
        }
    }

    /// The broker started a fresh session and forgot unacknowledged
    /// subscriptions. Dropping their waiters fails the callers.
    fn forget_subscriptions(&mut self) {
        self.in_flight.retain(|(kind, _), _| *kind != AckKind::Subscribe);
    }

    /// Fail every outstanding request and refuse new ones.
    fn close(&mut self) {
        self.closed = true;
        self.publishes.clear();
        self.subscribes.clear();
        self.in_flight.clear();
        self.collided.clear();
    }
}

/// Queue a waiter and hand the request to the client while holding the
/// lock, so the queue order matches the order the event loop sees.
fn enqueue(
    pending: &Mutex<Pending>,
    kind: AckKind,
    waiter: Waiter,
    send: impl FnOnce() -> std::result::Result<(), ClientError>,
) -> std::result::Result<(), String> {
    let mut pending = pending.lock();
    if pending.closed {
        return Err("connection closed".to_string());
    }
    pending.queue(kind).push_back(waiter);
    if let Err(e) = send() {
        pending.queue(kind).pop_back();
        return Err(e.to_string());
    }
    Ok(())
}

/// Connection to an MQTT broker.
pub struct MqttBroker {
    client: AsyncClient,
    endpoint: String,
    ack_timeout: Duration,
    pending: Arc<Mutex<Pending>>,
    receiver: TakeOnce<mpsc::Receiver<BrokerMessage>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Connect and wait for the broker's CONNACK.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let endpoint = format!("{}:{}", config.host, config.port);
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        let capacity = config.channel_capacity.max(1);
        let (client, eventloop) = AsyncClient::new(options, capacity);
        let (inbound, receiver) = mpsc::channel(capacity);
        let (state_tx, mut state_rx) = watch::channel(LinkState::Connecting);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            inbound,
            state_tx,
            pending.clone(),
            cancel.clone(),
        ));

        let connected = tokio::time::timeout(
            config.ack_timeout(),
            state_rx.wait_for(|state| *state != LinkState::Connecting),
        )
        .await;

        let failure = match connected {
            Err(_) => Some(format!("no CONNACK from {} within {:?}", endpoint, config.ack_timeout())),
            Ok(Err(_)) => Some(format!("event loop for {} stopped", endpoint)),
            Ok(Ok(state)) => match &*state {
                LinkState::Down(reason) => Some(format!("{}: {}", endpoint, reason)),
                _ => None,
            },
        };
        if let Some(reason) = failure {
            cancel.cancel();
            return Err(ScanError::Broker(format!("Failed to connect to {}", reason)));
        }

        tracing::info!(endpoint = %endpoint, client_id = %config.client_id, "Connected to broker");

        Ok(Self {
            client,
            endpoint,
            ack_timeout: config.ack_timeout(),
            pending,
            receiver: TakeOnce::new(receiver),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Wait for the acknowledgement of a queued request.
    async fn await_ack(&self, acked: oneshot::Receiver<bool>, what: &str) -> Result<()> {
        let waited = tokio::time::timeout(self.ack_timeout, acked).await;
        match waited {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ScanError::Broker(format!("{} rejected by {}", what, self.endpoint))),
            Ok(Err(_)) => Err(ScanError::Broker(format!(
                "Connection to {} closed before {} was acknowledged",
                self.endpoint, what
            ))),
            Err(_) => Err(ScanError::Timeout(format!(
                "{} not acknowledged by {} within {:?}",
                what, self.endpoint, self.ack_timeout
            ))),
        }
    }
}

/// Event loop driver.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: mpsc::Sender<BrokerMessage>,
    state: watch::Sender<LinkState>,
    pending: Arc<Mutex<Pending>>,
    cancel: CancellationToken,
) {
    let mut connected_once = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if connected_once && !ack.session_present {
                    resubscribe(&client, &pending);
                }
                connected_once = true;
                let _ = state.send(LinkState::Up);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage::new(publish.topic, publish.payload.to_vec());
                if inbound.send(message).await.is_err() {
                    tracing::debug!("Inbound receiver dropped, discarding message");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                pending.lock().acked(AckKind::Publish, ack.pkid, true);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let accepted = !ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                pending.lock().acked(AckKind::Subscribe, ack.pkid, accepted);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("Broker sent DISCONNECT");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => {
                pending.lock().sent(AckKind::Publish, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                pending.lock().sent(AckKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::AwaitAck(pkid))) => {
                pending.lock().collided.insert(pkid);
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                if !connected_once {
                    let _ = state.send(LinkState::Down(reason));
                    break;
                }
                tracing::warn!(error = %reason, "Broker connection lost, reconnecting");
                let _ = state.send(LinkState::Down(reason));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    pending.lock().close();
    tracing::debug!("Broker event loop stopped");
}

/// Subscribe again to every confirmed topic after a fresh session.
fn resubscribe(client: &AsyncClient, pending: &Mutex<Pending>) {
    pending.lock().forget_subscriptions();
    let topics = pending.lock().topics.clone();
    for topic in topics {
        let sent = enqueue(pending, AckKind::Subscribe, None, || {
            client.try_subscribe(topic.clone(), QoS::AtLeastOnce)
        });
        match sent {
            Ok(()) => tracing::debug!(topic = %topic, "Resubscribing"),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "Resubscribe failed"),
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        enqueue(&self.pending, AckKind::Subscribe, Some(tx), || {
            self.client.try_subscribe(topic, QoS::AtLeastOnce)
        })
        .map_err(|e| ScanError::Broker(format!("Subscribe to {} failed: {}", topic, e)))?;
        self.await_ack(rx, &format!("subscription to {}", topic)).await?;

        self.pending.lock().topics.push(topic.to_string());
        tracing::debug!(topic, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        enqueue(&self.pending, AckKind::Publish, Some(tx), || {
            self.client.try_publish(topic, QoS::AtLeastOnce, false, payload)
        })
        .map_err(|e| ScanError::Broker(format!("Publish to {} failed: {}", topic, e)))?;
        self.await_ack(rx, &format!("publish to {}", topic)).await?;

        tracing::debug!(topic, "Published");
        Ok(())
    }

    fn incoming(&self) -> Result<mpsc::Receiver<BrokerMessage>> {
        self.receiver.take()
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request not sent");
        }
        // Let the event loop flush the DISCONNECT before stopping it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(self.ack_timeout, task).await;
        }
        tracing::info!(endpoint = %self.endpoint, "Disconnected from broker");
        Ok(())
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

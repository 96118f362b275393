//! Scan correlation over a shared broker connection.
//!
//! One listener task consumes every inbound message and routes it by
//! `scan_id` to the session registered by [`ScanCorrelator::start_scan`].
//! Each session is drained by exactly one [`ScanCorrelator::stream_results`]
//! stream, which ends once the scanner reported `finished` and every result
//! received before that has been yielded.
//!
//! ```text
//! REGISTERED ──result──▶ REGISTERED ──finished──▶ COMPLETED ──drain──▶ (removed)
//! ```

mod session;

use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use layerscan_core::config::CorrelatorConfig;
use layerscan_core::error::{Result, ScanError};
use layerscan_core::message::{ResultMessage, ScanStartMessage, ScanStatusMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Broker, BrokerMessage};

use session::{Ready, ScanSession};

/// Stream of results for one scan.
pub type ResultStream = Pin<Box<dyn Stream<Item = Result<ResultMessage>> + Send>>;

/// State shared by the correlator, its listener and the result streams.
struct Inner {
    broker: Arc<dyn Broker>,
    config: CorrelatorConfig,
    sessions: DashMap<String, Arc<ScanSession>>,
    /// Number of registered sessions.
    active: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl Inner {
    fn register(&self, session: Arc<ScanSession>) {
        self.sessions.insert(session.scan_id().to_string(), session);
        self.active.send_modify(|n| *n += 1);
    }

    fn retire(&self, scan_id: &str) {
        if self.sessions.remove(scan_id).is_some() {
            self.active.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    fn session(&self, scan_id: &str) -> Option<Arc<ScanSession>> {
        self.sessions.get(scan_id).map(|entry| entry.value().clone())
    }

    fn dispatch(&self, message: BrokerMessage) {
        if message.topic == ResultMessage::TOPIC {
            let result = match ResultMessage::load(&message.payload) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(topic = %message.topic, error = %e, "Skipping undecodable result");
                    return;
                }
            };
            match self.session(&result.scan_id) {
                Some(session) => session.push(result),
                None => tracing::debug!(scan_id = %result.scan_id, "Result for unknown scan"),
            }
        } else if message.topic == ScanStatusMessage::TOPIC {
            let status = match ScanStatusMessage::load(&message.payload) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(topic = %message.topic, error = %e, "Skipping undecodable status");
                    return;
                }
            };
            let Some(session) = self.session(&status.scan_id) else {
                tracing::debug!(scan_id = %status.scan_id, status = %status.status, "Status for unknown scan");
                return;
            };
            if status.status.is_terminal() {
                tracing::info!(scan_id = %status.scan_id, "Scan finished");
                session.complete();
            } else {
                tracing::debug!(scan_id = %status.scan_id, status = %status.status, "Scan status");
            }
        } else {
            tracing::debug!(topic = %message.topic, "Ignoring message on unexpected topic");
        }
    }

    /// Drop every registration.
    fn clear(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for scan_id in ids {
            self.retire(&scan_id);
        }
    }
}

/// Listener loop: route inbound messages until cancelled or the broker goes away.
async fn listen(inner: Arc<Inner>, mut incoming: mpsc::Receiver<BrokerMessage>) {
    loop {
        let message = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            message = incoming.recv() => message,
        };

        match message {
            Some(message) => inner.dispatch(message),
            None => {
                tracing::warn!("Broker inbound channel closed, stopping correlation");
                inner.cancel.cancel();
                break;
            }
        }
    }

    inner.clear();
    tracing::debug!("Correlation listener stopped");
}

/// What woke a waiting result stream.
enum Wake {
    Result(ResultMessage),
    Progress,
    Cancelled,
    Idle,
}

/// Multiplexes one broker connection into per-scan result streams.
pub struct ScanCorrelator {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ScanCorrelator {
    /// Subscribe to the result and status topics and start listening.
    pub async fn connect(broker: Arc<dyn Broker>, config: CorrelatorConfig) -> Result<Self> {
        broker.subscribe(ResultMessage::TOPIC).await?;
        broker.subscribe(ScanStatusMessage::TOPIC).await?;
        let incoming = broker.incoming()?;

        let (active, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            broker,
            config,
            sessions: DashMap::new(),
            active,
            cancel: CancellationToken::new(),
        });

        let listener = tokio::spawn(listen(inner.clone(), incoming));
        tracing::debug!("Correlation listener started");

        Ok(Self {
            inner,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Number of scans registered and not yet drained.
    pub fn active_scans(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Register a new scan and publish its start request.
    ///
    /// The session exists before the request leaves, so results can never
    /// arrive for an unregistered scan. A failed publish unregisters it.
    pub async fn start_scan(
        &self,
        host_name: &str,
        os_release: &str,
        packages: Vec<String>,
    ) -> Result<String> {
        if self.inner.cancel.is_cancelled() {
            return Err(ScanError::Cancelled("Correlator is shut down".to_string()));
        }

        let scan_id = Uuid::new_v4().to_string();
        self.inner.register(Arc::new(ScanSession::new(scan_id.clone())));

        let package_count = packages.len();
        let message = ScanStartMessage::new(scan_id.clone(), "", host_name, os_release, packages);
        let published = match message.dump() {
            Ok(payload) => self.inner.broker.publish(ScanStartMessage::TOPIC, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.inner.retire(&scan_id);
            return Err(e);
        }

        tracing::info!(
            scan_id = %scan_id,
            host_name,
            os_release,
            packages = package_count,
            "Scan started"
        );
        Ok(scan_id)
    }

    /// Stream the results of a scan until it finishes.
    ///
    /// Can be called once per scan; later calls fail with
    /// [`ScanError::UnknownScan`]. The stream fails with
    /// [`ScanError::CorrelationStall`] when nothing arrives for the
    /// configured scan timeout, and with [`ScanError::Cancelled`] when the
    /// correlator is cancelled.
    pub fn stream_results(&self, scan_id: &str) -> Result<ResultStream> {
        let unknown = || ScanError::UnknownScan(scan_id.to_string());
        let session = self.inner.session(scan_id).ok_or_else(unknown)?;
        let mut receiver = session.take_receiver().ok_or_else(unknown)?;
        drop(session);

        let inner = self.inner.clone();
        let scan_id = scan_id.to_string();
        let idle = inner.config.scan_timeout();

        Ok(Box::pin(async_stream::stream! {
            loop {
                if inner.cancel.is_cancelled() {
                    yield Err(ScanError::Cancelled(format!("Scan {} was cancelled", scan_id)));
                    break;
                }

                match receiver.poll_ready() {
                    Ready::Result(result) => {
                        yield Ok(result);
                        continue;
                    }
                    Ready::Drained => {
                        tracing::debug!(scan_id = %scan_id, "Scan drained");
                        break;
                    }
                    Ready::Pending => {}
                }

                let wake = tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => Wake::Cancelled,
                    result = receiver.results.recv() => match result {
                        Some(result) => Wake::Result(result),
                        None => Wake::Cancelled,
                    },
                    changed = receiver.completed.changed() => match changed {
                        Ok(()) => Wake::Progress,
                        Err(_) => Wake::Cancelled,
                    },
                    _ = tokio::time::sleep(idle) => Wake::Idle,
                };

                match wake {
                    Wake::Result(result) => {
                        yield Ok(result);
                    }
                    Wake::Progress => {}
                    Wake::Cancelled => {
                        yield Err(ScanError::Cancelled(format!("Scan {} was cancelled", scan_id)));
                        break;
                    }
                    Wake::Idle => {
                        tracing::warn!(scan_id = %scan_id, waited = ?idle, "Scan stalled");
                        yield Err(ScanError::CorrelationStall {
                            scan_id: scan_id.clone(),
                            waited: idle,
                        });
                        break;
                    }
                }
            }

            inner.retire(&scan_id);
        }))
    }

    /// Stop listening. Outstanding streams end with [`ScanError::Cancelled`].
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::info!(pending = self.inner.sessions.len(), "Cancelling correlation");
        }
        self.inner.cancel.cancel();
        self.inner.clear();
    }

    /// Wait for every scan to drain, then stop listening and disconnect.
    ///
    /// Scans still pending after the drain timeout are reported as a
    /// [`ScanError::CorrelationStall`] once everything is released.
    pub async fn shutdown(&self) -> Result<()> {
        let drain = self.inner.config.drain_timeout();
        let mut active = self.inner.active.subscribe();
        let drained = tokio::time::timeout(drain, active.wait_for(|n| *n == 0))
            .await
            .is_ok();

        let pending: Vec<String> = if drained {
            Vec::new()
        } else {
            self.inner.sessions.iter().map(|entry| entry.key().clone()).collect()
        };

        self.cancel();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "Correlation listener panicked");
            }
        }
        let disconnected = self.inner.broker.disconnect().await;

        if !pending.is_empty() {
            return Err(ScanError::CorrelationStall {
                scan_id: pending.join(", "),
                waited: drain,
            });
        }
        disconnected
    }
}

impl Drop for ScanCorrelator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

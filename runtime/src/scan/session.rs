//! Per-scan result queue.

use layerscan_core::message::ResultMessage;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Consumer half of a session, handed out once.
pub(crate) struct SessionReceiver {
    pub(crate) results: mpsc::UnboundedReceiver<ResultMessage>,
    pub(crate) completed: watch::Receiver<bool>,
}

/// What the consumer can act on without waiting.
#[derive(Debug)]
pub(crate) enum Ready {
    Result(ResultMessage),
    Drained,
    Pending,
}

impl SessionReceiver {
    /// Next queued result, or [`Ready::Drained`] once the scan completed
    /// and nothing is left.
    ///
    /// Completion is read before the queue. Results are pushed before the
    /// scan completes, so an empty queue seen after completion is final.
    pub(crate) fn poll_ready(&mut self) -> Ready {
        let completed = *self.completed.borrow();
        match self.results.try_recv() {
            Ok(result) => Ready::Result(result),
            Err(_) if completed => Ready::Drained,
            Err(_) => Ready::Pending,
        }
    }
}

/// One registered scan.
///
/// The listener pushes results and marks completion; the consumer takes
/// the receiver and drains it. Completion never goes back to `false`.
pub(crate) struct ScanSession {
    scan_id: String,
    results: mpsc::UnboundedSender<ResultMessage>,
    completed: watch::Sender<bool>,
    receiver: Mutex<Option<SessionReceiver>>,
}

impl ScanSession {
    pub(crate) fn new(scan_id: impl Into<String>) -> Self {
        let (results, results_rx) = mpsc::unbounded_channel();
        let (completed, completed_rx) = watch::channel(false);
        Self {
            scan_id: scan_id.into(),
            results,
            completed,
            receiver: Mutex::new(Some(SessionReceiver {
                results: results_rx,
                completed: completed_rx,
            })),
        }
    }

    pub(crate) fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Queue a result for the consumer.
    pub(crate) fn push(&self, result: ResultMessage) {
        if self.results.send(result).is_err() {
            tracing::debug!(scan_id = %self.scan_id, "Result consumer is gone");
        }
    }

    /// Mark the scan as finished on the scanner side.
    pub(crate) fn complete(&self) {
        self.completed.send_replace(true);
    }

    /// Take the consumer half. `None` once taken.
    pub(crate) fn take_receiver(&self) -> Option<SessionReceiver> {
        self.receiver.lock().take()
    }
}

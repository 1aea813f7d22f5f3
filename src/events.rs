//! Lifecycle notifications.
//!
//! Every subscriber gets its own unbounded channel. Publishing holds the
//! subscriber list lock while sending, so all subscribers observe one global
//! order and, in particular, each download's events in the order raised.
//!
//! Worker events go through [`EventBus::publish_if_live`]; stopping a worker
//! goes through [`EventBus::cancel_and_publish`]. Both take the same lock, so
//! no event from a worker can follow its `Cancelled`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::download::ErrorKind;
use crate::registry::{DownloadId, DownloadRecord, Progress};

/// A lifecycle notification for one download.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Record created by `download`.
    Added(DownloadRecord),
    /// Worker connected; `total_size` is 0 when unknown.
    Started {
        /// Record snapshot.
        record: DownloadRecord,
        /// Resource size.
        total_size: u64,
    },
    /// Throttled byte progress.
    Progress {
        /// Download identity.
        id: DownloadId,
        /// Bytes written and expected.
        progress: Progress,
    },
    /// Transfer finished.
    Completed(DownloadRecord),
    /// Worker failed.
    Error {
        /// Record snapshot.
        record: DownloadRecord,
        /// Classified failure.
        kind: ErrorKind,
        /// Diagnostic text.
        message: String,
    },
    /// Worker stopped on request.
    Cancelled(DownloadRecord),
    /// `pause` completed.
    Stopped(DownloadRecord),
    /// `resume` accepted.
    Resumed(DownloadRecord),
    /// `remove` completed.
    Removed(DownloadRecord),
    /// `open_file` could not hand the file to a viewer.
    OpenFailed {
        /// Download identity.
        id: DownloadId,
        /// Classified failure.
        kind: ErrorKind,
        /// Diagnostic text.
        message: String,
    },
}

impl DownloadEvent {
    /// Identity the event belongs to.
    #[must_use]
    pub fn id(&self) -> DownloadId {
        match self {
            Self::Added(record)
            | Self::Started { record, .. }
            | Self::Completed(record)
            | Self::Error { record, .. }
            | Self::Cancelled(record)
            | Self::Stopped(record)
            | Self::Resumed(record)
            | Self::Removed(record) => record.id,
            Self::Progress { id, .. } | Self::OpenFailed { id, .. } => *id,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Completed(_) => "completed",
            Self::Error { .. } => "error",
            Self::Cancelled(_) => "cancelled",
            Self::Stopped(_) => "stopped",
            Self::Resumed(_) => "resumed",
            Self::Removed(_) => "removed",
            Self::OpenFailed { .. } => "open_failed",
        }
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: UnboundedReceiver<DownloadEvent>,
}

impl EventSubscription {
    /// Waits for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Publish/subscribe hub for [`DownloadEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<DownloadEvent>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. It sees events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push(sender);
        EventSubscription { receiver }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|sender| !sender.is_closed());
        subscribers.len()
    }

    /// Delivers `event` to every subscriber, dropping closed ones.
    pub fn publish(&self, event: DownloadEvent) {
        let mut subscribers = self.lock();
        Self::send_locked(&mut subscribers, event);
    }

    /// Delivers `event` only if `token` has not been cancelled.
    ///
    /// Returns whether it was delivered.
    pub(crate) fn publish_if_live(&self, token: &CancellationToken, event: DownloadEvent) -> bool {
        let mut subscribers = self.lock();
        if token.is_cancelled() {
            return false;
        }
        Self::send_locked(&mut subscribers, event);
        true
    }

    /// Cancels `token` and delivers `event` as one step.
    pub(crate) fn cancel_and_publish(&self, token: &CancellationToken, event: DownloadEvent) {
        let mut subscribers = self.lock();
        token.cancel();
        Self::send_locked(&mut subscribers, event);
    }

    fn send_locked(subscribers: &mut Vec<UnboundedSender<DownloadEvent>>, event: DownloadEvent) {
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UnboundedSender<DownloadEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

//! Maps each download identity to at most one live worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::worker::{StartMode, WorkerContext, WorkerOutcome, run_worker, until_cancelled};
use crate::events::DownloadEvent;
use crate::registry::{DownloadId, DownloadRecord};

/// Observable state of a scheduled worker.
///
/// Terminal states release the map entry, so only these two are ever seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, waiting for the previous worker of the identity to unwind.
    Created,
    /// Transferring.
    Running,
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;

#[derive(Debug, Clone)]
struct WorkerHandle {
    generation: u64,
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

/// Spawns, replaces and stops download workers.
///
/// Starting a worker for an identity cancels the previous one without
/// waiting; the new task then waits on a per-identity run lock, so two
/// workers never touch the same file at once.
pub struct TaskScheduler {
    workers: Arc<DashMap<DownloadId, WorkerHandle>>,
    run_locks: DashMap<DownloadId, Arc<Mutex<()>>>,
    context: Arc<WorkerContext>,
    generation: AtomicU64,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("active", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    pub(crate) fn new(context: Arc<WorkerContext>) -> Self {
        Self {
            workers: Arc::new(DashMap::new()),
            run_locks: DashMap::new(),
            context,
            generation: AtomicU64::new(0),
        }
    }

    /// Starts a worker that writes to a newly created, uniquely named file.
    pub fn start_fresh(&self, record: DownloadRecord) {
        self.spawn_worker(record, StartMode::CreateNew);
    }

    /// Starts a worker that continues the existing file from its current length.
    pub fn start_resume(&self, record: DownloadRecord) {
        self.spawn_worker(record, StartMode::ReuseExisting);
    }

    /// Cancels the worker for `record`, if any, and publishes `Cancelled`.
    ///
    /// Returns immediately; the worker unwinds on its own.
    #[instrument(skip(self, record), fields(id = record.id))]
    pub fn stop(&self, record: &DownloadRecord) {
        let event = DownloadEvent::Cancelled(record.clone());
        match self.workers.remove(&record.id) {
            Some((_, handle)) => {
                debug!(generation = handle.generation, "cancelling worker");
                self.context.events.cancel_and_publish(&handle.token, event);
            }
            None => self.context.events.publish(event),
        }
    }

    /// Forgets per-identity bookkeeping once a record is deleted.
    pub fn release(&self, id: DownloadId) {
        if !self.workers.contains_key(&id) {
            self.run_locks.remove(&id);
        }
    }

    /// Cancels every worker without publishing events.
    pub fn shutdown(&self) {
        let ids: Vec<DownloadId> = self.workers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.workers.remove(&id) {
                handle.token.cancel();
            }
        }
    }

    /// True while a worker is scheduled for `id`.
    #[must_use]
    pub fn is_active(&self, id: DownloadId) -> bool {
        self.workers.contains_key(&id)
    }

    /// Number of scheduled workers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    /// State of the worker scheduled for `id`.
    #[must_use]
    pub fn worker_state(&self, id: DownloadId) -> Option<WorkerState> {
        self.workers
            .get(&id)
            .map(|handle| match handle.state.load(Ordering::Acquire) {
                STATE_CREATED => WorkerState::Created,
                _ => WorkerState::Running,
            })
    }

    fn spawn_worker(&self, record: DownloadRecord, mode: StartMode) {
        let id = record.id;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(STATE_CREATED));

        let previous = self.workers.insert(
            id,
            WorkerHandle {
                generation,
                token: token.clone(),
                state: Arc::clone(&state),
            },
        );
        if let Some(previous) = previous {
            debug!(id, generation = previous.generation, "replacing worker");
            previous.token.cancel();
        }

        let run_lock = Arc::clone(self.run_locks.entry(id).or_default().value());
        let workers = Arc::clone(&self.workers);
        let context = Arc::clone(&self.context);

        tokio::spawn(async move {
            let outcome = match until_cancelled(&token, run_lock.lock_owned()).await {
                Ok(_running) => {
                    state.store(STATE_RUNNING, Ordering::Release);
                    run_worker(&context, record, mode, &token).await
                }
                Err(_) => WorkerOutcome::Cancelled,
            };
            workers.remove_if(&id, |_, handle| handle.generation == generation);
            debug!(id, generation, ?outcome, "worker finished");
        });
    }
}

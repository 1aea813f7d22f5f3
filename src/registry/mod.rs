//! Persisted catalogue of download records.
//!
//! The registry owns identity allocation and every status/progress mutation.
//! Records are cached per key in a [`DashMap`]; each entry carries its own
//! async lock so a write and its persistence happen as one step without
//! contending with unrelated downloads.
//!
//! # Overview
//!
//! - [`DownloadRegistry`] - cache + store + allocator
//! - [`DownloadRecord`], [`DownloadStatus`], [`Progress`] - record types
//! - [`RecordStore`] / [`SqliteRecordStore`] - persistence seam
//! - [`RegistryError`] - persistence failures

mod allocator;
mod error;
mod record;
mod store;

pub use error::RegistryError;
pub use record::{ContentHandle, DownloadId, DownloadRecord, DownloadStatus, Progress};
pub use store::{RecordStore, Result, SqliteRecordStore};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use allocator::IdAllocator;

/// Cached record plus a tombstone so writes racing a removal never resurrect the row.
#[derive(Debug)]
struct RecordSlot {
    record: DownloadRecord,
    removed: bool,
}

type SharedSlot = Arc<Mutex<RecordSlot>>;

/// Authoritative, persisted catalogue of download records.
pub struct DownloadRegistry {
    records: DashMap<DownloadId, SharedSlot>,
    store: Arc<dyn RecordStore>,
    allocator: IdAllocator,
}

impl std::fmt::Debug for DownloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRegistry")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl DownloadRegistry {
    /// Loads every persisted record and reconciles the id allocator.
    ///
    /// Records persisted as `Pending` or `Downloading` are demoted to `Paused`
    /// (and the demotion is written back), since no worker outlives a restart.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read or written.
    #[instrument(skip(store))]
    pub async fn restore(store: Arc<dyn RecordStore>) -> Result<Self> {
        let persisted = store.load_records().await?;
        let records = DashMap::with_capacity(persisted.len());
        let mut max_id: DownloadId = 0;
        let mut demoted = 0usize;

        for mut record in persisted {
            let restored = record.status.restored();
            if restored != record.status {
                debug!(id = record.id, from = %record.status, "demoting stale status to paused");
                record.set_status(restored);
                store.upsert_record(&record).await?;
                demoted += 1;
            }
            max_id = max_id.max(record.id);
            records.insert(
                record.id,
                Arc::new(Mutex::new(RecordSlot {
                    record,
                    removed: false,
                })),
            );
        }

        let allocator = IdAllocator::restore(Arc::clone(&store), max_id).await?;
        info!(
            records = records.len(),
            demoted,
            last_id = allocator.last_id().await,
            "download registry restored"
        );

        Ok(Self {
            records,
            store,
            allocator,
        })
    }

    /// Allocates an id and persists a new `Pending` record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the id counter or the row cannot be persisted.
    #[instrument(skip(self, mime_type))]
    pub async fn add_record(
        &self,
        url: &str,
        directory: &str,
        file_name: &str,
        mime_type: &str,
    ) -> Result<DownloadRecord> {
        let id = self.allocator.next_id().await?;
        let record = DownloadRecord::new(id, url, directory, file_name, mime_type);
        self.store.upsert_record(&record).await?;
        self.records.insert(
            id,
            Arc::new(Mutex::new(RecordSlot {
                record: record.clone(),
                removed: false,
            })),
        );
        debug!(id, "download record added");
        Ok(record)
    }

    /// Returns a snapshot of the record, if present.
    pub async fn find_record(&self, id: DownloadId) -> Option<DownloadRecord> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        (!slot.removed).then(|| slot.record.clone())
    }

    /// Sets the status, persisting it. Moving to `Downloaded` clears progress.
    ///
    /// Returns `None` when the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if persistence fails; the cache is left unchanged.
    pub async fn update_status(
        &self,
        id: DownloadId,
        status: DownloadStatus,
    ) -> Result<Option<DownloadRecord>> {
        self.mutate(id, None, |record| record.set_status(status))
            .await
    }

    /// Like [`update_status`](Self::update_status), but only while `token` is live.
    ///
    /// The check and the write happen under the record's lock, so a worker whose
    /// token was cancelled can never overwrite the status set by the canceller.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if persistence fails.
    pub async fn update_status_if_live(
        &self,
        id: DownloadId,
        status: DownloadStatus,
        token: &CancellationToken,
    ) -> Result<Option<DownloadRecord>> {
        self.mutate(id, Some(token), |record| record.set_status(status))
            .await
    }

    /// Merges progress into the cached record. Not persisted on its own; the
    /// latest value is written along with the next status change.
    pub async fn update_progress(
        &self,
        id: DownloadId,
        downloaded_bytes: u64,
        total_bytes: u64,
    ) -> Option<Progress> {
        self.merge_progress(id, Progress::new(downloaded_bytes, total_bytes), None)
            .await
    }

    /// Like [`update_progress`](Self::update_progress), but only while `token`
    /// is live, so a cancelled worker cannot move the progress a pause froze.
    pub async fn update_progress_if_live(
        &self,
        id: DownloadId,
        downloaded_bytes: u64,
        total_bytes: u64,
        token: &CancellationToken,
    ) -> Option<Progress> {
        self.merge_progress(
            id,
            Progress::new(downloaded_bytes, total_bytes),
            Some(token),
        )
        .await
    }

    /// Records where the worker's bytes actually go.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if persistence fails.
    pub async fn set_destination(
        &self,
        id: DownloadId,
        file_name: &str,
        content_handle: ContentHandle,
    ) -> Result<Option<DownloadRecord>> {
        self.mutate(id, None, |record| {
            record.file_name = file_name.to_string();
            record.content_handle = Some(content_handle);
        })
        .await
    }

    /// Deletes the record from cache and store. Idempotent.
    ///
    /// Returns the removed record, or `None` if it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the row cannot be deleted; the record stays cached.
    #[instrument(skip(self))]
    pub async fn remove_record(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        let mut guard = slot.lock().await;
        if guard.removed {
            return Ok(None);
        }
        self.store.delete_record(id).await?;
        guard.removed = true;
        let removed = guard.record.clone();
        drop(guard);

        self.records
            .remove_if(&id, |_, cached| Arc::ptr_eq(cached, &slot));
        debug!(id, "download record removed");
        Ok(Some(removed))
    }

    /// Snapshot of every record. Mutating it does not affect the registry.
    pub async fn get_all(&self) -> HashMap<DownloadId, DownloadRecord> {
        let slots: Vec<SharedSlot> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshot = HashMap::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.lock().await;
            if !slot.removed {
                snapshot.insert(slot.record.id, slot.record.clone());
            }
        }
        snapshot
    }

    /// Number of cached records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Last id handed out by the allocator.
    pub async fn last_allocated_id(&self) -> DownloadId {
        self.allocator.last_id().await
    }

    fn slot(&self, id: DownloadId) -> Option<SharedSlot> {
        self.records.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    async fn merge_progress(
        &self,
        id: DownloadId,
        progress: Progress,
        token: Option<&CancellationToken>,
    ) -> Option<Progress> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        if slot.removed || token.is_some_and(CancellationToken::is_cancelled) {
            return None;
        }
        slot.record.progress = progress;
        Some(progress)
    }

    /// Applies `change` to a copy, persists it, then commits it to the cache.
    async fn mutate<F>(
        &self,
        id: DownloadId,
        token: Option<&CancellationToken>,
        change: F,
    ) -> Result<Option<DownloadRecord>>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        let mut slot = slot.lock().await;
        if slot.removed || token.is_some_and(CancellationToken::is_cancelled) {
            return Ok(None);
        }

        let mut updated = slot.record.clone();
        change(&mut updated);
        self.store.upsert_record(&updated).await?;
        slot.record = updated.clone();
        Ok(Some(updated))
    }
}

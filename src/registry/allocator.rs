//! Persisted, monotonically increasing download id allocator.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::error::RegistryError;
use super::record::DownloadId;
use super::store::{RecordStore, Result};

/// Hands out ids strictly greater than any id ever handed out before.
///
/// Each increment is persisted before the id is returned, under a lock
/// dedicated to allocation.
pub(crate) struct IdAllocator {
    last_id: Mutex<DownloadId>,
    store: Arc<dyn RecordStore>,
}

impl IdAllocator {
    /// Loads the persisted counter, reconciling it with the highest live id.
    ///
    /// A missing counter is rebuilt as `max(existing ids, 0)` and written back.
    pub(crate) async fn restore(
        store: Arc<dyn RecordStore>,
        max_existing_id: DownloadId,
    ) -> Result<Self> {
        let floor = max_existing_id.max(0);
        let last_id = match store.load_last_id().await? {
            Some(persisted) if persisted >= floor => persisted,
            persisted => {
                debug!(?persisted, floor, "rebuilding download id counter");
                store.save_last_id(floor).await?;
                floor
            }
        };
        Ok(Self {
            last_id: Mutex::new(last_id),
            store,
        })
    }

    /// Allocates the next id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdsExhausted`] once the counter reaches
    /// `i64::MAX`; the counter is left untouched.
    #[instrument(skip(self))]
    pub(crate) async fn next_id(&self) -> Result<DownloadId> {
        let mut last_id = self.last_id.lock().await;
        let next = last_id
            .checked_add(1)
            .ok_or(RegistryError::IdsExhausted { last_id: *last_id })?;
        self.store.save_last_id(next).await?;
        *last_id = next;
        Ok(next)
    }

    /// Last id handed out (0 when none).
    pub(crate) async fn last_id(&self) -> DownloadId {
        *self.last_id.lock().await
    }
}

//! Public facade composing the registry, scheduler and event bus.
//!
//! A [`DownloadManager`] is constructed empty, subscribed to, then
//! initialized exactly once with an [`EngineConfig`]. Every other operation
//! fails with [`EngineError::NotInitialized`] until then.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use download_manager::{DownloadManager, EngineConfig, LocalStorageGateway};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(LocalStorageGateway::new(vec![PathBuf::from("/srv/downloads")]));
//! let manager = DownloadManager::new();
//! let mut events = manager.subscribe();
//! manager.initialize(EngineConfig::new(storage)).await?;
//!
//! let id = manager
//!     .download("https://example.com/paper.pdf", "/srv/downloads/papers", "paper.pdf", "application/pdf")
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     println!("{id}: {}", event.name());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{ConfigError, EngineConfig};
use crate::db::{Database, DbError};
use crate::download::{
    DownloadError, ErrorKind, StorageLocks, TaskScheduler, TransferClient, WorkerContext,
    resolve_destination,
};
use crate::events::{DownloadEvent, EventBus, EventSubscription};
use crate::registry::{
    DownloadId, DownloadRecord, DownloadRegistry, DownloadStatus, RegistryError,
    SqliteRecordStore,
};
use crate::storage::{FileOpener, StorageError};

/// Errors returned by facade operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation ran before [`DownloadManager::initialize`].
    #[error("download manager is not initialized")]
    NotInitialized,

    /// [`DownloadManager::initialize`] was called twice.
    #[error("download manager is already initialized")]
    AlreadyInitialized,

    /// The download URL does not parse.
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },

    /// A request argument is unusable.
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument {
        /// Argument name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Settings failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry read or write failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The database could not be opened.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl EngineError {
    /// Classifies the error with the same kinds download workers report.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::InvalidUrl { .. }
            | Self::InvalidArgument { .. }
            | Self::Config(_) => ErrorKind::InvalidConfiguration,
            Self::Registry(_) | Self::Database(_) | Self::Client(_) => ErrorKind::Unknown,
        }
    }
}

struct EngineState {
    database: Database,
    registry: Arc<DownloadRegistry>,
    context: Arc<WorkerContext>,
    scheduler: TaskScheduler,
    file_opener: Option<Arc<dyn FileOpener>>,
}

/// Resumable download engine.
///
/// Cheap to share behind an [`Arc`]; all operations take `&self`.
pub struct DownloadManager {
    events: EventBus,
    state: OnceLock<EngineState>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("initialized", &self.state.get().is_some())
            .field("subscribers", &self.events.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadManager {
    /// Creates an uninitialized manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: EventBus::new(),
            state: OnceLock::new(),
        }
    }

    /// Subscribes to lifecycle events. Allowed before initialization.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// The bus events are published on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Opens the database, restores persisted records and builds the workers' context.
    ///
    /// Restored records that were `Pending` or `Downloading` come back `Paused`;
    /// nothing is restarted automatically.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyInitialized`] on a second call
    /// - [`EngineError::Config`] when the settings are out of range
    /// - [`EngineError::Database`] / [`EngineError::Registry`] when restoring fails
    /// - [`EngineError::Client`] when the HTTP client cannot be built
    #[instrument(skip(self, config))]
    pub async fn initialize(&self, config: EngineConfig) -> Result<(), EngineError> {
        if self.state.get().is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        let EngineConfig {
            settings,
            storage,
            file_opener,
        } = config;
        settings.validate()?;

        let database = match &settings.database_path {
            Some(path) => Database::new_with_options(path, settings.database_options()).await?,
            None => Database::new_in_memory().await?,
        };
        let store = Arc::new(SqliteRecordStore::new(database.clone()));
        let registry = Arc::new(DownloadRegistry::restore(store).await?);
        let client = TransferClient::with_options(&settings.transfer_options())?;

        let context = Arc::new(WorkerContext {
            registry: Arc::clone(&registry),
            storage,
            client,
            events: self.events.clone(),
            locks: StorageLocks::default(),
            stream: settings.stream_options(),
        });
        let scheduler = TaskScheduler::new(Arc::clone(&context));

        let state = EngineState {
            database,
            registry,
            context,
            scheduler,
            file_opener,
        };
        if let Err(lost) = self.state.set(state) {
            lost.database.close().await;
            return Err(EngineError::AlreadyInitialized);
        }

        info!(
            persistent = settings.database_path.is_some(),
            "download manager initialized"
        );
        Ok(())
    }

    /// Creates a `Pending` record and starts a worker writing to a new file.
    ///
    /// Returns the record's id. An `Added` event precedes every worker event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`], [`EngineError::InvalidUrl`],
    /// [`EngineError::InvalidArgument`] for a blank file name, or
    /// [`EngineError::Registry`] when the record cannot be persisted.
    #[instrument(skip(self, location, mime_type))]
    pub async fn download(
        &self,
        url: &str,
        location: &str,
        file_name: &str,
        mime_type: &str,
    ) -> Result<DownloadId, EngineError> {
        let state = self.state()?;
        Url::parse(url).map_err(|source| EngineError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if file_name.trim().is_empty() {
            return Err(EngineError::InvalidArgument {
                field: "file_name",
                reason: "must not be blank",
            });
        }

        let record = state
            .registry
            .add_record(url, location, file_name, mime_type)
            .await?;
        let id = record.id;
        self.events.publish(DownloadEvent::Added(record.clone()));
        state.scheduler.start_fresh(record);
        Ok(id)
    }

    /// Stops the worker and marks the record `Paused`. Unknown ids are ignored.
    ///
    /// Emits `Cancelled` then `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] or [`EngineError::Registry`].
    #[instrument(skip(self))]
    pub async fn pause(&self, id: DownloadId) -> Result<(), EngineError> {
        let state = self.state()?;
        let Some(record) = state.registry.find_record(id).await else {
            debug!("pause of unknown download ignored");
            return Ok(());
        };

        state.scheduler.stop(&record);
        if let Some(paused) = state
            .registry
            .update_status(id, DownloadStatus::Paused)
            .await?
        {
            self.events.publish(DownloadEvent::Stopped(paused));
        }
        Ok(())
    }

    /// Marks the record `Pending` and starts a worker continuing the existing file.
    /// Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] or [`EngineError::Registry`].
    #[instrument(skip(self))]
    pub async fn resume(&self, id: DownloadId) -> Result<(), EngineError> {
        let state = self.state()?;
        let Some(pending) = state
            .registry
            .update_status(id, DownloadStatus::Pending)
            .await?
        else {
            debug!("resume of unknown download ignored");
            return Ok(());
        };

        self.events.publish(DownloadEvent::Resumed(pending.clone()));
        state.scheduler.start_resume(pending);
        Ok(())
    }

    /// Stops any worker and deletes the record. The file on disk is kept.
    /// Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] or [`EngineError::Registry`];
    /// on a registry failure the worker is already stopped but the record remains.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: DownloadId) -> Result<(), EngineError> {
        let state = self.state()?;
        let Some(record) = state.registry.find_record(id).await else {
            debug!("remove of unknown download ignored");
            return Ok(());
        };

        state.scheduler.stop(&record);
        if let Some(removed) = state.registry.remove_record(id).await? {
            state.scheduler.release(id);
            self.events.publish(DownloadEvent::Removed(removed));
        }
        Ok(())
    }

    /// Snapshot of every record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`].
    pub async fn get_all(&self) -> Result<HashMap<DownloadId, DownloadRecord>, EngineError> {
        Ok(self.state()?.registry.get_all().await)
    }

    /// Snapshot of one record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`].
    pub async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>, EngineError> {
        Ok(self.state()?.registry.find_record(id).await)
    }

    /// Hands the record's file to the configured [`FileOpener`] in the background.
    ///
    /// Failures are reported as an `OpenFailed` event, never as a download `Error`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`].
    pub fn open_file(&self, id: DownloadId) -> Result<(), EngineError> {
        let state = self.state()?;
        let registry = Arc::clone(&state.registry);
        let context = Arc::clone(&state.context);
        let opener = state.file_opener.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            if let Err(error) = open_record_file(&registry, &context, opener.as_deref(), id).await
            {
                let kind = error.kind();
                warn!(id, kind = %kind, error = %error, "open file failed");
                events.publish(DownloadEvent::OpenFailed {
                    id,
                    kind,
                    message: error.to_string(),
                });
            }
        });
        Ok(())
    }

    /// Cancels every worker and closes the database.
    ///
    /// Records keep their current status; interrupted ones are demoted to
    /// `Paused` by the next restore.
    pub async fn shutdown(&self) {
        if let Some(state) = self.state.get() {
            state.scheduler.shutdown();
            state.database.close().await;
            info!("download manager shut down");
        }
    }

    /// Worker bookkeeping, for observation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`].
    pub fn scheduler(&self) -> Result<&TaskScheduler, EngineError> {
        Ok(&self.state()?.scheduler)
    }

    /// The record catalogue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`].
    pub fn registry(&self) -> Result<&Arc<DownloadRegistry>, EngineError> {
        Ok(&self.state()?.registry)
    }

    fn state(&self) -> Result<&EngineState, EngineError> {
        self.state.get().ok_or(EngineError::NotInitialized)
    }
}

async fn open_record_file(
    registry: &DownloadRegistry,
    context: &WorkerContext,
    opener: Option<&dyn FileOpener>,
    id: DownloadId,
) -> Result<(), DownloadError> {
    let record = registry
        .find_record(id)
        .await
        .ok_or_else(|| StorageError::FileNotFound {
            name: format!("download #{id}"),
        })?;

    let (root, relative_dir) = {
        let _permission = context.locks.permission.lock().await;
        resolve_destination(context.storage.as_ref(), &record.directory).await?
    };
    let file = context
        .storage
        .find_file(&root, &relative_dir, &record.file_name)
        .await?
        .ok_or_else(|| StorageError::FileNotFound {
            name: record.file_name.clone(),
        })?;

    let Some(opener) = opener else {
        return Err(StorageError::OpenFailed {
            name: file.name,
            reason: "no file opener configured".to_string(),
        }
        .into());
    };
    opener.open(&file, &record.mime_type).await?;
    debug!(id, file = %file.name, "file handed to opener");
    Ok(())
}

//! Download Manager Library
//!
//! A resumable, concurrent HTTP download engine. Downloads survive process
//! restarts, can be paused, resumed and removed individually, and report
//! their lifecycle through an ordered event stream.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`engine`] - [`DownloadManager`] facade
//! - [`registry`] - Persisted download records and id allocation
//! - [`download`] - Resumable transfer client, workers and scheduler
//! - [`storage`] - Destination storage contract and local filesystem gateway
//! - [`events`] - Lifecycle event bus
//! - [`db`] - Database connection and schema management
//! - [`config`] - Settings loading and validation
//! - [`logging`] - Tracing subscriber setup

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod engine;
pub mod events;
pub mod logging;
pub mod registry;
pub mod storage;
#[cfg(test)]
pub(crate) mod test_support;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, EngineSettings};
pub use db::{Database, DatabaseOptions, DbError};
pub use download::{DownloadError, ErrorKind, TaskScheduler, TransferClient, WorkerState};
pub use engine::{DownloadManager, EngineError};
pub use events::{DownloadEvent, EventBus, EventSubscription};
pub use registry::{
    ContentHandle, DownloadId, DownloadRecord, DownloadRegistry, DownloadStatus, Progress,
    RecordStore, RegistryError, SqliteRecordStore,
};
pub use storage::{
    FileHandle, FileOpener, LocalStorageGateway, PermissionHandler, PermissionRequest,
    StorageError, StorageGateway, StorageRoot,
};

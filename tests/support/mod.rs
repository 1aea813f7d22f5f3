//! Shared harness for engine integration suites.

#![allow(dead_code)]

pub mod socket_guard;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use download_manager::storage::{FileSink, SinkMode};
use download_manager::{
    DownloadEvent, DownloadId, DownloadManager, EngineConfig, EngineSettings, EventSubscription,
    FileHandle, FileOpener, LocalStorageGateway, StorageError, StorageGateway, StorageRoot,
};
use tempfile::TempDir;
use tokio::io::AsyncWrite;

/// Upper bound on waiting for any single event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

/// Deterministic, non-repeating-per-block body of `len` bytes.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A manager over a temp storage root, already initialized and subscribed.
pub struct TestEngine {
    pub manager: Arc<DownloadManager>,
    pub events: EventSubscription,
    pub gateway: Arc<InstrumentedGateway>,
    pub root: TempDir,
}

impl TestEngine {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(EngineSettings::default(), None, None).await
    }

    pub async fn start_with(
        settings: EngineSettings,
        available_space: Option<u64>,
        file_opener: Option<Arc<dyn FileOpener>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let root = TempDir::new()?;
        let gateway = Arc::new(InstrumentedGateway::new(
            LocalStorageGateway::new(vec![root.path().to_path_buf()]),
            available_space,
        ));
        let manager = Arc::new(DownloadManager::new());
        let events = manager.subscribe();
        let storage: Arc<dyn StorageGateway> = gateway.clone();
        let mut config = EngineConfig::new(storage).with_settings(settings);
        if let Some(opener) = file_opener {
            config = config.with_file_opener(opener);
        }
        manager.initialize(config).await?;
        Ok(Self {
            manager,
            events,
            gateway,
            root,
        })
    }

    /// Logical directory below the storage root.
    pub fn location(&self, dir: &str) -> String {
        self.root.path().join(dir).to_string_lossy().into_owned()
    }

    pub fn file_path(&self, dir: &str, name: &str) -> PathBuf {
        self.root.path().join(dir).join(name)
    }

    /// Collects events for `id` until it completes or fails.
    pub async fn until_terminal(&mut self, id: DownloadId) -> Vec<DownloadEvent> {
        collect_until(&mut self.events, |event| {
            event.id() == id
                && matches!(
                    event,
                    DownloadEvent::Completed(_) | DownloadEvent::Error { .. }
                )
        })
        .await
        .into_iter()
        .filter(|event| event.id() == id)
        .collect()
    }

    /// Waits for the next event matching `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(&DownloadEvent) -> bool,
    ) -> DownloadEvent {
        let mut seen = collect_until(&mut self.events, predicate).await;
        seen.pop().unwrap()
    }
}

/// Receives events until one matches `stop`, returning all of them.
pub async fn collect_until(
    events: &mut EventSubscription,
    mut stop: impl FnMut(&DownloadEvent) -> bool,
) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event; seen: {seen:?}"))
            .expect("event bus closed");
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Polls until `path` exists.
pub async fn wait_for_file(path: &Path) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never appeared", path.display()));
}

pub fn progress_events(events: &[DownloadEvent]) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|event| match event {
            DownloadEvent::Progress { progress, .. } => {
                Some((progress.downloaded_bytes, progress.total_bytes))
            }
            _ => None,
        })
        .collect()
}

/// Live and peak open sinks for one destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkUsage {
    pub live: usize,
    pub peak: usize,
    pub opened: usize,
}

type SinkTable = Arc<Mutex<HashMap<String, SinkUsage>>>;

/// Wraps [`LocalStorageGateway`] to observe sinks and fake free space.
pub struct InstrumentedGateway {
    inner: LocalStorageGateway,
    available_space: Option<u64>,
    sinks: SinkTable,
}

impl InstrumentedGateway {
    pub fn new(inner: LocalStorageGateway, available_space: Option<u64>) -> Self {
        Self {
            inner,
            available_space,
            sinks: Arc::default(),
        }
    }

    pub fn sink_usage(&self) -> HashMap<String, SinkUsage> {
        self.sinks.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageGateway for InstrumentedGateway {
    async fn resolve_permissioned_root(
        &self,
        logical_path: &str,
    ) -> Result<StorageRoot, StorageError> {
        self.inner.resolve_permissioned_root(logical_path).await
    }

    async fn create_or_reuse_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
        mime_type: &str,
    ) -> Result<FileHandle, StorageError> {
        self.inner
            .create_or_reuse_file(root, relative_dir, file_name, mime_type)
            .await
    }

    async fn create_unique_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
        mime_type: &str,
    ) -> Result<FileHandle, StorageError> {
        self.inner
            .create_unique_file(root, relative_dir, file_name, mime_type)
            .await
    }

    async fn find_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
    ) -> Result<Option<FileHandle>, StorageError> {
        self.inner.find_file(root, relative_dir, file_name).await
    }

    async fn file_length(&self, file: &FileHandle) -> Result<u64, StorageError> {
        self.inner.file_length(file).await
    }

    async fn open_sink(&self, file: &FileHandle, mode: SinkMode) -> Result<FileSink, StorageError> {
        let inner = self.inner.open_sink(file, mode).await?;
        let key = file.content.as_str().to_string();
        {
            let mut table = self.sinks.lock().unwrap();
            let usage = table.entry(key.clone()).or_default();
            usage.live += 1;
            usage.opened += 1;
            usage.peak = usage.peak.max(usage.live);
        }
        Ok(Box::new(CountedSink {
            inner,
            key,
            table: Arc::clone(&self.sinks),
        }))
    }

    async fn available_space(&self, root: &StorageRoot) -> Result<u64, StorageError> {
        match self.available_space {
            Some(space) => Ok(space),
            None => self.inner.available_space(root).await,
        }
    }
}

struct CountedSink {
    inner: FileSink,
    key: String,
    table: SinkTable,
}

impl Drop for CountedSink {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            if let Some(usage) = table.get_mut(&self.key) {
                usage.live -= 1;
            }
        }
    }
}

impl AsyncWrite for CountedSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

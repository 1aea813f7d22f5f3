//! One download's transfer, from destination resolution to completion.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::TransferClient;
use super::constants::{CHUNK_SIZE, PROGRESS_THRESHOLD};
use super::error::{DownloadError, ErrorKind};
use crate::events::{DownloadEvent, EventBus};
use crate::registry::{DownloadId, DownloadRecord, DownloadRegistry, DownloadStatus, Progress};
use crate::storage::{SinkMode, StorageError, StorageGateway, StorageRoot, relative_segments};

/// Chunking and progress throttling for the streaming loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Bytes read per iteration.
    pub chunk_size: usize,
    /// Bytes written between progress events.
    pub progress_threshold: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            progress_threshold: PROGRESS_THRESHOLD,
        }
    }
}

/// Serializes storage calls the gateway is not required to synchronize.
#[derive(Debug, Default)]
pub(crate) struct StorageLocks {
    pub(crate) permission: Mutex<()>,
    pub(crate) files: Mutex<()>,
}

/// Everything a worker needs, shared by all workers.
pub(crate) struct WorkerContext {
    pub(crate) registry: Arc<DownloadRegistry>,
    pub(crate) storage: Arc<dyn StorageGateway>,
    pub(crate) client: TransferClient,
    pub(crate) events: EventBus,
    pub(crate) locks: StorageLocks,
    pub(crate) stream: StreamOptions,
}

/// How the destination file is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartMode {
    /// Fresh download: never overwrite, pick `name (n).ext` on collision.
    CreateNew,
    /// Resume: continue the existing file from its current length.
    ReuseExisting,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    Completed,
    Cancelled,
    Failed(ErrorKind),
}

/// Runs `future` unless `token` fires first.
pub(crate) async fn until_cancelled<F: Future>(
    token: &CancellationToken,
    future: F,
) -> Result<F::Output, DownloadError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(DownloadError::Cancelled),
        output = future => Ok(output),
    }
}

/// Resolves the permissioned root for `directory` and its segments below it.
pub(crate) async fn resolve_destination(
    storage: &dyn StorageGateway,
    directory: &str,
) -> Result<(StorageRoot, Vec<String>), DownloadError> {
    let root = storage.resolve_permissioned_root(directory).await?;
    let segments =
        relative_segments(&root.id, directory).ok_or_else(|| StorageError::RootNotFound {
            location: directory.to_string(),
        })?;
    Ok((root, segments))
}

/// Runs one worker to completion. Failures are reported, never propagated.
#[instrument(skip_all, fields(id = record.id, mode = ?mode))]
pub(crate) async fn run_worker(
    ctx: &WorkerContext,
    record: DownloadRecord,
    mode: StartMode,
    token: &CancellationToken,
) -> WorkerOutcome {
    match transfer(ctx, &record, mode, token).await {
        Ok(()) => WorkerOutcome::Completed,
        Err(error) if token.is_cancelled() || matches!(error, DownloadError::Cancelled) => {
            debug!(error = %error, "worker cancelled");
            WorkerOutcome::Cancelled
        }
        Err(error) => {
            let kind = error.kind();
            warn!(kind = %kind, error = %error, "download failed");
            report_failure(ctx, &record, kind, &error, token).await;
            WorkerOutcome::Failed(kind)
        }
    }
}

async fn report_failure(
    ctx: &WorkerContext,
    record: &DownloadRecord,
    kind: ErrorKind,
    error: &DownloadError,
    token: &CancellationToken,
) {
    let snapshot = match ctx
        .registry
        .update_status_if_live(record.id, DownloadStatus::Error, token)
        .await
    {
        Ok(Some(updated)) => updated,
        Ok(None) => return,
        Err(e) => {
            warn!(id = record.id, error = %e, "failed to persist error status");
            let mut fallback = record.clone();
            fallback.set_status(DownloadStatus::Error);
            fallback
        }
    };
    ctx.events.publish_if_live(
        token,
        DownloadEvent::Error {
            record: snapshot,
            kind,
            message: error.to_string(),
        },
    );
}

async fn transfer(
    ctx: &WorkerContext,
    record: &DownloadRecord,
    mode: StartMode,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let id = record.id;

    let (root, relative_dir) = {
        let _permission = until_cancelled(token, ctx.locks.permission.lock()).await?;
        until_cancelled(
            token,
            resolve_destination(ctx.storage.as_ref(), &record.directory),
        )
        .await??
    };

    let file = {
        let _files = until_cancelled(token, ctx.locks.files.lock()).await?;
        match mode {
            StartMode::CreateNew => {
                ctx.storage
                    .create_unique_file(&root, &relative_dir, &record.file_name, &record.mime_type)
                    .await?
            }
            StartMode::ReuseExisting => {
                ctx.storage
                    .create_or_reuse_file(
                        &root,
                        &relative_dir,
                        &record.file_name,
                        &record.mime_type,
                    )
                    .await?
            }
        }
    };
    ctx.registry
        .set_destination(id, &file.name, file.content.clone())
        .await?;

    let offset = ctx.storage.file_length(&file).await?;
    debug!(file = %file.name, offset, "destination ready");

    let source = until_cancelled(token, ctx.client.open(&record.url, offset)).await??;
    let total = source.total_size;
    let start = source.start_offset;

    ctx.registry
        .update_progress_if_live(id, start, total, token)
        .await;
    let started = ctx
        .registry
        .update_status_if_live(id, DownloadStatus::Downloading, token)
        .await?
        .ok_or(DownloadError::Cancelled)?;
    ctx.events.publish_if_live(
        token,
        DownloadEvent::Started {
            record: started,
            total_size: total,
        },
    );

    if total > 0 {
        let required = total.saturating_sub(start);
        let available = ctx.storage.available_space(&root).await?;
        if available < required {
            return Err(DownloadError::InsufficientSpace {
                required,
                available,
            });
        }
    }

    let Some(mut reader) = source.reader else {
        return complete(ctx, id, token).await;
    };
    if total > 0 && start >= total {
        return complete(ctx, id, token).await;
    }

    let sink_mode = if start < offset {
        SinkMode::Truncate
    } else {
        SinkMode::Append
    };
    let mut sink = ctx.storage.open_sink(&file, sink_mode).await?;
    let mut observer = RegistryProgress { ctx, id, token };
    let summary = stream_to_sink(
        &mut reader,
        &mut sink,
        StreamPosition { start, total },
        &ctx.stream,
        token,
        &record.url,
        &mut observer,
    )
    .await?;
    drop(sink);

    let final_total = if total == 0 { summary.downloaded } else { total };
    if summary.unreported > 0 || total == 0 {
        observer.on_written(summary.downloaded, final_total).await;
        observer.on_threshold(summary.downloaded, final_total).await;
    }

    if summary.downloaded == final_total {
        complete(ctx, id, token).await
    } else {
        Err(DownloadError::StreamEnded {
            downloaded: summary.downloaded,
            total,
        })
    }
}

async fn complete(
    ctx: &WorkerContext,
    id: DownloadId,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let done = ctx
        .registry
        .update_status_if_live(id, DownloadStatus::Downloaded, token)
        .await?
        .ok_or(DownloadError::Cancelled)?;
    info!(id, "download completed");
    ctx.events
        .publish_if_live(token, DownloadEvent::Completed(done));
    Ok(())
}

/// Receives byte counts from the streaming loop.
pub(crate) trait ProgressObserver {
    /// Called after every chunk is written.
    async fn on_written(&mut self, downloaded: u64, total: u64);
    /// Called each time the throttling threshold is crossed.
    async fn on_threshold(&mut self, downloaded: u64, total: u64);
}

struct RegistryProgress<'a> {
    ctx: &'a WorkerContext,
    id: DownloadId,
    token: &'a CancellationToken,
}

impl ProgressObserver for RegistryProgress<'_> {
    async fn on_written(&mut self, downloaded: u64, total: u64) {
        self.ctx
            .registry
            .update_progress_if_live(self.id, downloaded, total, self.token)
            .await;
    }

    async fn on_threshold(&mut self, downloaded: u64, total: u64) {
        self.ctx.events.publish_if_live(
            self.token,
            DownloadEvent::Progress {
                id: self.id,
                progress: Progress::new(downloaded, total),
            },
        );
    }
}

/// Where a stream starts in the resource and how long the resource is.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamPosition {
    pub(crate) start: u64,
    pub(crate) total: u64,
}

/// Result of a clean end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamSummary {
    /// Resource bytes present after the stream ended.
    pub(crate) downloaded: u64,
    /// Bytes written since the last threshold event.
    pub(crate) unreported: u64,
}

/// Copies `reader` into `sink` chunk by chunk, checking `token` every iteration.
///
/// The unreported counter is reduced by the threshold on each event, so a
/// stream of `n` bytes produces exactly `n / threshold` events however the
/// reads are fragmented. The sink is flushed on every exit path.
pub(crate) async fn stream_to_sink<R, W, P>(
    reader: &mut R,
    sink: &mut W,
    position: StreamPosition,
    options: &StreamOptions,
    token: &CancellationToken,
    url: &str,
    observer: &mut P,
) -> Result<StreamSummary, DownloadError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    P: ProgressObserver,
{
    let copied = copy_chunks(reader, sink, position, options, token, url, observer).await;
    let flushed = sink.flush().await;
    let summary = copied?;
    flushed.map_err(|e| DownloadError::io(url, e))?;
    Ok(summary)
}

async fn copy_chunks<R, W, P>(
    reader: &mut R,
    sink: &mut W,
    position: StreamPosition,
    options: &StreamOptions,
    token: &CancellationToken,
    url: &str,
    observer: &mut P,
) -> Result<StreamSummary, DownloadError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    P: ProgressObserver,
{
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut downloaded = position.start;
    let mut unreported = 0u64;

    loop {
        let read = match until_cancelled(token, reader.read(&mut buffer)).await? {
            Ok(read) => read,
            Err(e) if downloaded < position.total && is_truncated_body(&e) => {
                debug!(downloaded, total = position.total, error = %e, "source closed early");
                break;
            }
            Err(e) => return Err(DownloadError::io(url, e)),
        };
        if read == 0 {
            break;
        }

        sink.write_all(&buffer[..read])
            .await
            .map_err(|e| DownloadError::io(url, e))?;
        let written = read as u64;
        downloaded += written;
        unreported += written;
        observer.on_written(downloaded, position.total).await;

        if unreported >= options.progress_threshold {
            unreported -= options.progress_threshold;
            observer.on_threshold(downloaded, position.total).await;
        }
    }

    Ok(StreamSummary {
        downloaded,
        unreported,
    })
}

/// True when the body stopped short of its declared length, as opposed to a
/// timeout or an unrelated transport failure.
fn is_truncated_body(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        return true;
    }
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(|e| (e.is_body() || e.is_decode()) && !e.is_timeout())
}

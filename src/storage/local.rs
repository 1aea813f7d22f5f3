//! Filesystem-backed [`StorageGateway`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs::{self, OpenOptions};
use tracing::{debug, instrument};

use super::filename::{is_plain_segment, sanitize_filename, suffixed_name};
use super::{
    FileHandle, FileSink, PermissionHandler, PermissionRequest, RootHandle, SinkMode,
    StorageError, StorageGateway, StorageRoot,
};
use crate::registry::ContentHandle;

/// Upper bound on `name (n).ext` candidates tried by `create_unique_file`.
pub const MAX_UNIQUE_NAME_ATTEMPTS: usize = 10_000;

/// Stores downloads below a fixed set of filesystem roots.
///
/// Logical paths are plain absolute paths. Without a [`PermissionHandler`]
/// every configured root is writable; with one, the first resolution of a root
/// asks the handler and remembers an accepted grant.
pub struct LocalStorageGateway {
    roots: Vec<PathBuf>,
    permission_handler: Option<Arc<dyn PermissionHandler>>,
    grants: DashMap<String, RootHandle>,
}

impl std::fmt::Debug for LocalStorageGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorageGateway")
            .field("roots", &self.roots)
            .field("grants", &self.grants.len())
            .finish_non_exhaustive()
    }
}

impl LocalStorageGateway {
    #[must_use]
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            permission_handler: None,
            grants: DashMap::new(),
        }
    }

    /// Routes first-time root access through `handler`.
    #[must_use]
    pub fn with_permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission_handler = Some(handler);
        self
    }

    fn containing_root(&self, logical_path: &Path) -> Option<&PathBuf> {
        self.roots
            .iter()
            .filter(|root| logical_path.starts_with(root))
            .max_by_key(|root| root.components().count())
    }

    fn directory_path(root: &StorageRoot, relative_dir: &[String]) -> Result<PathBuf, StorageError> {
        let mut path = PathBuf::from(&root.id);
        for segment in relative_dir {
            if !is_plain_segment(segment) {
                return Err(StorageError::InvalidPath {
                    component: segment.clone(),
                });
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn prepare_directory(
        root: &StorageRoot,
        relative_dir: &[String],
    ) -> Result<PathBuf, StorageError> {
        let dir = Self::directory_path(root, relative_dir)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir)
    }

    fn handle_for(name: String, path: &Path) -> FileHandle {
        FileHandle {
            name,
            content: ContentHandle::new(path.to_string_lossy()),
        }
    }
}

#[async_trait]
impl StorageGateway for LocalStorageGateway {
    #[instrument(skip(self))]
    async fn resolve_permissioned_root(
        &self,
        logical_path: &str,
    ) -> Result<StorageRoot, StorageError> {
        let root = self
            .containing_root(Path::new(logical_path))
            .ok_or_else(|| StorageError::RootNotFound {
                location: logical_path.to_string(),
            })?;
        let id = root.to_string_lossy().into_owned();

        if let Some(handle) = self.grants.get(&id) {
            return Ok(StorageRoot {
                id,
                handle: handle.clone(),
            });
        }

        let handle = match &self.permission_handler {
            None => RootHandle::new(id.clone()),
            Some(handler) => {
                debug!(root = %id, "requesting storage permission");
                let (request, pending) = PermissionRequest::new(id.clone());
                handler.on_permission_request(request);
                pending
                    .outcome()
                    .await
                    .ok_or_else(|| StorageError::PermissionRejected {
                        location: id.clone(),
                    })?
            }
        };
        self.grants.insert(id.clone(), handle.clone());
        Ok(StorageRoot { id, handle })
    }

    async fn create_or_reuse_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
        _mime_type: &str,
    ) -> Result<FileHandle, StorageError> {
        let dir = Self::prepare_directory(root, relative_dir).await?;
        let name = sanitize_filename(file_name);
        let path = dir.join(&name);

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        Ok(Self::handle_for(name, &path))
    }

    #[instrument(skip(self, root, _mime_type))]
    async fn create_unique_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
        _mime_type: &str,
    ) -> Result<FileHandle, StorageError> {
        let dir = Self::prepare_directory(root, relative_dir).await?;
        let requested = sanitize_filename(file_name);

        for attempt in 0..=MAX_UNIQUE_NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                requested.clone()
            } else {
                suffixed_name(&requested, attempt)
            };
            let path = dir.join(&candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self::handle_for(candidate, &path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StorageError::io(&path, e)),
            }
        }

        Err(StorageError::UniqueNameExhausted {
            name: requested,
            attempts: MAX_UNIQUE_NAME_ATTEMPTS,
        })
    }

    async fn find_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
    ) -> Result<Option<FileHandle>, StorageError> {
        let name = sanitize_filename(file_name);
        let path = Self::directory_path(root, relative_dir)?.join(&name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(Self::handle_for(name, &path))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn file_length(&self, file: &FileHandle) -> Result<u64, StorageError> {
        let path = Path::new(file.content.as_str());
        match fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::FileNotFound {
                name: file.name.clone(),
            }),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn open_sink(&self, file: &FileHandle, mode: SinkMode) -> Result<FileSink, StorageError> {
        let path = Path::new(file.content.as_str());
        let mut options = OpenOptions::new();
        match mode {
            SinkMode::Append => options.append(true),
            SinkMode::Truncate => options.write(true).truncate(true),
        };
        let sink = options
            .open(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Box::new(sink))
    }

    async fn available_space(&self, root: &StorageRoot) -> Result<u64, StorageError> {
        let path = PathBuf::from(&root.id);
        let query_path = path.clone();
        tokio::task::spawn_blocking(move || fs2::available_space(&query_path))
            .await
            .map_err(|e| StorageError::io(&path, std::io::Error::other(e)))?
            .map_err(|e| StorageError::io(&path, e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn gateway(dir: &TempDir) -> LocalStorageGateway {
        LocalStorageGateway::new([dir.path().to_path_buf()])
    }

    async fn root_of(gateway: &LocalStorageGateway, dir: &TempDir) -> StorageRoot {
        gateway
            .resolve_permissioned_root(&dir.path().join("Download").to_string_lossy())
            .await
            .unwrap()
    }

    fn segments(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolve_root_without_handler_grants_root() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;
        assert_eq!(root.id, dir.path().to_string_lossy());
    }

    #[tokio::test]
    async fn test_resolve_root_outside_roots_fails() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let err = gateway
            .resolve_permissioned_root("/definitely/not/configured")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RootNotFound { .. }));
    }

    struct RecordingHandler {
        accept: bool,
        seen: Mutex<Vec<String>>,
    }

    impl PermissionHandler for RecordingHandler {
        fn on_permission_request(&self, request: PermissionRequest) {
            self.seen
                .lock()
                .unwrap()
                .push(request.storage_location().to_string());
            if self.accept {
                request.accept(RootHandle::new("granted"));
            } else {
                request.reject();
            }
        }
    }

    #[tokio::test]
    async fn test_permission_grant_is_requested_once() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(RecordingHandler {
            accept: true,
            seen: Mutex::new(Vec::new()),
        });
        let gateway = gateway(&dir).with_permission_handler(handler.clone());

        let first = root_of(&gateway, &dir).await;
        let second = root_of(&gateway, &dir).await;

        assert_eq!(first.handle, RootHandle::new("granted"));
        assert_eq!(second.handle, RootHandle::new("granted"));
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permission_rejection_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(RecordingHandler {
            accept: false,
            seen: Mutex::new(Vec::new()),
        });
        let gateway = gateway(&dir).with_permission_handler(handler);

        let err = gateway
            .resolve_permissioned_root(&dir.path().to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PermissionRejected { .. }));
        assert!(err.is_unresolvable());
    }

    #[tokio::test]
    async fn test_create_unique_file_skips_taken_names() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;
        let rel = segments(&["Download"]);
        std::fs::create_dir_all(dir.path().join("Download")).unwrap();
        std::fs::write(dir.path().join("Download/report.pdf"), b"a").unwrap();
        std::fs::write(dir.path().join("Download/report (1).pdf"), b"b").unwrap();

        let file = gateway
            .create_unique_file(&root, &rel, "report.pdf", "application/pdf")
            .await
            .unwrap();

        assert_eq!(file.name, "report (2).pdf");
        assert!(dir.path().join("Download/report (2).pdf").is_file());
        assert_eq!(gateway.file_length(&file).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_or_reuse_keeps_existing_content() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;
        let rel = segments(&["Download", "Nested"]);

        let created = gateway
            .create_or_reuse_file(&root, &rel, "data.bin", "application/octet-stream")
            .await
            .unwrap();
        std::fs::write(created.content.as_str(), b"12345").unwrap();
        let reused = gateway
            .create_or_reuse_file(&root, &rel, "data.bin", "application/octet-stream")
            .await
            .unwrap();

        assert_eq!(created, reused);
        assert_eq!(gateway.file_length(&reused).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_parent_segments_are_rejected() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;

        let err = gateway
            .create_or_reuse_file(&root, &segments(&[".."]), "x.bin", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_find_file_does_not_create() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;
        let rel = segments(&["Download"]);

        assert!(gateway.find_file(&root, &rel, "missing.bin").await.unwrap().is_none());
        assert!(!dir.path().join("Download").exists());
    }

    #[tokio::test]
    async fn test_sink_modes_append_and_truncate() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;
        let file = gateway
            .create_or_reuse_file(&root, &[], "sink.bin", "application/octet-stream")
            .await
            .unwrap();

        let mut sink = gateway.open_sink(&file, SinkMode::Append).await.unwrap();
        sink.write_all(b"abc").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        let mut sink = gateway.open_sink(&file, SinkMode::Append).await.unwrap();
        sink.write_all(b"def").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        assert_eq!(std::fs::read(file.content.as_str()).unwrap(), b"abcdef");

        let mut sink = gateway.open_sink(&file, SinkMode::Truncate).await.unwrap();
        sink.write_all(b"z").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        assert_eq!(std::fs::read(file.content.as_str()).unwrap(), b"z");
    }

    #[tokio::test]
    async fn test_available_space_reports_bytes() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir);
        let root = root_of(&gateway, &dir).await;
        assert!(gateway.available_space(&root).await.unwrap() > 0);
    }
}

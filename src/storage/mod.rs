//! Storage collaborator contract consumed by the download workers.
//!
//! A [`StorageGateway`] turns a logical directory into a permissioned root,
//! materializes destination files below it, and reports free space. The
//! engine serializes permission negotiation and file creation through its own
//! locks, so implementations need not be internally synchronized for those
//! calls.
//!
//! Permission grants are modelled as an explicit [`PermissionRequest`]
//! resolved with [`accept`](PermissionRequest::accept) or
//! [`reject`](PermissionRequest::reject); dropping a request rejects it.
//!
//! [`LocalStorageGateway`] is the filesystem implementation.

mod filename;
mod local;

pub use filename::{is_plain_segment, relative_segments, sanitize_filename, suffixed_name};
pub use local::{LocalStorageGateway, MAX_UNIQUE_NAME_ATTEMPTS};

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::registry::ContentHandle;

/// Opaque capability to write below a storage root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootHandle(String);

impl RootHandle {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A resolved, permissioned storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    /// Logical path prefix of the root (e.g. `/storage/emulated/0`).
    pub id: String,
    /// Write capability for the root.
    pub handle: RootHandle,
}

/// A materialized destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Final file name (may differ from the requested one after collision handling).
    pub name: String,
    /// Gateway-specific reference stored on the record.
    pub content: ContentHandle,
}

/// How a sink treats existing file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// Write after the current end of file.
    Append,
    /// Discard existing content first.
    Truncate,
}

/// Writable destination stream.
pub type FileSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors raised by storage gateways and file openers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No configured root contains the logical path.
    #[error("no storage root contains {location}")]
    RootNotFound {
        /// Requested logical path.
        location: String,
    },

    /// The permission round trip was rejected or abandoned.
    #[error("write permission rejected for {location}")]
    PermissionRejected {
        /// Root the permission was requested for.
        location: String,
    },

    /// A directory segment or file name cannot be used as a single path component.
    #[error("invalid path component '{component}'")]
    InvalidPath {
        /// The rejected component.
        component: String,
    },

    /// Every `name (n).ext` candidate was taken.
    #[error("no free name for {name} after {attempts} attempts")]
    UniqueNameExhausted {
        /// Requested file name.
        name: String,
        /// Number of candidates tried.
        attempts: usize,
    },

    /// The file does not exist.
    #[error("file not found: {name}")]
    FileNotFound {
        /// File name or handle that was looked up.
        name: String,
    },

    /// Filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Opening the file with a viewer failed.
    #[error("cannot open {name}: {reason}")]
    OpenFailed {
        /// File name.
        name: String,
        /// Viewer-provided reason.
        reason: String,
    },
}

impl StorageError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for failures meaning "the destination cannot be resolved".
    #[must_use]
    pub fn is_unresolvable(&self) -> bool {
        matches!(
            self,
            Self::RootNotFound { .. }
                | Self::PermissionRejected { .. }
                | Self::InvalidPath { .. }
                | Self::UniqueNameExhausted { .. }
                | Self::FileNotFound { .. }
        )
    }
}

/// Out-of-band request for write access to a storage root.
pub struct PermissionRequest {
    storage_location: String,
    responder: oneshot::Sender<RootHandle>,
}

impl fmt::Debug for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionRequest")
            .field("storage_location", &self.storage_location)
            .finish_non_exhaustive()
    }
}

/// Receiving side of a [`PermissionRequest`].
#[derive(Debug)]
pub struct PendingPermission {
    receiver: oneshot::Receiver<RootHandle>,
}

impl PermissionRequest {
    /// Creates a request and the handle the gateway awaits.
    #[must_use]
    pub fn new(storage_location: impl Into<String>) -> (Self, PendingPermission) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                storage_location: storage_location.into(),
                responder,
            },
            PendingPermission { receiver },
        )
    }

    /// Root the caller wants to write below.
    #[must_use]
    pub fn storage_location(&self) -> &str {
        &self.storage_location
    }

    /// Grants access with the given handle.
    pub fn accept(self, handle: RootHandle) {
        // The requester may have been cancelled meanwhile.
        let _ = self.responder.send(handle);
    }

    /// Denies access.
    pub fn reject(self) {
        drop(self.responder);
    }
}

impl PendingPermission {
    /// Waits for the decision. `None` means rejected or abandoned.
    pub async fn outcome(self) -> Option<RootHandle> {
        self.receiver.await.ok()
    }
}

/// Receives permission requests, typically by prompting a user.
pub trait PermissionHandler: Send + Sync {
    /// Called once per request; resolve it now or later.
    fn on_permission_request(&self, request: PermissionRequest);
}

/// Hands a finished file to a system viewer.
#[async_trait]
pub trait FileOpener: Send + Sync {
    /// Opens `file`, interpreting it as `mime_type`.
    async fn open(&self, file: &FileHandle, mime_type: &str) -> Result<(), StorageError>;
}

/// Resolves logical destinations into writable files.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Finds the root containing `logical_path` and obtains write permission for it.
    ///
    /// May wait on an out-of-band user decision.
    async fn resolve_permissioned_root(&self, logical_path: &str)
    -> Result<StorageRoot, StorageError>;

    /// Creates missing directory segments, then returns the named file, creating it if absent.
    async fn create_or_reuse_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
        mime_type: &str,
    ) -> Result<FileHandle, StorageError>;

    /// Like [`create_or_reuse_file`](Self::create_or_reuse_file), but never reuses:
    /// collisions fall back to `name (1).ext`, `name (2).ext`, ...
    async fn create_unique_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
        mime_type: &str,
    ) -> Result<FileHandle, StorageError>;

    /// Looks up an existing file without creating anything.
    async fn find_file(
        &self,
        root: &StorageRoot,
        relative_dir: &[String],
        file_name: &str,
    ) -> Result<Option<FileHandle>, StorageError>;

    /// Current length of the file in bytes.
    async fn file_length(&self, file: &FileHandle) -> Result<u64, StorageError>;

    /// Opens a writable stream on the file.
    async fn open_sink(&self, file: &FileHandle, mode: SinkMode) -> Result<FileSink, StorageError>;

    /// Free bytes available below the root.
    async fn available_space(&self, root: &StorageRoot) -> Result<u64, StorageError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permission_request_accept_delivers_handle() {
        let (request, pending) = PermissionRequest::new("/storage/emulated/0");
        assert_eq!(request.storage_location(), "/storage/emulated/0");
        request.accept(RootHandle::new("grant-1"));
        assert_eq!(pending.outcome().await, Some(RootHandle::new("grant-1")));
    }

    #[tokio::test]
    async fn test_permission_request_reject_and_drop() {
        let (request, pending) = PermissionRequest::new("/a");
        request.reject();
        assert_eq!(pending.outcome().await, None);

        let (request, pending) = PermissionRequest::new("/b");
        drop(request);
        assert_eq!(pending.outcome().await, None);
    }

    #[test]
    fn test_storage_error_unresolvable_classification() {
        assert!(
            StorageError::PermissionRejected {
                location: "/a".to_string()
            }
            .is_unresolvable()
        );
        let io = StorageError::io("/a", std::io::Error::other("disk"));
        assert!(!io.is_unresolvable());
        assert!(io.to_string().contains("/a"));
    }
}

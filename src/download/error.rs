//! Error types for the download module.
//!
//! [`DownloadError`] carries context for logs; [`ErrorKind`] is the coarse
//! classification reported to event subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RegistryError;
use crate::storage::StorageError;

/// Failure classes reported through the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Engine used before initialization, or malformed arguments.
    InvalidConfiguration,
    /// Destination root or file cannot be resolved.
    FileNotFound,
    /// Remaining bytes exceed free space at the destination root.
    InsufficientSpace,
    /// Pause or remove interrupted an in-flight worker.
    UserCancelled,
    /// Source closed before every byte arrived.
    StreamEndedBeforeCompletion,
    /// Any other transport or IO failure.
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "invalid_configuration",
            Self::FileNotFound => "file_not_found",
            Self::InsufficientSpace => "insufficient_space",
            Self::UserCancelled => "user_cancelled",
            Self::StreamEndedBeforeCompletion => "stream_ended_before_completion",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while transferring one download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read timed out.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Response status outside the accepted set.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Redirect response without a usable `Location` header.
    #[error("redirect from {url} has no usable Location header")]
    MissingLocation {
        /// The redirecting URL.
        url: String,
    },

    /// Redirect chain longer than the configured cap.
    #[error("too many redirects ({hops}) starting at {url}")]
    TooManyRedirects {
        /// The original URL.
        url: String,
        /// Hops followed before giving up.
        hops: usize,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Reading the body or writing the sink failed.
    #[error("IO error during transfer of {url}: {source}")]
    Io {
        /// The URL being transferred.
        url: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Storage gateway failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Registry write failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Remaining bytes do not fit at the destination.
    #[error("insufficient space: need {required} bytes, {available} available")]
    InsufficientSpace {
        /// Bytes still to transfer.
        required: u64,
        /// Free bytes at the root.
        available: u64,
    },

    /// Source closed before the expected total was written.
    #[error("stream ended after {downloaded} of {total} bytes")]
    StreamEnded {
        /// Bytes present in the file.
        downloaded: u64,
        /// Expected total.
        total: u64,
    },

    /// The worker's cancellation token fired.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Maps a request failure, separating timeouts.
    pub fn from_request(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, source)
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an IO error, unwrapping body-read timeouts.
    pub fn io(url: impl Into<String>, source: std::io::Error) -> Self {
        let is_timeout = source
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout);
        if is_timeout {
            Self::timeout(url)
        } else {
            Self::Io {
                url: url.into(),
                source,
            }
        }
    }

    /// Classifies the error for subscribers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(storage) if storage.is_unresolvable() => ErrorKind::FileNotFound,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::StreamEnded { .. } => ErrorKind::StreamEndedBeforeCompletion,
            Self::Cancelled => ErrorKind::UserCancelled,
            Self::InvalidUrl { .. } => ErrorKind::InvalidConfiguration,
            _ => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.pdf", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://example.com/file.pdf"));
        assert_eq!(error.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_download_error_kind_mapping() {
        assert_eq!(
            DownloadError::InsufficientSpace {
                required: 10,
                available: 1
            }
            .kind(),
            ErrorKind::InsufficientSpace
        );
        assert_eq!(
            DownloadError::StreamEnded {
                downloaded: 1,
                total: 2
            }
            .kind(),
            ErrorKind::StreamEndedBeforeCompletion
        );
        assert_eq!(DownloadError::Cancelled.kind(), ErrorKind::UserCancelled);
        assert_eq!(
            DownloadError::from(StorageError::RootNotFound {
                location: "/x".to_string()
            })
            .kind(),
            ErrorKind::FileNotFound
        );
        assert_eq!(
            DownloadError::from(StorageError::io("/x", std::io::Error::other("disk"))).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_download_error_io_keeps_plain_errors() {
        let error = DownloadError::io(
            "https://example.com/a",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
        );
        assert!(matches!(error, DownloadError::Io { .. }));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::FileNotFound.to_string(), "file_not_found");
        assert_eq!(
            ErrorKind::StreamEndedBeforeCompletion.to_string(),
            "stream_ended_before_completion"
        );
    }
}

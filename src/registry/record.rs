//! Download record, status and progress types.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identity of a download record. Allocated once, never reused.
pub type DownloadId = i64;

/// Lifecycle status of a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created or resumed, waiting for its worker to connect.
    Pending,
    /// Stopped by the user, or demoted on restore.
    Paused,
    /// A worker is streaming bytes.
    Downloading,
    /// Transfer finished; the file is complete.
    Downloaded,
    /// The last worker failed.
    Error,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paused => "paused",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Error => "error",
        }
    }

    /// Status a persisted record takes after a process restart.
    ///
    /// No worker survives a restart, so `Pending` and `Downloading` become `Paused`.
    #[must_use]
    pub fn restored(self) -> Self {
        match self {
            Self::Pending | Self::Downloading => Self::Paused,
            other => other,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paused" => Ok(Self::Paused),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// Byte progress of a transfer. `total_bytes == 0` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes present in the destination file.
    pub downloaded_bytes: u64,
    /// Resource size, or 0 before the first successful connection.
    pub total_bytes: u64,
}

impl Progress {
    #[must_use]
    pub fn new(downloaded_bytes: u64, total_bytes: u64) -> Self {
        Self {
            downloaded_bytes,
            total_bytes,
        }
    }

    /// Completion percentage, 0 when the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.downloaded_bytes as f64 * 100.0 / self.total_bytes as f64
    }

    /// Returns true once the total is known.
    #[must_use]
    pub fn is_total_known(&self) -> bool {
        self.total_bytes > 0
    }
}

/// Opaque reference to a resolved destination file, issued by a storage gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHandle(String);

impl ContentHandle {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical download: where it comes from, where it goes, and how far it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Allocated identity.
    pub id: DownloadId,
    /// Creation time in milliseconds since the Unix epoch.
    pub added_time: i64,
    /// Source URL.
    pub url: String,
    /// Destination file name; updated once a unique name is resolved.
    pub file_name: String,
    /// Logical destination directory, resolved by the storage gateway.
    pub directory: String,
    /// MIME type handed to the storage gateway and file opener.
    pub mime_type: String,
    /// Lifecycle status.
    pub status: DownloadStatus,
    /// Byte progress.
    pub progress: Progress,
    /// Resolved destination, set once and never cleared.
    pub content_handle: Option<ContentHandle>,
}

impl DownloadRecord {
    /// Builds a fresh `Pending` record stamped with the current time.
    #[must_use]
    pub fn new(
        id: DownloadId,
        url: impl Into<String>,
        directory: impl Into<String>,
        file_name: &str,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            added_time: now_millis(),
            url: url.into(),
            file_name: file_name.trim().to_string(),
            directory: directory.into(),
            mime_type: mime_type.into(),
            status: DownloadStatus::Pending,
            progress: Progress::default(),
            content_handle: None,
        }
    }

    /// Applies a status change. Completion clears progress.
    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
        if status == DownloadStatus::Downloaded {
            self.progress = Progress::default();
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

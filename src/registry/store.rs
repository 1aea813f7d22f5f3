//! Persistence seam for download records and the identity counter.
//!
//! The registry only talks to [`RecordStore`]; [`SqliteRecordStore`] is the
//! durable implementation backed by [`Database`].

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::instrument;

use super::error::RegistryError;
use super::record::{ContentHandle, DownloadId, DownloadRecord, DownloadStatus, Progress};
use crate::db::Database;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Key of the last allocated download id in `engine_settings`.
const LAST_ID_KEY: &str = "last_download_id";

/// Data-access contract for record rows and the persisted id counter.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Loads every persisted record.
    async fn load_records(&self) -> Result<Vec<DownloadRecord>>;

    /// Inserts or replaces the row for `record.id`.
    async fn upsert_record(&self, record: &DownloadRecord) -> Result<()>;

    /// Deletes the row for `id`. Deleting a missing row is not an error.
    async fn delete_record(&self, id: DownloadId) -> Result<()>;

    /// Reads the last allocated id, if one was ever persisted.
    async fn load_last_id(&self) -> Result<Option<DownloadId>>;

    /// Persists the last allocated id.
    async fn save_last_id(&self, id: DownloadId) -> Result<()>;
}

/// `SQLite`-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: i64,
    added_time: i64,
    url: String,
    file_name: String,
    directory: String,
    mime_type: String,
    #[sqlx(rename = "status")]
    status_str: String,
    downloaded_bytes: i64,
    total_bytes: i64,
    content_handle: Option<String>,
}

impl TryFrom<RecordRow> for DownloadRecord {
    type Error = RegistryError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let status: DownloadStatus =
            row.status_str
                .parse()
                .map_err(|_| RegistryError::InvalidStatus {
                    id: row.id,
                    status: row.status_str.clone(),
                })?;
        Ok(Self {
            id: row.id,
            added_time: row.added_time,
            url: row.url,
            file_name: row.file_name,
            directory: row.directory,
            mime_type: row.mime_type,
            status,
            progress: Progress::new(
                u64::try_from(row.downloaded_bytes).unwrap_or(0),
                u64::try_from(row.total_bytes).unwrap_or(0),
            ),
            content_handle: row.content_handle.map(ContentHandle::new),
        })
    }
}

fn to_db_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    #[instrument(skip(self))]
    async fn load_records(&self) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r"SELECT id, added_time, url, file_name, directory, mime_type, status,
                     downloaded_bytes, total_bytes, content_handle
              FROM download_records
              ORDER BY id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(DownloadRecord::try_from).collect()
    }

    #[instrument(skip(self, record), fields(id = record.id, status = %record.status))]
    async fn upsert_record(&self, record: &DownloadRecord) -> Result<()> {
        sqlx::query(
            r"INSERT INTO download_records
                (id, added_time, url, file_name, directory, mime_type, status,
                 downloaded_bytes, total_bytes, content_handle)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                file_name = excluded.file_name,
                directory = excluded.directory,
                mime_type = excluded.mime_type,
                status = excluded.status,
                downloaded_bytes = excluded.downloaded_bytes,
                total_bytes = excluded.total_bytes,
                content_handle = excluded.content_handle",
        )
        .bind(record.id)
        .bind(record.added_time)
        .bind(&record.url)
        .bind(&record.file_name)
        .bind(&record.directory)
        .bind(&record.mime_type)
        .bind(record.status.as_str())
        .bind(to_db_bytes(record.progress.downloaded_bytes))
        .bind(to_db_bytes(record.progress.total_bytes))
        .bind(record.content_handle.as_ref().map(ContentHandle::as_str))
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_record(&self, id: DownloadId) -> Result<()> {
        sqlx::query("DELETE FROM download_records WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn load_last_id(&self) -> Result<Option<DownloadId>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM engine_settings WHERE key = ?")
                .bind(LAST_ID_KEY)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(value)
    }

    async fn save_last_id(&self, id: DownloadId) -> Result<()> {
        sqlx::query(
            r"INSERT INTO engine_settings (key, value) VALUES (?, ?)
              ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(LAST_ID_KEY)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

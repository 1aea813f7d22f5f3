//! Error types for registry persistence.

use thiserror::Error;

use super::record::DownloadId;

/// Errors raised while reading or writing download records.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Database operation failed.
    #[error("database error: {message}")]
    Database {
        /// Human-readable database error text.
        message: String,
    },

    /// A persisted row carried a status this build does not know.
    #[error(
        "invalid status '{status}' for download {id}\n  Suggestion: Use one of: pending, paused, downloading, downloaded, error"
    )]
    InvalidStatus {
        /// Row the value came from.
        id: i64,
        /// The offending value.
        status: String,
    },

    /// The id counter cannot be advanced without wrapping.
    #[error("download id space exhausted after id {last_id}")]
    IdsExhausted {
        /// Last id that was handed out.
        last_id: DownloadId,
    },
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_from_pool_closed() {
        let err = RegistryError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, RegistryError::Database { .. }));
        assert!(err.to_string().starts_with("database error: "));
    }

    #[test]
    fn test_registry_error_invalid_status_message() {
        let err = RegistryError::InvalidStatus {
            id: 3,
            status: "queued".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("queued"));
        assert!(msg.contains("download 3"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_registry_error_ids_exhausted_message() {
        let err = RegistryError::IdsExhausted { last_id: i64::MAX };
        assert!(err.to_string().contains(&i64::MAX.to_string()));
    }
}

//! Engine configuration.
//!
//! [`EngineSettings`] holds the tunables and loads from TOML; [`EngineConfig`]
//! pairs them with the injected storage and file-opener collaborators.
//!
//! Default config path:
//! 1. `$XDG_CONFIG_HOME/download-manager/config.toml`
//! 2. `$HOME/.config/download-manager/config.toml`

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::db::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DatabaseOptions};
use crate::download::constants::{
    CHUNK_SIZE, CONNECT_TIMEOUT_SECS, MAX_REDIRECTS, PROGRESS_THRESHOLD, READ_TIMEOUT_SECS,
};
use crate::download::{StreamOptions, TransferOptions};
use crate::storage::{FileOpener, StorageGateway};
use crate::user_agent::default_user_agent;

const CONFIG_DIR_NAME: &str = "download-manager";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`EngineSettings`].
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// The TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Offending value.
        value: u64,
        /// Accepted range, human readable.
        expected: &'static str,
    },
}

/// Tunables for the engine. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// SQLite file for records; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout between body reads.
    pub read_timeout_secs: u64,
    /// Bytes read per streaming iteration.
    pub chunk_size_bytes: usize,
    /// Bytes written between progress events.
    pub progress_threshold_bytes: u64,
    /// Redirect hops followed before failing.
    pub max_redirects: usize,
    /// SQLite pool size.
    pub db_max_connections: u32,
    /// SQLite busy timeout.
    pub db_busy_timeout_ms: u32,
    /// User-Agent override.
    pub user_agent: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            chunk_size_bytes: CHUNK_SIZE,
            progress_threshold_bytes: PROGRESS_THRESHOLD,
            max_redirects: MAX_REDIRECTS,
            db_max_connections: DEFAULT_MAX_CONNECTIONS,
            db_busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            user_agent: None,
        }
    }
}

impl EngineSettings {
    /// Parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data).map_err(|error| match error {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Loads the default config file, or returns defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an existing file is unreadable or invalid.
    pub fn load_default() -> Result<Self, ConfigError> {
        match resolve_default_config_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "loading engine settings");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Parses and validates settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::OutOfRange`].
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(data).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::OutOfRange`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "connect_timeout_secs",
            self.connect_timeout_secs,
            1..=600,
            "1..=600",
        )?;
        check_range(
            "read_timeout_secs",
            self.read_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check_range(
            "chunk_size_bytes",
            self.chunk_size_bytes as u64,
            512..=1_048_576,
            "512..=1048576",
        )?;
        if self.progress_threshold_bytes < self.chunk_size_bytes as u64 {
            return Err(ConfigError::OutOfRange {
                field: "progress_threshold_bytes",
                value: self.progress_threshold_bytes,
                expected: "chunk_size_bytes..",
            });
        }
        check_range("max_redirects", self.max_redirects as u64, 0..=50, "0..=50")?;
        check_range(
            "db_max_connections",
            u64::from(self.db_max_connections),
            1..=64,
            "1..=64",
        )?;
        check_range(
            "db_busy_timeout_ms",
            u64::from(self.db_busy_timeout_ms),
            0..=120_000,
            "0..=120000",
        )
    }

    /// HTTP options derived from these settings.
    #[must_use]
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_redirects: self.max_redirects,
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(default_user_agent),
        }
    }

    /// Streaming options derived from these settings.
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            chunk_size: self.chunk_size_bytes,
            progress_threshold: self.progress_threshold_bytes,
        }
    }

    /// Pool options derived from these settings.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.db_max_connections,
            busy_timeout_ms: self.db_busy_timeout_ms,
        }
    }
}

fn check_range(
    field: &'static str,
    value: u64,
    range: std::ops::RangeInclusive<u64>,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected,
        })
    }
}

/// Resolves the default config file location, if a home can be determined.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    std::env::var_os(name).filter(|value| !value.is_empty())
}

/// Settings plus the collaborators the engine is built from.
#[derive(Clone)]
pub struct EngineConfig {
    /// Tunables.
    pub settings: EngineSettings,
    /// Destination resolution and file creation.
    pub storage: Arc<dyn StorageGateway>,
    /// Viewer for `open_file`; without one, opening reports an error event.
    pub file_opener: Option<Arc<dyn FileOpener>>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("settings", &self.settings)
            .field("file_opener", &self.file_opener.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Default settings with the given storage gateway.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageGateway>) -> Self {
        Self {
            settings: EngineSettings::default(),
            storage,
            file_opener: None,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_file_opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.file_opener = Some(opener);
        self
    }
}

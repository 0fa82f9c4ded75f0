//! Store configuration.
//!
//! A [`StoreConfig`] names the database file and tunes how the session
//! talks to SQLite. It can be built in code or loaded from a JSON file:
//!
//! ```json
//! {
//!   "path": "/var/lib/barograph/weather.db",
//!   "journal_mode": "wal",
//!   "synchronous": "normal",
//!   "batch_size": 65535,
//!   "query_chunk_size": 256
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest number of rows committed in one physical transaction.
pub const MAX_BATCH_SIZE: usize = 65_535;

/// Default number of rows fetched per query chunk.
pub const DEFAULT_QUERY_CHUNK_SIZE: usize = 256;

/// Path that opens a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// SQLite `journal_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Write-ahead log.
    #[default]
    Wal,
    /// Rollback journal, deleted after each transaction.
    Delete,
    /// Journal kept in memory.
    Memory,
}

impl JournalMode {
    /// Returns the pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
            Self::Memory => "memory",
        }
    }
}

/// SQLite `synchronous` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sync at every critical moment.
    Full,
    /// Sync less often; safe with WAL.
    #[default]
    Normal,
    /// Never sync.
    Off,
}

impl SyncMode {
    /// Returns the pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
            Self::Off => "off",
        }
    }
}

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file, or `:memory:`.
    pub path: PathBuf,
    /// Journal mode applied on open.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Synchronous level applied on open.
    #[serde(default)]
    pub synchronous: SyncMode,
    /// How long a locked database is retried, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Rows per committed chunk for pushes and summary rebuilds.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows fetched per chunk by range queries.
    #[serde(default = "default_query_chunk_size")]
    pub query_chunk_size: usize,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_query_chunk_size() -> usize {
    DEFAULT_QUERY_CHUNK_SIZE
}

impl StoreConfig {
    /// Default configuration for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            journal_mode: JournalMode::default(),
            synchronous: SyncMode::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
            batch_size: default_batch_size(),
            query_chunk_size: default_query_chunk_size(),
        }
    }

    /// Configuration for a private in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            journal_mode: JournalMode::Memory,
            ..Self::new(IN_MEMORY_PATH)
        }
    }

    /// Sets the committed chunk size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the query chunk size.
    #[must_use]
    pub fn with_query_chunk_size(mut self, chunk_size: usize) -> Self {
        self.query_chunk_size = chunk_size;
        self
    }

    /// True if this configuration opens an in-memory database.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }

    /// Loads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be read or parsed, or [`ConfigError::Invalid`] if a field is
    /// out of range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: format!("must be in 1..={MAX_BATCH_SIZE}, got {}", self.batch_size),
            });
        }
        if self.query_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "query_chunk_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("weather.db");
        assert_eq!(config.batch_size, 65_535);
        assert_eq!(config.query_chunk_size, 256);
        assert_eq!(config.journal_mode, JournalMode::Wal);
        assert!(config.validate().is_ok());
        assert!(StoreConfig::in_memory().is_in_memory());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let err = StoreConfig::new("a.db").with_batch_size(70_000).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "batch_size", .. }));

        let err = StoreConfig::new("a.db").with_batch_size(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "batch_size", .. }));

        let err = StoreConfig::new("a.db").with_query_chunk_size(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "query_chunk_size", .. }));

        let err = StoreConfig::new("").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "path", .. }));
    }

    #[test]
    fn test_load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "path": "x.db", "synchronous": "full", "batch_size": 1000 }"#)
            .unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.path, PathBuf::from("x.db"));
        assert_eq!(config.synchronous, SyncMode::Full);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.query_chunk_size, DEFAULT_QUERY_CHUNK_SIZE);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(StoreConfig::load(&missing), Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(StoreConfig::load(&bad), Err(ConfigError::Parse { .. })));

        let invalid = dir.path().join("invalid.json");
        std::fs::write(&invalid, r#"{ "path": "x.db", "batch_size": 0 }"#).unwrap();
        assert!(matches!(StoreConfig::load(&invalid), Err(ConfigError::Invalid { .. })));
    }
}

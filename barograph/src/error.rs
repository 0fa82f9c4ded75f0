//! Error types for the barograph sensor storage engine.

use thiserror::Error;

use crate::summary::Resolution;

/// The main error type for all barograph operations.
///
/// Validation failures ([`BarographError::NotFound`],
/// [`BarographError::InvalidOperation`],
/// [`BarographError::UnsupportedResolution`]) are always reported before any
/// row is touched. Storage failures during a chunked write are reported as
/// [`BarographError::PartialBatch`] when earlier chunks are already durable.
#[derive(Error, Debug)]
pub enum BarographError {
    /// The named sensor does not exist.
    #[error("sensor '{sensor}' not found")]
    NotFound {
        /// The sensor name that could not be resolved.
        sensor: String,
    },

    /// The request was rejected before any mutation.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] InvalidOperation),

    /// The backing database could not be opened.
    #[error("storage unavailable at '{path}': {source}")]
    StorageUnavailable {
        /// The database path that failed to open.
        path: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// A chunked write failed after some chunks were committed.
    #[error(transparent)]
    PartialBatch(#[from] PartialBatchFailure),

    /// A sensor delete could not clear every dependent table.
    #[error("sensor '{sensor}' partially deleted, failed tables: {failed_tables:?}")]
    PartialDelete {
        /// The sensor being deleted.
        sensor: String,
        /// Tables whose rows could not be removed.
        failed_tables: Vec<&'static str>,
    },

    /// Summaries were requested at a resolution with no backing table.
    #[error("unsupported summary resolution: {resolution}")]
    UnsupportedResolution {
        /// The requested resolution.
        resolution: Resolution,
    },

    /// A stored blob could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The database was written by an incompatible schema version.
    #[error("schema version mismatch: found {found}, expected {expected}")]
    SchemaVersion {
        /// Version recorded in the database.
        found: i64,
        /// Version this build understands.
        expected: i64,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Any other SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Broad classification of a [`BarographError`].
///
/// Lets callers branch on how to react without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Sensor or name unresolved.
    NotFound,
    /// Rejected request; nothing was changed.
    InvalidOperation,
    /// Connection could not be opened.
    StorageUnavailable,
    /// Multi-chunk write or multi-table delete partly applied.
    PartialBatchFailure,
    /// Summary resolution has no backing data.
    UnsupportedResolution,
    /// Corruption, schema mismatch, configuration or other storage error.
    Storage,
}

impl BarographError {
    /// Returns the broad kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            Self::PartialBatch(_) | Self::PartialDelete { .. } => ErrorKind::PartialBatchFailure,
            Self::UnsupportedResolution { .. } => ErrorKind::UnsupportedResolution,
            Self::Codec(_) | Self::SchemaVersion { .. } | Self::Config(_) | Self::Database(_) => {
                ErrorKind::Storage
            }
        }
    }

    pub(crate) fn not_found(sensor: &str) -> Self {
        Self::NotFound {
            sensor: sensor.to_string(),
        }
    }
}

/// Requests rejected before any row is mutated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidOperation {
    /// Corrected range equals the current range.
    #[error("corrected range is identical to the current range")]
    NoChange,

    /// The corrected range would clobber rows outside the current range.
    #[error("adjustment would overwrite {existing} existing readings outside the current range")]
    WouldOverwrite {
        /// Number of foreign rows inside the corrected range.
        existing: u64,
    },

    /// More removals were requested than the current span holds.
    #[error("cannot remove {removals} slots from a span of {span}")]
    ShrinkTooLarge {
        /// Slots to remove.
        removals: i64,
        /// Width of the current range.
        span: i64,
    },

    /// The inserted slots would not fit inside the resulting span.
    #[error("cannot insert {inserts} slots into a resulting span of {resulting_span}")]
    ExpandTooLarge {
        /// Slots to insert.
        inserts: i64,
        /// Width of the corrected range.
        resulting_span: i64,
    },

    /// Sensor names must not be empty.
    #[error("sensor name must not be empty")]
    EmptySensorName,

    /// A wall-clock time does not fit the 32-bit epoch-seconds stamp.
    #[error("timestamp {timestamp} is outside the storable range")]
    TimestampOutOfRange {
        /// The rejected time, as epoch seconds.
        timestamp: i64,
    },
}

/// A chunked write that failed after some of its chunks were committed.
///
/// Committed chunks stay durable. Callers re-issue the write with
/// replace/ignore semantics to reconcile.
#[derive(Error, Debug)]
#[error(
    "batch failed after {chunks_committed} committed chunks ({rows_committed} rows): {source}"
)]
pub struct PartialBatchFailure {
    /// Chunks committed before the failure.
    pub chunks_committed: usize,
    /// Rows contained in those chunks.
    pub rows_committed: usize,
    /// The failure that stopped the batch.
    #[source]
    pub source: rusqlite::Error,
}

/// Errors decoding packed readings or histograms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A packed reading blob is shorter than eight bytes.
    #[error("packed reading needs 8 bytes, got {len}")]
    ShortReading {
        /// Length of the supplied blob.
        len: usize,
    },

    /// A histogram blob ended in the middle of an entry.
    #[error("histogram truncated at byte {offset}")]
    TruncatedHistogram {
        /// Byte offset where input ran out.
        offset: usize,
    },

    /// A varint started with a lead byte this codec never writes.
    #[error("invalid varint lead byte {byte:#04x} at byte {offset}")]
    InvalidVarint {
        /// The offending lead byte.
        byte: u8,
        /// Its byte offset.
        offset: usize,
    },

    /// A histogram bucket index does not fit in 16 bits.
    #[error("histogram bucket {bucket} out of range")]
    BucketOutOfRange {
        /// The decoded bucket index.
        bucket: u32,
    },
}

/// Errors loading or validating a [`StoreConfig`](crate::config::StoreConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds an unusable value.
    #[error("invalid config field '{field}': {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Type alias for `Result<T, BarographError>`.
pub type Result<T> = std::result::Result<T, BarographError>;

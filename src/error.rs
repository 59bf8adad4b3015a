//! Error types for the Tank log engine
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! the failure domains of the storage engine: file I/O (always tagged with the
//! path that failed), on-disk format violations, structural invariant breaches
//! detected while loading a partition, descriptor exhaustion, configuration
//! validation, and cooperative cancellation.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for log engine operations
pub type Result<T> = std::result::Result<T, TankError>;

/// Errors produced by the log engine
#[derive(Debug, Error)]
pub enum TankError {
    /// A file operation failed. Carries the path so operators can tell which
    /// segment or index file is in trouble without correlating logs.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bundle, message set or index file failed to parse, or uses a format
    /// feature this build does not support (unknown codec, wide index entries).
    #[error("malformed {context}: {detail}")]
    Malformed {
        context: &'static str,
        detail: String,
    },

    /// A structural invariant of the partition log was breached on load,
    /// e.g. overlapping segments or a gap between consecutive segments.
    #[error("invariant violated: {invariant}")]
    RangeViolation { invariant: String },

    /// `open()` kept failing with `EMFILE`/`ENFILE` after the retry budget.
    #[error("file descriptors exhausted")]
    FdExhausted,

    /// A configuration key failed validation.
    #[error("invalid value '{value}' for configuration key '{key}'")]
    ConfigInvalid { key: String, value: String },

    /// A requested sequence number is outside the stored range.
    #[error("sequence {seq} out of range [{first_available}, {next})")]
    SeqOutOfRange {
        seq: u64,
        first_available: u64,
        next: u64,
    },

    /// The engine holds no partition under that name.
    #[error("unknown partition {topic}/{partition}")]
    UnknownPartition { topic: String, partition: u16 },

    /// Cooperative stop requested during compaction or iteration.
    #[error("operation cancelled")]
    Cancelled,
}

impl TankError {
    /// Wrap an `io::Error` with the path it occurred on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Shorthand for a [`TankError::Malformed`] with a formatted detail.
    pub fn malformed(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            context,
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`TankError::RangeViolation`].
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::RangeViolation {
            invariant: detail.into(),
        }
    }
}

/// Extension trait tagging raw `io::Result`s with the path they touched.
///
/// The standard library's errors do not carry paths; everything in this crate
/// that touches a file goes through this so that `TankError::Io` is always
/// attributable.
pub(crate) trait IoResultExt<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| TankError::io(path, e))
    }
}

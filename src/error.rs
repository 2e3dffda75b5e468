//! Error types for the vector storage core
//!
//! This module provides structured error types using thiserror for
//! actionable error messages. Cache layers never surface these on lookup;
//! they degrade to a miss and fall through to the authoritative path.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for storage and index operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Embedding dimension does not match the index generation
    #[error(
        "Vector dimension mismatch: index expects {expected} ({}), got {actual} ({})\nSuggestion: Clear the index and reindex with a single embedding model",
        .expected_model.as_deref().unwrap_or("unknown model"),
        .actual_model.as_deref().unwrap_or("unknown model")
    )]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        expected_model: Option<String>,
        actual_model: Option<String>,
    },

    #[error("Vector index is absent or empty. Index some chunks first")]
    IndexAbsentOrEmpty,

    /// Raised by pre-flight checks, before any mutation happens
    #[error("Insufficient memory to grow the index by {requested_bytes} bytes: {reason}")]
    InsufficientMemory { requested_bytes: usize, reason: String },

    #[error("Storage at '{path}' is corrupted: {reason}")]
    StorageCorruption { path: PathBuf, reason: String },

    #[error("Consistency check failed with {} issue(s): {}", .issues.len(), .issues.join("; "))]
    ConsistencyFault { issues: Vec<String> },

    #[error("Unsupported index kind '{0}'. Supported kinds: flat, ivf, ivf<nlist>")]
    UnsupportedIndexKind(String),

    #[error("Chunk '{0}' is already indexed. Remove it before adding it again")]
    DuplicateChunk(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Shorthand for wrapping an io error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Dimension mismatch without model information.
    pub fn dimension(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            expected,
            actual,
            expected_model: None,
            actual_model: None,
        }
    }

    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::IndexAbsentOrEmpty => "INDEX_ABSENT_OR_EMPTY",
            Self::InsufficientMemory { .. } => "INSUFFICIENT_MEMORY",
            Self::StorageCorruption { .. } => "STORAGE_CORRUPTION",
            Self::ConsistencyFault { .. } => "CONSISTENCY_FAULT",
            Self::UnsupportedIndexKind(_) => "UNSUPPORTED_INDEX_KIND",
            Self::DuplicateChunk(_) => "DUPLICATE_CHUNK",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io { .. } => "IO_ERROR",
            Self::Metadata(_) => "METADATA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::DimensionMismatch { .. } => vec![
                "Run 'codevec clear' and reindex with the configured embedding model",
                "Check that every ingestion path uses the same model",
            ],
            Self::IndexAbsentOrEmpty => vec!["Index the project before searching"],
            Self::InsufficientMemory { .. } => vec![
                "Raise vector.memory_limit_mb or free memory before retrying",
                "Nothing was written, the index is unchanged",
            ],
            Self::StorageCorruption { .. } => vec![
                "The artifact was ignored; rebuild it by reindexing",
                "Check for disk errors or interrupted writes",
            ],
            Self::ConsistencyFault { .. } => vec![
                "Reindex the stale entries, or run 'codevec clear' and reindex",
            ],
            Self::Io { .. } => vec!["Check disk space and permissions in the index directory"],
            _ => vec![],
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

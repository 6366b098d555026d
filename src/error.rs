//! Error taxonomy for indexing and retrieval.
//!
//! Library functions return [`Result`], an alias over [`RagError`]. The
//! CLI command functions wrap these in `anyhow` at the edge.
//!
//! | Variant | Raised by | Fatal? |
//! |---------|-----------|--------|
//! | [`Configuration`](RagError::Configuration) | config loading, chunker construction | yes, before any I/O |
//! | [`Provider`](RagError::Provider) | embedding calls | aborts the run, nothing persisted |
//! | [`DimensionMismatch`](RagError::DimensionMismatch) | embedding client, vector index | aborts the run |
//! | [`DuplicateId`](RagError::DuplicateId) | vector index `add` | integrity bug |
//! | [`NotIndexed`](RagError::NotIndexed) | retriever open | surfaced as "no data available" |
//! | [`MissingSourceFile`](RagError::MissingSourceFile) | document loading | per-hit skip during retrieval |

use std::path::PathBuf;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Invalid chunking, embedding, or retrieval parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding provider failed or returned malformed output.
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// A vector's length disagrees with the established dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An id was added to the vector index twice.
    #[error("vector id {0} already exists in the index")]
    DuplicateId(u64),

    /// Retrieval was attempted before any index was persisted.
    #[error("no index found at {}", .0.display())]
    NotIndexed(PathBuf),

    /// A document backing an index entry could not be read.
    #[error("source document missing or unreadable: {}", .0.display())]
    MissingSourceFile(PathBuf),

    /// The metadata sidecar and the vector file disagree, or the stored
    /// chunking profile / embedding model no longer matches the config.
    #[error("index mismatch: {0}")]
    IndexMismatch(String),

    /// A persisted file failed structural or checksum validation.
    #[error("corrupt index file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Another indexing run holds the lock file.
    #[error("index is locked by another run ({})", .0.display())]
    Locked(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RagError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider(message.into())
    }

    pub fn corrupt<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

//! Errors from the arena, the chunk sink and the blob stores.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no blob under key {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything the S3 SDK reports that is not a missing object.
    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A read or write fell outside the arena's grown memory.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("arena exhausted: cannot allocate {requested} bytes (limit {limit})")]
    ArenaExhausted { requested: u64, limit: u64 },

    /// Persisted ranges do not fit the page file they were restored over.
    #[error("arena corrupt: {0}")]
    ArenaCorrupt(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
///
/// The variants are the failure classes every public upload and serving
/// operation reports to its caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("chunk index {index} out of range (session declares {declared} chunks)")]
    OutOfRange { index: u32, declared: u32 },

    #[error("incomplete upload: received {received} of {declared} chunks")]
    IncompleteUpload { received: u32, declared: u32 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

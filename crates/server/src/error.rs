//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keepsake_metadata::MetadataError;
use keepsake_storage::StorageError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
///
/// Every upload and serving operation reports one of these. The first eight
/// variants mirror [`keepsake_core::Error`] one to one.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
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

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::OutOfRange { .. } => "out_of_range",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::Conflict(_) => "conflict",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Storage(StorageError::NotFound(_)) => "not_found",
            Self::Storage(StorageError::ArenaExhausted { .. }) => "insufficient_storage",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::OutOfRange { .. } => StatusCode::BAD_REQUEST,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SizeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::ArenaExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<keepsake_core::Error> for ApiError {
    fn from(err: keepsake_core::Error) -> Self {
        use keepsake_core::Error;
        match err {
            Error::InvalidArgument(msg) => Self::InvalidArgument(msg),
            Error::Unauthorized(msg) => Self::Unauthorized(msg),
            Error::NotFound(msg) => Self::NotFound(msg),
            Error::OutOfRange { index, declared } => Self::OutOfRange { index, declared },
            Error::IncompleteUpload { received, declared } => {
                Self::IncompleteUpload { received, declared }
            }
            Error::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            Error::SizeMismatch { expected, actual } => Self::SizeMismatch { expected, actual },
            Error::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(msg) => Self::NotFound(msg),
            MetadataError::AlreadyExists(msg) => Self::Conflict(msg),
            MetadataError::InvalidStateTransition { from, to } => {
                Self::Conflict(format!("session is {from}, cannot move to {to}"))
            }
            other => Self::Metadata(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

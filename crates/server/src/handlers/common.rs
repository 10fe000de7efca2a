//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use axum::body::{Body, to_bytes};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_LENGTH;
use serde::de::DeserializeOwned;

/// Maximum request body size for JSON control requests (1 MiB).
pub const MAX_JSON_BODY_SIZE: usize = 1024 * 1024;

/// Decode a JSON control request.
pub fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::InvalidArgument(format!("invalid JSON: {e}")))
}

/// Read and decode a JSON body of at most [`MAX_JSON_BODY_SIZE`] bytes.
pub async fn read_json<T: DeserializeOwned>(body: Body) -> ApiResult<T> {
    let bytes = to_bytes(body, MAX_JSON_BODY_SIZE)
        .await
        .map_err(|e| ApiError::InvalidArgument(format!("failed to read body: {e}")))?;
    parse_json(&bytes)
}

/// The declared `Content-Length`, if present and well-formed.
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

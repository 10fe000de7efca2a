//! Asset handlers: listing, serving, derivative ingestion and deletion.

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::declared_length;
use crate::service::DerivativeOptions;
use crate::state::AppState;
use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use keepsake_core::{
    Asset, AssetDescriptor, AssetVariant, ContentHash, DeleteMemoryResponse, ListAssetsResponse,
    MemoryId,
};
use serde::Deserialize;

/// Header naming the tier an asset was served from.
pub const TIER_HEADER: &str = "x-keepsake-tier";

/// Header carrying the expected SHA-256 (hex) of a derivative body.
pub const SHA256_HEADER: &str = "x-keepsake-sha256";

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// GET /v1/memories/{memory_id}/assets - Describe every asset of a memory.
pub async fn list_assets(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(memory_id): Path<String>,
) -> ApiResult<Json<ListAssetsResponse>> {
    let memory_id = MemoryId::parse(&memory_id)?;
    let assets = state.resolver.list(&caller, memory_id).await?;
    Ok(Json(ListAssetsResponse {
        memory_id,
        assets: assets.iter().map(Asset::descriptor).collect(),
    }))
}

/// GET /v1/memories/{memory_id}/assets/{variant} - Stream the resolved asset.
pub async fn get_asset(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((memory_id, variant)): Path<(String, String)>,
) -> ApiResult<Response> {
    let memory_id = MemoryId::parse(&memory_id)?;
    let asset = state.resolver.resolve(&caller, memory_id, &variant).await?;
    serve_asset(&state, &asset).await
}

/// GET /v1/memories/{memory_id}/assets/{variant}/inline - Serve only the inline copy.
pub async fn get_inline_asset(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((memory_id, variant)): Path<(String, String)>,
) -> ApiResult<Response> {
    let memory_id = MemoryId::parse(&memory_id)?;
    let asset = state
        .resolver
        .resolve_inline(&caller, memory_id, &variant)
        .await?;
    serve_asset(&state, &asset).await
}

async fn serve_asset(state: &AppState, asset: &Asset) -> ApiResult<Response> {
    let stream = state.resolver.open(asset).await?;
    let content_type = HeaderValue::from_str(&asset.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE));

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, asset.byte_size)
        .header(ETAG, format!("\"{}\"", asset.sha256.to_hex()))
        .header(TIER_HEADER, asset.tier().as_str())
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("failed to build response: {e}")))
}

/// Query parameters of a derivative upload.
#[derive(Debug, Default, Deserialize)]
pub struct DerivativeQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub replace: bool,
    /// Comma-separated tags.
    pub tags: Option<String>,
}

impl DerivativeQuery {
    fn tags(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// PUT /v1/memories/{memory_id}/assets/{variant} - Store a derivative in one request.
///
/// The body is buffered, so it is capped at the internal tier threshold.
/// Larger payloads go through a chunked upload session.
#[tracing::instrument(skip_all, fields(caller = %caller))]
pub async fn put_asset(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((memory_id, variant)): Path<(String, String)>,
    Query(query): Query<DerivativeQuery>,
    req: Request,
) -> ApiResult<(StatusCode, Json<AssetDescriptor>)> {
    let memory_id = MemoryId::parse(&memory_id)?;
    let variant = AssetVariant::parse(&variant)?;
    let max_body = state.config.tiering.internal_max_bytes;

    if let Some(len) = declared_length(req.headers())
        && len > max_body
    {
        return Err(ApiError::PayloadTooLarge(format!(
            "body of {len} bytes exceeds the limit of {max_body} bytes; use a chunked upload"
        )));
    }

    let headers = req.headers();
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_string();
    let expected_sha256 = headers
        .get(SHA256_HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::InvalidArgument(format!("{SHA256_HEADER} is not ASCII")))
                .and_then(|hex| ContentHash::from_hex(hex.trim()).map_err(ApiError::from))
        })
        .transpose()?;

    let limit = usize::try_from(max_body).unwrap_or(usize::MAX);
    let data = to_bytes(req.into_body(), limit).await.map_err(|e| {
        ApiError::PayloadTooLarge(format!("failed to read body within {max_body} bytes: {e}"))
    })?;

    let options = DerivativeOptions {
        mime_type,
        expected_sha256,
        tags: query.tags(),
        width: query.width,
        height: query.height,
        replace: query.replace,
    };
    let asset = state
        .assets
        .ingest(&caller, memory_id, variant, data, options)
        .await?;
    Ok((StatusCode::CREATED, Json(asset.descriptor())))
}

/// DELETE /v1/memories/{memory_id} - Delete a memory and every asset it owns.
pub async fn delete_memory(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(memory_id): Path<String>,
) -> ApiResult<Json<DeleteMemoryResponse>> {
    let memory_id = MemoryId::parse(&memory_id)?;
    let deleted = state.assets.delete_memory(&caller, memory_id).await?;
    Ok(Json(DeleteMemoryResponse {
        memory_id,
        deleted_assets: deleted as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivative_tags_are_split_and_trimmed() {
        let query = DerivativeQuery {
            tags: Some(" beach, ,2024 ,".to_string()),
            ..DerivativeQuery::default()
        };
        assert_eq!(query.tags(), vec!["beach".to_string(), "2024".to_string()]);
        assert!(DerivativeQuery::default().tags().is_empty());
    }
}

//! Upload session handlers.
//!
//! Chunk bodies are raw `application/octet-stream` bytes and are never
//! decoded as text. The finish digest travels as 64 hex characters.

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{declared_length, read_json};
use crate::state::AppState;
use axum::Json;
use axum::body::to_bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use keepsake_core::upload::{
    BeginUploadRequest, BeginUploadResponse, FinishUploadRequest, FinishUploadResponse,
    PutChunkResponse, UploadStatusResponse,
};
use keepsake_core::{ContentHash, SessionId};

/// POST /v1/uploads - Begin (or resume) an upload session.
///
/// Answers 201 for a new session and 200 when the idempotency key resumed
/// an existing one.
#[tracing::instrument(skip_all, fields(caller = %caller))]
pub async fn begin_upload(
    State(state): State<AppState>,
    Caller(caller): Caller,
    req: Request,
) -> ApiResult<(StatusCode, Json<BeginUploadResponse>)> {
    let body: BeginUploadRequest = read_json(req.into_body()).await?;

    let begun = state
        .uploads
        .begin(
            &caller,
            body.capsule_id,
            body.chunk_count,
            &body.idempotency_key,
            body.asset,
        )
        .await?;

    let status = if begun.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(BeginUploadResponse {
            session_id: begun.session.id,
            expires_at: begun.session.expires_at,
            resumed: begun.resumed,
            state: begun.session.state,
        }),
    ))
}

/// GET /v1/uploads/{session_id} - Session progress and missing chunk indices.
pub async fn get_upload(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(session_id): Path<String>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let session_id = SessionId::parse(&session_id)?;
    let status = state.uploads.sessions().status(session_id, &caller).await?;
    Ok(Json(status))
}

/// PUT /v1/uploads/{session_id}/chunks/{chunk_index} - Store one chunk.
#[tracing::instrument(skip_all, fields(caller = %caller))]
pub async fn put_chunk(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((session_id, chunk_index)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Json<PutChunkResponse>> {
    let session_id = SessionId::parse(&session_id)?;
    let chunk_index: u32 = chunk_index
        .parse()
        .map_err(|e| ApiError::InvalidArgument(format!("invalid chunk index: {e}")))?;
    let max_chunk_size = state.config.server.max_chunk_size;

    if let Some(len) = declared_length(req.headers())
        && len > max_chunk_size
    {
        return Err(ApiError::InvalidArgument(format!(
            "chunk of {len} bytes exceeds the limit of {max_chunk_size} bytes"
        )));
    }
    let limit = usize::try_from(max_chunk_size).unwrap_or(usize::MAX);
    let data = to_bytes(req.into_body(), limit).await.map_err(|e| {
        ApiError::InvalidArgument(format!(
            "failed to read chunk body within {max_chunk_size} bytes: {e}"
        ))
    })?;

    let progress = state
        .uploads
        .put_chunk(&caller, session_id, chunk_index, data)
        .await?;
    Ok(Json(progress))
}

/// POST /v1/uploads/{session_id}/finish - Verify and store the upload.
#[tracing::instrument(skip_all, fields(caller = %caller))]
pub async fn finish_upload(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(session_id): Path<String>,
    req: Request,
) -> ApiResult<Json<FinishUploadResponse>> {
    let session_id = SessionId::parse(&session_id)?;
    let body: FinishUploadRequest = read_json(req.into_body()).await?;
    let expected = ContentHash::from_hex(&body.expected_sha256)?;

    let result = state
        .uploads
        .finish(&caller, session_id, expected, body.total_length)
        .await?;
    Ok(Json(result))
}

/// DELETE /v1/uploads/{session_id} - Abort an upload.
pub async fn abort_upload(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_id = SessionId::parse(&session_id)?;
    state.uploads.abort(&caller, session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

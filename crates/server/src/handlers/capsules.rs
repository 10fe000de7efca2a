//! Capsule handlers.

use crate::auth::Caller;
use crate::error::ApiResult;
use crate::handlers::common::read_json;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use keepsake_core::capsule::{CreateCapsuleResponse, GrantWriterRequest};
use keepsake_core::{CapsuleId, Principal};

/// POST /v1/capsules - Create a capsule owned by the caller.
pub async fn create_capsule(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<(StatusCode, Json<CreateCapsuleResponse>)> {
    let capsule = state.capsules.create_capsule(&caller).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateCapsuleResponse {
            capsule_id: CapsuleId::from_uuid(capsule.capsule_id),
            owner: capsule.owner,
            created_at: capsule.created_at,
        }),
    ))
}

/// POST /v1/capsules/{capsule_id}/writers - Let another principal write.
pub async fn grant_writer(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(capsule_id): Path<String>,
    req: Request,
) -> ApiResult<StatusCode> {
    let capsule_id = CapsuleId::parse(&capsule_id)?;
    let body: GrantWriterRequest = read_json(req.into_body()).await?;
    let principal = Principal::parse(&body.principal)?;

    state
        .capsules
        .grant_writer(&caller, capsule_id, &principal)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

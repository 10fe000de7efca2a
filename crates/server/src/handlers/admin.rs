//! Health, capability discovery and maintenance handlers.

use crate::auth::Caller;
use crate::error::ApiResult;
use crate::service::SweepStats;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health - Health check (unauthenticated, for load balancers).
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Limits a client needs to plan an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub max_chunk_size: u64,
    pub default_chunk_size: u64,
    pub max_chunk_count: u32,
    pub inline_max_bytes: u64,
    pub internal_max_bytes: u64,
    pub external_tier: bool,
    pub api_version: String,
}

/// GET /v1/capabilities - Upload limits and tier thresholds.
pub async fn get_capabilities(
    State(state): State<AppState>,
    Caller(_caller): Caller,
) -> Json<CapabilitiesResponse> {
    let server = &state.config.server;
    Json(CapabilitiesResponse {
        max_chunk_size: server.max_chunk_size,
        default_chunk_size: keepsake_core::DEFAULT_CHUNK_SIZE.min(server.max_chunk_size),
        max_chunk_count: server.max_chunk_count,
        inline_max_bytes: state.config.tiering.inline_max_bytes,
        internal_max_bytes: state.config.tiering.internal_max_bytes,
        external_tier: state.assets.has_external_tier(),
        api_version: "v1".to_string(),
    })
}

/// POST /v1/admin/sweep - Run the expiry sweep now.
pub async fn run_sweep(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Json<SweepStats>> {
    tracing::info!(caller = %caller, "On-demand expiry sweep");
    let stats = state.sweeper.run_once().await?;
    Ok(Json(stats))
}

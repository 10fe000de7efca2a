//! Bearer-token authentication.
//!
//! The middleware turns an `Authorization: Bearer <token>` header into a
//! [`Caller`] request extension. Handlers take `Caller` as an extractor and
//! pass the principal on explicitly; services never look at the request.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use keepsake_core::{ContentHash, Principal};
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for client-supplied trace IDs.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a client-provided ID, truncated and limited to printable ASCII.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic())
            .collect();
        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

/// The authenticated principal of a request.
#[derive(Clone, Debug)]
pub struct Caller(pub Principal);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Caller>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthenticated("a valid bearer token is required".to_string()))
    }
}

/// Extract the bearer token. The scheme name is case-insensitive (RFC 6750).
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_default()
}

/// Hash a bearer token the way token hashes are stored.
pub fn hash_token(token: &str) -> String {
    ContentHash::compute(token.as_bytes()).to_hex()
}

/// Resolve the bearer token, if any, and run the request in a traced span.
///
/// A missing or unknown token leaves the request anonymous; routes that need
/// a caller reject it through the [`Caller`] extractor. A revoked token is
/// rejected outright.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let span = tracing::info_span!("request", trace_id = %trace_id.0);
    req.extensions_mut().insert(trace_id);

    if let Some(token) = extract_bearer_token(&req)
        && let Some(row) = state.metadata.get_token_by_hash(&hash_token(token)).await?
    {
        if row.revoked_at.is_some() {
            return Err(ApiError::Unauthenticated("token has been revoked".to_string()));
        }
        let principal = Principal::parse(&row.principal).map_err(|e| {
            ApiError::Internal(format!("token {} has a malformed principal: {e}", row.token_id))
        })?;

        let metadata = state.metadata.clone();
        let used_at = state.clock.now();
        tokio::spawn(async move {
            if let Err(e) = metadata.touch_token(row.token_id, used_at).await {
                tracing::debug!(error = %e, "Failed to record token use");
            }
        });

        req.extensions_mut().insert(Caller(principal));
    }

    Ok(next.run(req).instrument(span).await)
}

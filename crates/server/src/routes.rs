//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/v1/capabilities", get(handlers::get_capabilities))
        // Capsules
        .route("/v1/capsules", post(handlers::create_capsule))
        .route(
            "/v1/capsules/{capsule_id}/writers",
            post(handlers::grant_writer),
        )
        // Upload sessions
        .route("/v1/uploads", post(handlers::begin_upload))
        .route(
            "/v1/uploads/{session_id}",
            get(handlers::get_upload).delete(handlers::abort_upload),
        )
        .route(
            "/v1/uploads/{session_id}/chunks/{chunk_index}",
            put(handlers::put_chunk),
        )
        .route(
            "/v1/uploads/{session_id}/finish",
            post(handlers::finish_upload),
        )
        // Memories and their assets
        .route("/v1/memories/{memory_id}", delete(handlers::delete_memory))
        .route(
            "/v1/memories/{memory_id}/assets",
            get(handlers::list_assets),
        )
        .route(
            "/v1/memories/{memory_id}/assets/{variant}",
            get(handlers::get_asset).put(handlers::put_asset),
        )
        .route(
            "/v1/memories/{memory_id}/assets/{variant}/inline",
            get(handlers::get_inline_asset),
        )
        // Maintenance
        .route("/v1/admin/sweep", post(handlers::run_sweep))
        // Health check (unauthenticated for load balancers/k8s probes)
        .route("/health", get(handlers::health_check));

    let mut router = Router::new().merge(api_routes);

    // When enabled, this endpoint should be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

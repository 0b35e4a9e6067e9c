//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/builds", get(handlers::list_builds))
        .route("/api/builds/{id}", get(handlers::get_build))
        .route("/api/statistics", get(handlers::get_statistics))
        .route(
            "/api/uploads",
            get(handlers::list_uploads).post(handlers::request_upload),
        )
        .route("/api/uploads/{id}", get(handlers::get_upload))
        .route("/health", get(handlers::health_check));

    let mut router = Router::new().merge(api_routes);

    // Must be network-restricted when enabled; see crate::metrics.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

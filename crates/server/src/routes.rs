//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::{API_VERSION_HEADER, API_VERSION_VALUE};
use axum::Router;
use axum::http::HeaderValue;
use axum::middleware::map_response;
use axum::response::Response;
use axum::routing::get;
use tower_http::trace::TraceLayer;

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        API_VERSION_HEADER,
        HeaderValue::from_static(API_VERSION_VALUE),
    );
    response
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(handlers::base::api_version_check))
        .route("/token", get(handlers::base::issue_token))
        // intentionally unauthenticated for load balancers / k8s probes
        .route("/healthz", get(handlers::base::health_check))
        .route("/metrics", get(metrics_handler))
        // repository names contain slashes, so everything else under /v2/
        // goes through the dispatcher
        .fallback(handlers::registry_fallback)
        .layer(map_response(add_version_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

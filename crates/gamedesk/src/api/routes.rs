//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{Router, routing::get};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{instance_id}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from the configured origins.
///
/// With no origins configured every cross-origin request is denied.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN];

    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
}

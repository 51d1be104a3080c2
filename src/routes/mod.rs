//! Router assembly: HTTP endpoints, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router with:
/// - exercise issuance under `/api/v1/exercises/...`
/// - pool administration and statistics under `/api/v1/pool/...`
/// - CORS (allow any origin/method/headers), adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/exercises/next", post(http::http_next_exercise))
        .route("/api/v1/exercises/:id", get(http::http_get_exercise))
        .route("/api/v1/pool/stats", get(http::http_pool_stats))
        .route("/api/v1/pool/warm-up", post(http::http_warm_up))
        .route("/api/v1/pool/maintenance", post(http::http_run_maintenance))
        .route("/api/v1/pool/templates/:id/available", get(http::http_template_available))
        .route("/api/v1/pool/templates/:id/stats", get(http::http_template_stats))
        .route("/api/v1/pool/templates/:id/generate", post(http::http_generate))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

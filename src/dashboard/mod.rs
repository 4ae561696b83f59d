//! Dashboard HTTP API and WebSocket feed.

mod auth;
mod routes;
mod ws;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::Request,
    middleware,
    routing::{get, post},
};
use secrecy::SecretString;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::Span;

use crate::events::EventHub;
use crate::health::HealthProbe;
use crate::pipeline::PipelineScheduler;
use crate::review::ReviewWorkflow;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<ReviewWorkflow>,
    pub scheduler: Arc<PipelineScheduler>,
    pub health: Arc<HealthProbe>,
    pub events: EventHub,
    /// Bearer token for `/api/*` and `/ws`. Open access when `None`.
    pub app_secret: Option<SecretString>,
}

/// Build the Axum router with the REST routes, WebSocket feed and health check.
pub fn dashboard_routes(state: AppState) -> Router {
    let protected = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/emails", get(routes::list_emails))
        .route(
            "/api/emails/{id}",
            get(routes::get_email).patch(routes::update_email),
        )
        .route("/api/emails/{id}/regenerate", post(routes::regenerate_email))
        .route("/api/emails/{id}/send", post(routes::send_email))
        .route("/api/pipeline/run", post(routes::run_pipeline))
        .route("/api/scheduler", get(routes::scheduler_status))
        .route("/api/scheduler/pause", post(routes::pause_scheduler))
        .route("/api/scheduler/resume", post(routes::resume_scheduler))
        .route("/api/stats", get(routes::stats))
        .route("/api/options", get(routes::options))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request span without the query string, which may carry the access token.
fn request_span(request: &Request<Body>) -> Span {
    tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

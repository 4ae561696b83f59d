//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use crate::error::WorkflowError;
use crate::pipeline::TriggerOutcome;
use crate::review::{EmailStatus, Intent, RecordUpdate, Tone};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error response: `{"error": "..."}`.
pub(super) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        let status = match &err {
            WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
            WorkflowError::InvalidTransition { .. }
            | WorkflowError::AlreadySent { .. }
            | WorkflowError::NotApproved { .. } => StatusCode::CONFLICT,
            WorkflowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WorkflowError::Drafting(_) | WorkflowError::Transport(_) => StatusCode::BAD_GATEWAY,
            WorkflowError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid email ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct HealthQuery {
    #[serde(default)]
    deep: bool,
}

pub(super) async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> impl IntoResponse {
    let report = state.health.check(query.deep).await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// ── Emails ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

pub(super) async fn list_emails(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<EmailStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let emails = state.workflow.list(status, limit).await?;
    Ok(Json(emails))
}

pub(super) async fn get_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.workflow.get(id).await?))
}

pub(super) async fn update_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<RecordUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.workflow.edit(id, update).await?))
}

#[derive(Debug, Deserialize)]
pub(super) struct RegenerateRequest {
    tone: String,
}

pub(super) async fn regenerate_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RegenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.workflow.regenerate(id, &body.tone).await?))
}

pub(super) async fn send_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.workflow.send(id).await?))
}

pub(super) async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.workflow.stats().await?))
}

pub(super) async fn options() -> impl IntoResponse {
    let tones: Vec<_> = Tone::KNOWN
        .iter()
        .map(|t| json!({"value": t.label(), "description": t.description()}))
        .collect();
    let intents: Vec<_> = Intent::KNOWN
        .iter()
        .map(|i| json!({"value": i.label(), "description": i.description()}))
        .collect();
    let statuses: Vec<_> = EmailStatus::ALL.iter().map(|s| s.as_str()).collect();
    Json(json!({
        "tones": tones,
        "intents": intents,
        "statuses": statuses,
    }))
}

// ── Pipeline & scheduler ────────────────────────────────────────────────

pub(super) async fn run_pipeline(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.trigger_manual() {
        TriggerOutcome::Started => {
            info!("Manual pipeline run started");
            (StatusCode::ACCEPTED, Json(json!({"status": "started"})))
        }
        TriggerOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(json!({"error": "pipeline already running"})),
        ),
    }
}

pub(super) async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}

pub(super) async fn pause_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.pause();
    Json(state.scheduler.status().await)
}

pub(super) async fn resume_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.resume();
    Json(state.scheduler.status().await)
}

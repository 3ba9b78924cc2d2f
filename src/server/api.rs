use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bskit_common::{SessionId, SessionStatus};
use serde::{Deserialize, Serialize};

use crate::errors::BuildError;
use crate::service::BuildService;

pub struct AppState {
    pub service: BuildService,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBuildRequest {
    pub target_directory: String,
    pub platform: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBuildResponse {
    pub session_id: SessionId,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Validation(msg) => ApiError::BadRequest(msg),
            BuildError::AlreadyRunning { .. } => ApiError::Conflict(err.to_string()),
            BuildError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            BuildError::Spawn { .. } | BuildError::Other(_) => {
                tracing::error!(error = %err, "build request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

/// Malformed ids can never name a session, so they are reported as 404.
pub(crate) fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Build session {} not found", raw)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/builds", get(list_builds).post(start_build))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/cancel", post(cancel_build))
}

async fn health() -> &'static str {
    "ok"
}

async fn list_builds(State(state): State<SharedState>) -> Json<Vec<SessionStatus>> {
    Json(state.service.list_sessions())
}

async fn start_build(
    State(state): State<SharedState>,
    Json(req): Json<StartBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = state
        .service
        .start_build(&req.target_directory, &req.platform)
        .await?;
    Ok((StatusCode::CREATED, Json(StartBuildResponse { session_id })))
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.service.session_status(id)?))
}

async fn cancel_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    state.service.cancel_build(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ─────────────────────────────────────────────────────────────

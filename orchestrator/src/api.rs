//! Task API: REST surface over the orchestrator
//!
//! Every error leaves as `{"error": {"code": ..., "message": ...}}` with the
//! status from `OrchestratorError::http_status`.

use axum::{
    body::Bytes,
    extract::rejection::QueryRejection,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assembler::ScriptFormat;
use crate::error::OrchestratorError;
use crate::orchestrator::RebuildOrchestrator;
use crate::registry::{TaskFilter, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::rule::RuleRecord;
use crate::stats::RuleStats;
use crate::task::{RebuildTask, TaskStatus};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RebuildOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: RebuildOrchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Error wrapper rendering the JSON envelope
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(OrchestratorError::validation("query", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router with tracing and CORS layers
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers/:server_id/rules", get(server_rules))
        .route("/servers/:server_id/script", get(server_script))
        .route("/servers/:server_id/rebuild", post(trigger_rebuild))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .route("/stats", get(rule_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `listen` until `shutdown` fires
pub async fn serve(
    listen: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Task API listening on http://{listen}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// --- API Types ---

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_tasks: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RebuildRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksQuery {
    pub server_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<RebuildTask>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScriptQuery {
    pub format: Option<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub server_id: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// --- Handlers ---

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        active_tasks: state.orchestrator.active_tasks(),
    })
}

pub async fn server_rules(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<Json<Vec<RuleRecord>>> {
    Ok(Json(state.orchestrator.server_rules(&server_id)?))
}

/// Plain-text script preview; the fingerprint travels in a header
pub async fn server_script(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    query: std::result::Result<Query<ScriptQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let format = match non_blank(query.format) {
        Some(f) => f.parse::<ScriptFormat>()?,
        None => ScriptFormat::default(),
    };

    let script = state.orchestrator.preview(&server_id, format, query.all)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::HeaderName::from_static("x-script-fingerprint"),
                script.fingerprint,
            ),
        ],
        script.text,
    )
        .into_response())
}

/// An empty body means defaults; anything else must be a valid request
fn parse_rebuild_request(body: &[u8]) -> Result<RebuildRequest, OrchestratorError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RebuildRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::validation("body", format!("invalid rebuild request: {e}")))
}

/// Accepts an optional `{"force": bool}` body and answers 202 with the new task
pub async fn trigger_rebuild(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<RebuildTask>)> {
    let request = parse_rebuild_request(&body)?;
    let task = state.orchestrator.trigger(&server_id, request.force)?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListTasksQuery>, QueryRejection>,
) -> ApiResult<Json<TaskPage>> {
    let Query(query) = query?;
    let status = match non_blank(query.status) {
        Some(s) => Some(s.parse::<TaskStatus>()?),
        None => None,
    };
    let filter = TaskFilter {
        server_id: non_blank(query.server_id),
        status,
    };
    let limit = match query.limit.unwrap_or(0) {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    };
    let offset = query.offset.unwrap_or(0);

    let (tasks, total) = state.orchestrator.list_tasks(&filter, limit, offset);
    Ok(Json(TaskPage {
        tasks,
        total,
        limit,
        offset,
    }))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<RebuildTask>> {
    Ok(Json(state.orchestrator.get_task(&task_id)?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<RebuildTask>> {
    Ok(Json(state.orchestrator.cancel(&task_id)?))
}

pub async fn rule_stats(
    State(state): State<AppState>,
    query: std::result::Result<Query<StatsQuery>, QueryRejection>,
) -> ApiResult<Json<RuleStats>> {
    let Query(query) = query?;
    let server_id = non_blank(query.server_id);
    Ok(Json(state.orchestrator.stats(server_id.as_deref())?))
}

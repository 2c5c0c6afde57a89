//! HTTP route handlers for the UI API.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use phaseloop::core::status::StatusSnapshot;
use phaseloop::core::types::RunMode;
use phaseloop::engine::LoopHandle;
use phaseloop::io::plan_store::{FilePlanStore, PlanStore};
use phaseloop::io::status_sink::read_latest_status;
use phaseloop::launch::{RunOverrides, launch};
use phaseloop::plan::Task;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/plan", get(get_plan))
        .route("/plan/tasks", post(add_task))
        .route("/start", post(start_session))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/step", post(step))
        .route("/stop", post(stop))
        .route("/mode", post(set_mode))
}

/// Error response: status code plus `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn no_session() -> Self {
        Self::new(StatusCode::NOT_FOUND, "no session has been started")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Run file work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - live session status, or the last persisted snapshot.
async fn get_status(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, ApiError> {
    if let Some(handle) = state.session() {
        return Ok(Json(handle.get_status()));
    }
    let path = state.paths().status_path;
    let snapshot = blocking(move || Ok(read_latest_status(&path)?)).await?;
    snapshot
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no status recorded yet"))
}

#[derive(Serialize)]
struct PlanResponse {
    path: String,
    pending: usize,
    tasks: Vec<Task>,
}

fn plan_response(store: &FilePlanStore) -> Result<PlanResponse, ApiError> {
    let plan = store.load()?;
    Ok(PlanResponse {
        path: store.path().display().to_string(),
        pending: plan.pending_count(),
        tasks: plan.tasks(),
    })
}

/// GET /api/plan - tasks in plan order.
async fn get_plan(State(state): State<AppState>) -> Result<Json<PlanResponse>, ApiError> {
    blocking(move || {
        let store = state.project()?.plan_store();
        if !store.path().exists() {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "plan file not found"));
        }
        plan_response(&store)
    })
    .await
    .map(Json)
}

#[derive(Deserialize)]
struct AddTaskRequest {
    description: String,
}

/// POST /api/plan/tasks - append a pending task and wake an idle session.
async fn add_task(
    State(state): State<AppState>,
    Json(body): Json<AddTaskRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), ApiError> {
    let description = body.description.trim().to_string();
    if description.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "task description must not be empty",
        ));
    }
    let plan = blocking(move || {
        let store = state.project()?.plan_store();
        store.append_task(&description)?;
        info!(task = %description, "task added");
        if let Some(handle) = state.session() {
            handle.notify_plan_changed();
        }
        plan_response(&store)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartRequest {
    prompt: Option<String>,
    min_cycles: Option<u32>,
    max_cycles: Option<u32>,
    model: Option<String>,
    mode: Option<RunMode>,
}

/// POST /api/start - start a session unless one is already running.
async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<StatusSnapshot>), ApiError> {
    let _starting = state.lock_start().await;
    if state.has_live_session() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "a session is already running",
        ));
    }
    let overrides = RunOverrides {
        prompt: body.prompt,
        min_cycles: body.min_cycles,
        max_cycles: body.max_cycles,
        model: body.model,
        mode: body.mode,
    };
    let root = state.project_dir.clone();
    let sink = state.broadcast_sink();
    let handle = tokio::task::spawn_blocking(move || {
        launch(&root, &overrides, Some(Box::new(sink)))
    })
    .await
    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
    .map_err(|err| {
        warn!(err = %format!("{err:#}"), "session failed to start");
        ApiError::new(StatusCode::BAD_REQUEST, format!("{err:#}"))
    })?;

    let status = handle.get_status();
    info!(mode = %status.mode, "session started");
    state.set_session(handle);
    Ok((StatusCode::CREATED, Json(status)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeedbackRequest {
    feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: RunMode,
}

#[derive(Serialize)]
struct ControlResponse {
    /// False when the request did not apply in the current state.
    changed: bool,
    status: StatusSnapshot,
}

fn control(
    state: &AppState,
    apply: impl FnOnce(&LoopHandle) -> bool,
) -> Result<Json<ControlResponse>, ApiError> {
    let handle: Arc<LoopHandle> = state.session().ok_or_else(ApiError::no_session)?;
    let changed = apply(&*handle);
    Ok(Json(ControlResponse {
        changed,
        status: handle.get_status(),
    }))
}

async fn pause(State(state): State<AppState>) -> Result<Json<ControlResponse>, ApiError> {
    control(&state, LoopHandle::pause)
}

/// Body is optional: `{"feedback": "..."}`.
async fn resume(
    State(state): State<AppState>,
    body: Option<Json<FeedbackRequest>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let feedback = body.and_then(|Json(b)| b.feedback);
    control(&state, |h| h.resume(feedback))
}

async fn step(
    State(state): State<AppState>,
    body: Option<Json<FeedbackRequest>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let feedback = body.and_then(|Json(b)| b.feedback);
    control(&state, |h| h.step(feedback))
}

async fn stop(State(state): State<AppState>) -> Result<Json<ControlResponse>, ApiError> {
    control(&state, LoopHandle::stop)
}

async fn set_mode(
    State(state): State<AppState>,
    Json(body): Json<ModeRequest>,
) -> Result<Json<ControlResponse>, ApiError> {
    control(&state, |h| h.set_mode(body.mode))
}

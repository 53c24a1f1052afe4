//! HTTP surface: submit a task, poll its status, prune old records, and the
//! control-socket upgrade. No endpoint blocks on task completion; clients
//! poll `/status/{task_id}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::registry::TaskSnapshot;
use crate::server::state::AppState;
use crate::server::ws;

pub(crate) fn build_router(state: AppState) -> Router {
    use tower_http::cors::{Any, CorsLayer};
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(info_handler))
        .route("/execute", post(execute_handler))
        .route("/status/:task_id", get(status_handler))
        .route("/task/:task_id", delete(delete_task_handler))
        .route("/cleanup", post(cleanup_handler))
        .route("/ws", get(ws::websocket_handler))
        .layer(cors)
        .with_state(state)
}

async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": "webpilot",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "browser_link": state.link.state(),
        "active_tasks": state.registry.active_count(),
        "total_tasks": state.registry.total_count(),
        "started_at": state.started_at,
    }))
}

#[derive(Deserialize)]
struct ExecuteRequest {
    task: String,
}

#[derive(Serialize)]
struct ExecuteResponse {
    task_id: Uuid,
    status: &'static str,
}

#[instrument(name = "pilot.execute", skip(state, request))]
async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let objective = request.task.trim().to_string();
    if objective.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "task must not be empty");
    }
    let task_id = state.engine.spawn_task(objective, &state.shutdown);
    Json(ExecuteResponse {
        task_id,
        status: "queued",
    })
    .into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    #[serde(flatten)]
    snapshot: TaskSnapshot,
}

#[instrument(name = "pilot.status", skip(state))]
async fn status_handler(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let Some(task_id) = parse_task_id(&task_id) else {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    };
    match state.registry.snapshot(&task_id) {
        Some(snapshot) => Json(StatusResponse {
            success: true,
            snapshot,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "task not found"),
    }
}

#[instrument(name = "pilot.delete_task", skip(state))]
async fn delete_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    let Some(task_id) = parse_task_id(&task_id) else {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    };
    if state.registry.remove(&task_id) {
        Json(json!({"deleted": true, "task_id": task_id})).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "task not found")
    }
}

#[derive(Deserialize)]
struct CleanupParams {
    keep_last_n: Option<usize>,
}

async fn cleanup_handler(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> impl IntoResponse {
    let removed = state
        .registry
        .cleanup_terminal(params.keep_last_n.unwrap_or(100));
    Json(json!({
        "removed": removed,
        "remaining_tasks": state.registry.total_count(),
    }))
}

fn parse_task_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

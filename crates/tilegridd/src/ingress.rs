//! HTTP ingress.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/executions/complete` | Worker completion report |
//! | POST | `/api/v1/workers/{id}/heartbeat` | Worker liveness + load |
//! | GET | `/api/v1/workers` | Runtime worker pool snapshot |
//! | GET | `/api/v1/stages/{id}/counts` | Tile counts per status |
//! | POST | `/api/v1/stages/{id}/status` | Set or convert tile status |
//! | POST | `/api/v1/stages/{id}/processing` | Enable/disable stage dispatch |
//! | POST | `/api/v1/stages/{id}/dequeue` | Dequeue z-planes |
//! | POST | `/api/v1/projects/{id}/processing` | Enable/disable a project |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use tilegrid_scheduler::{Admin, ConnectorCache, CompletionReport, SchedulerError};
use tilegrid_state::{StateStore, TileStatus};
use tilegrid_worker::WorkerPool;

/// Shared state for ingress handlers.
#[derive(Clone)]
pub struct IngressState {
    pub store: StateStore,
    pub connectors: Arc<ConnectorCache>,
    pub pool: Arc<WorkerPool>,
    pub chunk_size: usize,
}

impl IngressState {
    fn admin(&self) -> Admin<'_> {
        Admin {
            store: &self.store,
            connectors: &self.connectors,
            chunk_size: self.chunk_size,
        }
    }
}

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn scheduler_error(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::StageNotFound(_)
        | SchedulerError::ProjectNotFound(_)
        | SchedulerError::TaskNotFound(_)
        | SchedulerError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "ingress request failed");
    } else {
        warn!(error = %e, "ingress request rejected");
    }
    error_response(&e.to_string(), status)
}

pub fn build_router(state: IngressState) -> Router {
    let api_routes = Router::new()
        .route("/executions/complete", post(complete_execution))
        .route("/workers", get(list_workers))
        .route("/workers/{id}/heartbeat", post(worker_heartbeat))
        .route("/stages/{id}/counts", get(stage_counts))
        .route("/stages/{id}/status", post(set_stage_tile_status))
        .route("/stages/{id}/processing", post(set_stage_processing))
        .route("/stages/{id}/dequeue", post(dequeue_planes))
        .route("/projects/{id}/processing", post(set_project_processing))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

// ── Workers ────────────────────────────────────────────────────

/// POST /api/v1/executions/complete
pub async fn complete_execution(
    State(state): State<IngressState>,
    Json(report): Json<CompletionReport>,
) -> Response {
    match tilegrid_scheduler::on_task_execution_complete(
        &state.store,
        &state.connectors,
        &state.pool,
        report,
    )
    .await
    {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub task_load: Option<f64>,
}

/// POST /api/v1/workers/{id}/heartbeat
pub async fn worker_heartbeat(
    State(state): State<IngressState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    if state.pool.heartbeat(&id, req.task_load).await {
        ApiResponse::ok(id).into_response()
    } else {
        error_response("worker not found", StatusCode::NOT_FOUND)
    }
}

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<IngressState>) -> Response {
    ApiResponse::ok(state.pool.snapshot().await).into_response()
}

// ── Stages ─────────────────────────────────────────────────────

/// GET /api/v1/stages/{id}/counts
pub async fn stage_counts(State(state): State<IngressState>, Path(id): Path<String>) -> Response {
    match state.admin().tile_status_counts(&id).await {
        Ok(counts) => ApiResponse::ok(counts).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Either an explicit path list, or every tile currently in `from`.
#[derive(Debug, Deserialize)]
pub struct TileStatusRequest {
    #[serde(default)]
    pub relative_paths: Option<Vec<String>>,
    #[serde(default)]
    pub from: Option<TileStatus>,
    pub status: TileStatus,
}

#[derive(Debug, Serialize)]
struct Changed {
    changed: usize,
}

/// POST /api/v1/stages/{id}/status
pub async fn set_stage_tile_status(
    State(state): State<IngressState>,
    Path(id): Path<String>,
    Json(req): Json<TileStatusRequest>,
) -> Response {
    let admin = state.admin();
    let result = match (&req.relative_paths, req.from) {
        (Some(paths), _) => admin.set_tile_status(&id, paths, req.status).await,
        (None, Some(from)) => admin.convert_tile_status(&id, from, req.status).await,
        (None, None) => {
            return error_response(
                "either relative_paths or from is required",
                StatusCode::BAD_REQUEST,
            );
        }
    };
    match result {
        Ok(changed) => ApiResponse::ok(Changed { changed }).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProcessingRequest {
    pub is_processing: bool,
}

/// POST /api/v1/stages/{id}/processing
pub async fn set_stage_processing(
    State(state): State<IngressState>,
    Path(id): Path<String>,
    Json(req): Json<ProcessingRequest>,
) -> Response {
    match state.admin().set_stage_processing(&id, req.is_processing) {
        Ok(stage) => ApiResponse::ok(stage).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DequeueRequest {
    pub planes: Vec<i64>,
}

/// POST /api/v1/stages/{id}/dequeue
pub async fn dequeue_planes(
    State(state): State<IngressState>,
    Path(id): Path<String>,
    Json(req): Json<DequeueRequest>,
) -> Response {
    match state.admin().dequeue_planes(&id, &req.planes).await {
        Ok(changed) => ApiResponse::ok(Changed { changed }).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Projects ───────────────────────────────────────────────────

/// POST /api/v1/projects/{id}/processing
pub async fn set_project_processing(
    State(state): State<IngressState>,
    Path(id): Path<String>,
    Json(req): Json<ProcessingRequest>,
) -> Response {
    match state.admin().set_project_processing(&id, req.is_processing) {
        Ok(project) => ApiResponse::ok(project).into_response(),
        Err(e) => scheduler_error(e),
    }
}

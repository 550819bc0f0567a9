//! HTTP submission boundary for conversion tasks.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::conversion::SourceResolver;
use crate::error::{ExecutorError, TaskError};
use crate::tasks::{TaskId, TaskManager};
use crate::worker::{BackgroundExecutor, Workload};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub executor: Arc<BackgroundExecutor>,
    /// Validates `pdf_url` before a task is created.
    pub resolver: SourceResolver,
    /// Directory artifacts are written into.
    pub converts_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ConvertRequest {
    pdf_url: String,
}

/// Build the Axum router with the task submission and polling routes.
pub fn task_routes(
    manager: Arc<TaskManager>,
    executor: Arc<BackgroundExecutor>,
    resolver: SourceResolver,
    converts_dir: PathBuf,
) -> Router {
    let state = AppState {
        manager,
        executor,
        resolver,
        converts_dir,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/transform/convert", post(convert))
        .route("/api/transform/status/{id}", get(status))
        .route("/api/transform/cancel/{id}", post(cancel))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pdf2html-tasks"
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn convert(State(state): State<AppState>, Json(req): Json<ConvertRequest>) -> Response {
    if let Err(e) = state.resolver.resolve(&req.pdf_url) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let id = match state.manager.create().await {
        Ok(id) => id,
        Err(e) => return task_error_response(e),
    };

    let workload = Workload::new(req.pdf_url, state.converts_dir.clone());
    match state.executor.submit(id, workload).await {
        Ok(()) => {
            info!(task_id = %id, "Conversion submitted");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "task_id": id })),
            )
                .into_response()
        }
        Err(ExecutorError::ShuttingDown) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Service is shutting down".to_string())
        }
        Err(ExecutorError::Task(e)) => task_error_response(e),
    }
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<TaskId>() else {
        return not_found(&id);
    };
    match state.manager.get(id).await {
        Ok(record) => (StatusCode::OK, Json(serde_json::json!(record))).into_response(),
        Err(e) => task_error_response(e),
    }
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<TaskId>() else {
        return not_found(&id);
    };
    if state.executor.cancel(id).await {
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": id, "cancelling": true })),
        )
            .into_response();
    }
    match state.manager.get(id).await {
        Ok(record) => error_response(
            StatusCode::CONFLICT,
            format!("Task is {} and can no longer be cancelled", record.status),
        ),
        Err(e) => task_error_response(e),
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

fn not_found(id: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("Task {id} not found"))
}

fn task_error_response(e: TaskError) -> Response {
    match e {
        TaskError::NotFound { id } => not_found(&id.to_string()),
        TaskError::Store(e) => {
            warn!(error = %e, "Task store unavailable");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn error_response(code: StatusCode, detail: String) -> Response {
    (code, Json(serde_json::json!({ "detail": detail }))).into_response()
}

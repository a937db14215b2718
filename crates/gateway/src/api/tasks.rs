//! Task API endpoints: projection, incremental log tail, cancellation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use wg_domain::model::TaskStatus;
use wg_store::{TaskFilter, TaskPatch};

use crate::api::api_error;
use crate::state::AppState;

const LOG_LIMIT_DEFAULT: usize = 100;
const LOG_LIMIT_MAX: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "d_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn d_limit() -> usize {
    50
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        Some(raw) => match serde_json::from_value::<TaskStatus>(serde_json::json!(raw)) {
            Ok(status) => Some(status),
            Err(_) => return api_error(StatusCode::BAD_REQUEST, format!("unknown status: {raw}")),
        },
        None => None,
    };

    let (tasks, total) = state.store.list_tasks(&TaskFilter {
        session_id: query.session_id,
        status,
        limit: query.limit.min(500),
        offset: query.offset,
    });
    Json(serde_json::json!({ "tasks": tasks, "total": total })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/tasks/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.store.get_task(&id) {
        Some(task) => Json(serde_json::json!(task)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "task not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/tasks/:id/logs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Last seq the caller has seen; 0 (the default) means "from the
    /// beginning".
    #[serde(default)]
    pub after: u64,
    #[serde(default = "d_log_limit")]
    pub limit: usize,
}

fn d_log_limit() -> usize {
    LOG_LIMIT_DEFAULT
}

pub async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    if state.store.get_task(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "task not found");
    }

    let limit = query.limit.clamp(1, LOG_LIMIT_MAX);
    let after = (query.after > 0).then_some(query.after);
    let logs = state.store.read_logs(&id, after, limit);

    let total = state.store.count_logs(&id);
    // Seqs are dense, so the tail is drained once the last returned seq is
    // the final one.
    let has_more = match logs.last() {
        Some(last) => last.seq + 1 < total,
        None => false,
    };

    Json(serde_json::json!({ "logs": logs, "hasMore": has_more })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/tasks/:id/cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let Some(task) = state.store.get_task(&id) else {
        return api_error(StatusCode::NOT_FOUND, "task not found");
    };
    if !task.status.is_cancelable() {
        return api_error(
            StatusCode::CONFLICT,
            format!("task is {}", task.status.as_str()),
        );
    }

    // 1. Best-effort interrupt of the bound worker (errors swallowed).
    state.dispatcher.interrupt_worker(&task).await;

    // 2. Mark canceled. The dispatcher keeps draining the stream into the
    // log, but status is sticky from here on.
    match state
        .store
        .update_task(&id, TaskPatch::status(TaskStatus::Canceled))
    {
        Ok(_) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

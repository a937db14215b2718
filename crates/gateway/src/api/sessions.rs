//! Session management API endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::api_error;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.store.list_sessions();
    Json(serde_json::json!({ "sessions": sessions }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    /// Explicit session id; minted when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "d_channel")]
    pub channel_type: String,
}

fn d_channel() -> String {
    "duplex".to_string()
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> impl IntoResponse {
    let id = body
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    match state.store.create_session(&id, &body.channel_type) {
        Ok((session, _created)) => Json(serde_json::json!(session)).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_session(&id) {
        Some(session) => Json(serde_json::json!(session)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "session not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PATCH /api/sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UpdateSessionBody {
    pub title: String,
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSessionBody>,
) -> impl IntoResponse {
    match state.store.update_session_title(&id, &body.title) {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /api/sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_session(&id) {
        Ok(true) => {
            // Tear down the session's worker in the background; the session
            // record is already gone either way.
            let driver = state.driver.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.release(&id).await {
                    tracing::warn!(session_id = %id, error = %e, "worker release failed");
                }
            });
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Ok(false) => api_error(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/sessions/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chat-shaped projection of the session's tasks: each task contributes
/// the user message and, when present, the assistant result.
pub async fn session_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.store.get_session(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "session not found");
    }
    let mut messages = Vec::new();
    for task in state.store.list_tasks_by_session(&id) {
        messages.push(serde_json::json!({
            "role": "user",
            "content": task.message,
            "task_id": task.id,
            "created_at": task.created_at,
        }));
        if let Some(result) = &task.result {
            messages.push(serde_json::json!({
                "role": "assistant",
                "content": result,
                "task_id": task.id,
                "created_at": task.finished_at.unwrap_or(task.created_at),
            }));
        }
    }
    Json(serde_json::json!({ "messages": messages })).into_response()
}

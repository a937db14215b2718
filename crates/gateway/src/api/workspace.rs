//! Workspace file proxy: read/write files inside a session's worker.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use wg_domain::Error;

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub session_id: String,
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<WorkspaceQuery>,
) -> impl IntoResponse {
    let endpoint = match state.driver.acquire(&query.session_id).await {
        Ok(endpoint) => endpoint,
        Err(e) => return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    match state.worker.workspace_get(&endpoint.url, &file).await {
        Ok(content) => {
            Json(serde_json::json!({ "file": file, "content": content })).into_response()
        }
        Err(Error::NotFound(_)) => api_error(StatusCode::NOT_FOUND, "file not found"),
        Err(e) => api_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

pub async fn put_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<WorkspaceQuery>,
    body: String,
) -> impl IntoResponse {
    let endpoint = match state.driver.acquire(&query.session_id).await {
        Ok(endpoint) => endpoint,
        Err(e) => return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    match state.worker.workspace_put(&endpoint.url, &file, body).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => api_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

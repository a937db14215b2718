//! REST surface.
//!
//! - `GET    /api/health`                        — liveness + version
//! - `GET    /api/sessions`                      — list sessions
//! - `POST   /api/sessions`                      — create session
//! - `GET    /api/sessions/:id`                  — session detail
//! - `PATCH  /api/sessions/:id`                  — update title
//! - `DELETE /api/sessions/:id`                  — delete (cascades)
//! - `GET    /api/sessions/:id/messages`         — message projection
//! - `GET    /api/tasks`                         — filtered task list
//! - `GET    /api/tasks/:id`                     — task projection
//! - `GET    /api/tasks/:id/logs?after=&limit=`  — incremental log tail
//! - `POST   /api/tasks/:id/cancel`              — cooperative cancel
//! - `POST   /api/channel/:type/webhook`         — webhook ingress
//! - `GET/PUT /api/workspace/:file`              — workspace proxy
//! - `GET    /ws`                                — duplex interactive ingress

pub mod sessions;
pub mod tasks;
pub mod webhook;
pub mod workspace;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// `GET /api/health`
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(sessions::get_session)
                .patch(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route("/api/sessions/:id/messages", get(sessions::session_messages))
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/:id", get(tasks::get_task))
        .route("/api/tasks/:id/logs", get(tasks::task_logs))
        .route("/api/tasks/:id/cancel", post(tasks::cancel_task))
        .route("/api/channel/:channel_type/webhook", post(webhook::receive))
        .route(
            "/api/workspace/:file",
            get(workspace::get_file).put(workspace::put_file),
        )
        .route("/ws", get(crate::ws::duplex_ws))
        .with_state(state)
}

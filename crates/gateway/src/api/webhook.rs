//! Webhook ingress: `POST /api/channel/:type/webhook`.
//!
//! The channel verifies and translates the raw request; accepted payloads
//! become pending tasks dispatched asynchronously, and the caller gets a
//! 202 with the task id. Verification failure is a 401, an unknown channel
//! a 404, and a translate miss a 200 `{skipped: true}` so platforms do not
//! retry events we deliberately ignore.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use uuid::Uuid;

use wg_domain::model::Task;

use crate::api::api_error;
use crate::channels::InboundRequest;
use crate::state::AppState;

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect()
}

pub async fn receive(
    State(state): State<AppState>,
    Path(channel_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(channel) = state.channels.get(&channel_type) else {
        return api_error(StatusCode::NOT_FOUND, "unknown channel");
    };

    let request = InboundRequest {
        headers: header_map(&headers),
        body: body.to_vec(),
    };

    if !channel.verify(&request) {
        tracing::warn!(channel = %channel_type, "webhook signature verification failed");
        return api_error(StatusCode::UNAUTHORIZED, "verification failed");
    }

    let Some(task_request) = channel.translate(&request) else {
        return Json(serde_json::json!({ "ok": true, "skipped": true })).into_response();
    };

    let session_id = task_request
        .session_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Err(e) = state.store.create_session(&session_id, &channel_type) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let task = Task::from_request(&session_id, &channel_type, task_request, &channel.defaults());
    let task = match state.store.create_task(task) {
        Ok(task) => task,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    tracing::info!(channel = %channel_type, task_id = %task.id, session_id = %session_id, "webhook task accepted");

    // Dispatch asynchronously; the 202 is already committed, so failures
    // from here on land on the task record instead.
    let dispatcher = state.dispatcher.clone();
    let store = state.store.clone();
    let task_id = task.id;
    tokio::spawn(async move {
        dispatcher.run_task(task_id, None).await;
        let _ = store.touch_session(&session_id);
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "taskId": task_id })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Router;

    use wg_domain::config::Config;
    use wg_driver::StaticDriver;
    use wg_store::Store;

    use crate::state::AppState;

    /// Worker stub plus a delivery-callback counter, one server.
    async fn spawn_worker_and_callback() -> (String, Arc<AtomicUsize>) {
        let callbacks = Arc::new(AtomicUsize::new(0));
        let counter = callbacks.clone();

        let chat = || async {
            let body = "event: text\ndata: {\"content\":\"reviewed\"}\n\n\
                        event: done\ndata: {\"content\":\"\"}\n\n";
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        };
        let callback = move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        };

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/chat", post(chat))
            .route("/callback", post(callback));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), callbacks)
    }

    /// Serve the real API router against a temp store + static driver.
    async fn spawn_api(worker_url: &str) -> (String, tempfile::TempDir) {
        let mut config = Config::default();
        config.channels.webhook_demo.callback_url = Some(format!("{worker_url}/callback"));

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let driver = Arc::new(StaticDriver::new(
            worker_url.to_string(),
            Duration::from_secs(5),
        ));
        let state = AppState::build(Arc::new(config), store, driver);

        let app = crate::api::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), dir)
    }

    #[tokio::test]
    async fn webhook_round_trip() {
        let (worker_url, callbacks) = spawn_worker_and_callback().await;
        let (api, _dir) = spawn_api(&worker_url).await;
        let http = reqwest::Client::new();

        // Accepted payload → 202 with a task id.
        let accepted = http
            .post(format!("{api}/api/channel/webhook-demo/webhook"))
            .json(&serde_json::json!({"action": "run", "message": "review this"}))
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), 202);
        let body: serde_json::Value = accepted.json().await.unwrap();
        let task_id = body["taskId"].as_str().unwrap().to_owned();

        // Poll until the task completes.
        let mut task = serde_json::Value::Null;
        for _ in 0..50 {
            let response = http
                .get(format!("{api}/api/tasks/{task_id}"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            task = response.json().await.unwrap();
            if task["status"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(task["status"], "completed", "task never completed: {task}");
        assert_eq!(task["result"], "reviewed");

        // The whole stream landed in the log, in order.
        let logs: serde_json::Value = http
            .get(format!("{api}/api/tasks/{task_id}/logs?after=0&limit=50"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let entries = logs["logs"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["kind"], "text");
        assert_eq!(entries[1]["kind"], "done");
        assert_eq!(logs["hasMore"], false);

        // Channel delivery fired exactly once.
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        // Terminal tasks cannot be canceled.
        let conflict = http
            .post(format!("{api}/api/tasks/{task_id}/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(conflict.status(), 409);
    }

    #[tokio::test]
    async fn webhook_ignored_action_is_skipped() {
        let (worker_url, callbacks) = spawn_worker_and_callback().await;
        let (api, _dir) = spawn_api(&worker_url).await;

        let response = reqwest::Client::new()
            .post(format!("{api}/api/channel/webhook-demo/webhook"))
            .json(&serde_json::json!({"action": "ping"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["skipped"], true);
        assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn webhook_unknown_channel_is_404() {
        let (worker_url, _callbacks) = spawn_worker_and_callback().await;
        let (api, _dir) = spawn_api(&worker_url).await;

        let response = reqwest::Client::new()
            .post(format!("{api}/api/channel/nope/webhook"))
            .json(&serde_json::json!({"action": "run", "message": "m"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn webhook_bad_signature_is_401() {
        let (worker_url, _callbacks) = spawn_worker_and_callback().await;

        // Same setup but with a secret the request will not carry.
        let mut config = Config::default();
        config.channels.webhook_demo.secret = Some("topsecret".into());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let driver = Arc::new(StaticDriver::new(worker_url, Duration::from_secs(5)));
        let state = AppState::build(Arc::new(config), store, driver);
        let app = crate::api::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/api/channel/webhook-demo/webhook"))
            .json(&serde_json::json!({"action": "run", "message": "m"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }
}

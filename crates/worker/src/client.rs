//! HTTP client for the worker runtime contract.
//!
//! The worker is a black box exposing four endpoints plus a workspace file
//! proxy:
//!
//! - `POST /prepare {task_id, skills, bridge_configs}` — 30s timeout, fatal
//! - `POST /chat    {session_id, message}`             — SSE stream, unbounded
//! - `POST /cancel  {session_id}`                      — 5s, best effort
//! - `GET  /health`                                    — 3s probe
//! - `GET/PUT /workspace/{file}`                       — 30s proxy

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use wg_domain::event::{BoxStream, WorkerEvent};
use wg_domain::{Error, Result};

use crate::sse::worker_event_stream;

const PREPARE_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const WORKSPACE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct PrepareBody<'a> {
    task_id: Uuid,
    skills: &'a [String],
    bridge_configs: &'a [serde_json::Value],
}

#[derive(Serialize)]
struct ChatBody<'a> {
    session_id: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct CancelBody<'a> {
    session_id: &'a str,
}

/// Thin HTTP client over a driver-provided worker endpoint.
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Inject skills and tool-bridge configs before a task runs.
    /// Non-success responses are fatal to the task and carry the worker's
    /// error body.
    pub async fn prepare(
        &self,
        base_url: &str,
        task_id: Uuid,
        skills: &[String],
        bridge_configs: &[serde_json::Value],
    ) -> Result<()> {
        let response = self
            .http
            .post(format!("{base_url}/prepare"))
            .timeout(PREPARE_TIMEOUT)
            .json(&PrepareBody {
                task_id,
                skills,
                bridge_configs,
            })
            .send()
            .await
            .map_err(|e| Error::PrepareFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PrepareFailed(format!("{status}: {body}")));
        }
        Ok(())
    }

    /// Open the chat stream. The returned stream is readable until the
    /// worker closes it or the task is canceled; there is no overall
    /// timeout while frames are flowing.
    pub async fn chat(
        &self,
        base_url: &str,
        session_id: &str,
        message: &str,
    ) -> Result<BoxStream<'static, Result<WorkerEvent>>> {
        let response = self
            .http
            .post(format!("{base_url}/chat"))
            .json(&ChatBody {
                session_id,
                message,
            })
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("chat returned {status}: {body}")));
        }
        Ok(worker_event_stream(response))
    }

    /// Best-effort interrupt of the session's in-flight turn. Failures are
    /// logged and swallowed.
    pub async fn cancel(&self, base_url: &str, session_id: &str) {
        let result = self
            .http
            .post(format!("{base_url}/cancel"))
            .timeout(CANCEL_TIMEOUT)
            .json(&CancelBody { session_id })
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    session_id,
                    status = %response.status(),
                    "worker cancel rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id, error = %e, "worker cancel failed");
            }
        }
    }

    /// 3s health probe.
    pub async fn health(&self, base_url: &str) -> bool {
        self.http
            .get(format!("{base_url}/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Read a workspace file through the worker.
    pub async fn workspace_get(&self, base_url: &str, file: &str) -> Result<String> {
        let response = self
            .http
            .get(format!("{base_url}/workspace/{file}"))
            .timeout(WORKSPACE_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("workspace file {file}")));
        }
        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "workspace read returned {}",
                response.status()
            )));
        }
        response.text().await.map_err(|e| Error::Http(e.to_string()))
    }

    /// Write a workspace file through the worker.
    pub async fn workspace_put(&self, base_url: &str, file: &str, content: String) -> Result<()> {
        let response = self
            .http
            .put(format!("{base_url}/workspace/{file}"))
            .timeout(WORKSPACE_TIMEOUT)
            .body(content)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "workspace write returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Default for WorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

//! Local-container driver: one docker container per session.
//!
//! Shells out to the `docker` CLI (run/rm/inspect/port) the same way a
//! developer would, with the session workspace bind-mounted at `/workspace`
//! and the worker port published on an ephemeral loopback port.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use wg_domain::config::WorkerConfig;
use wg_domain::{Error, Result};

use crate::names::worker_name;
use crate::{probe_health, wait_until_healthy, Driver, Endpoint};

pub struct DockerDriver {
    worker: WorkerConfig,
    workspace_root: PathBuf,
    /// session_id → endpoint for containers we know to be running.
    containers: Mutex<HashMap<String, Endpoint>>,
    http: reqwest::Client,
}

impl DockerDriver {
    pub fn new(worker: WorkerConfig, workspace_root: PathBuf) -> Self {
        Self {
            worker,
            workspace_root,
            containers: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    async fn docker(args: &[&str]) -> Result<Output> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Driver(format!("docker not runnable: {e}")))?;
        Ok(output)
    }

    /// `true`/`false` when the container exists, None when it does not.
    async fn container_running(name: &str) -> Result<Option<bool>> {
        let output = Self::docker(&["inspect", "-f", "{{.State.Running}}", name]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let state = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(Some(state == "true"))
    }

    /// Resolve the ephemeral host port docker assigned to the worker port.
    async fn host_url(&self, name: &str) -> Result<String> {
        let spec = format!("{}/tcp", self.worker.port);
        let output = Self::docker(&["port", name, &spec]).await?;
        if !output.status.success() {
            return Err(Error::Driver(format!(
                "docker port failed for {name}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        // First mapping line, e.g. "127.0.0.1:49153".
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mapping = stdout
            .lines()
            .next()
            .ok_or_else(|| Error::Driver(format!("no port mapping for {name}")))?;
        let port = mapping
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or_else(|| Error::Driver(format!("unparseable port mapping: {mapping}")))?;
        Ok(format!("http://127.0.0.1:{port}"))
    }

    async fn create_container(&self, session_id: &str, name: &str) -> Result<Endpoint> {
        let workspace = self.workspace_root.join(name);
        std::fs::create_dir_all(&workspace)?;

        let port_publish = format!("127.0.0.1:0:{}", self.worker.port);
        let mount = format!("{}:/workspace", workspace.display());

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-p".into(),
            port_publish,
            "-v".into(),
            mount,
            "--label".into(),
            "app=wg-worker".into(),
        ];
        for (key, value) in &self.worker.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.worker.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = Self::docker(&arg_refs).await?;
        if !output.status.success() {
            return Err(Error::Driver(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();

        let url = self.host_url(name).await?;
        let readiness = Duration::from_secs(self.worker.readiness_timeout_secs);
        if let Err(e) = wait_until_healthy(&self.http, &url, readiness).await {
            // Never leave a half-started container behind.
            let _ = Self::docker(&["rm", "-f", name]).await;
            return Err(e);
        }

        tracing::info!(session_id, container = name, %url, "worker container started");
        Ok(Endpoint { url, container_id })
    }

    async fn remove_container(name: &str) {
        let output = Self::docker(&["rm", "-f", name]).await;
        if let Ok(output) = output {
            if !output.status.success() {
                tracing::debug!(container = name, "docker rm reported failure (already gone?)");
            }
        }
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn acquire(&self, session_id: &str) -> Result<Endpoint> {
        let name = worker_name(session_id);

        // Cached and still healthy → reuse.
        let cached = self.containers.lock().get(session_id).cloned();
        if let Some(endpoint) = cached {
            if probe_health(&self.http, &endpoint.url).await {
                return Ok(endpoint);
            }
            self.containers.lock().remove(session_id);
        }

        // Reuse a running container from a previous process lifetime.
        match Self::container_running(&name).await? {
            Some(true) => {
                let url = self.host_url(&name).await?;
                let readiness = Duration::from_secs(self.worker.readiness_timeout_secs);
                wait_until_healthy(&self.http, &url, readiness).await?;
                let endpoint = Endpoint {
                    url,
                    container_id: name.clone(),
                };
                self.containers
                    .lock()
                    .insert(session_id.to_owned(), endpoint.clone());
                return Ok(endpoint);
            }
            Some(false) => {
                // Exited container: replace it.
                Self::remove_container(&name).await;
            }
            None => {}
        }

        let endpoint = self.create_container(session_id, &name).await?;
        self.containers
            .lock()
            .insert(session_id.to_owned(), endpoint.clone());
        Ok(endpoint)
    }

    async fn release(&self, session_id: &str) -> Result<()> {
        let name = worker_name(session_id);
        Self::remove_container(&name).await;
        self.containers.lock().remove(session_id);
        Ok(())
    }

    async fn health(&self, endpoint: &Endpoint) -> bool {
        probe_health(&self.http, &endpoint.url).await
    }

    async fn shutdown(&self, preserve: bool) {
        if preserve {
            return;
        }
        let sessions: Vec<String> = self.containers.lock().keys().cloned().collect();
        for session_id in sessions {
            let _ = self.release(&session_id).await;
        }
    }
}

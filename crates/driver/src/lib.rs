//! Container-orchestrator façade: per-session worker endpoints.
//!
//! Three shapes behind one trait:
//!
//! - [`StaticDriver`] — one pre-existing endpoint, shared by all sessions
//! - [`DockerDriver`] — one local container per session (docker CLI)
//! - [`KubeDriver`]   — one pod + cluster-local service per session
//!
//! `acquire` always returns a *healthy* endpoint: cold creates block until
//! the worker's `/health` probe succeeds, bounded by the configured
//! readiness timeout.

mod docker;
mod kube_driver;
mod names;
mod static_;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use wg_domain::config::{Config, DriverKind};
use wg_domain::{Error, Result};

pub use docker::DockerDriver;
pub use kube_driver::KubeDriver;
pub use names::{sanitize_label, worker_name};
pub use static_::StaticDriver;

/// A borrowed worker endpoint. The dispatcher holds it for the duration of
/// one task but does not own the underlying pod/container lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub container_id: String,
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Return a healthy endpoint for the session, creating or reusing the
    /// backing worker as needed.
    async fn acquire(&self, session_id: &str) -> Result<Endpoint>;

    /// Tear down the session's worker. Idempotent; unknown sessions are a
    /// no-op.
    async fn release(&self, session_id: &str) -> Result<()>;

    /// 3s-timeout probe of `GET /health`.
    async fn health(&self, endpoint: &Endpoint) -> bool;

    /// Graceful stop: `preserve` keeps workers alive for the next boot.
    async fn shutdown(&self, _preserve: bool) {}
}

/// Build the configured driver.
pub async fn driver_from_config(config: &Config) -> Result<Arc<dyn Driver>> {
    match config.driver.kind {
        DriverKind::Static => {
            let url = config
                .driver
                .static_worker_url
                .clone()
                .ok_or_else(|| Error::Config("static driver requires static_worker_url".into()))?;
            Ok(Arc::new(StaticDriver::new(
                url,
                Duration::from_secs(config.worker.readiness_timeout_secs),
            )))
        }
        DriverKind::Docker => Ok(Arc::new(DockerDriver::new(
            config.worker.clone(),
            config.store.data_dir.join("workspaces"),
        ))),
        DriverKind::Kube => {
            let driver = KubeDriver::connect(config.kube.clone(), config.worker.clone()).await?;
            let driver = Arc::new(driver);
            driver.clone().spawn_reaper();
            Ok(driver)
        }
    }
}

/// Probe `GET {url}/health` with a 3s timeout.
pub(crate) async fn probe_health(http: &reqwest::Client, url: &str) -> bool {
    http.get(format!("{url}/health"))
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

/// Poll the health probe until it succeeds or the deadline passes.
pub(crate) async fn wait_until_healthy(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt = 0u32;
    loop {
        if probe_health(http, url).await {
            tracing::debug!(url, attempt, "worker healthy");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::WorkerUnavailable(format!(
                "{url} not healthy within {}s",
                timeout.as_secs()
            )));
        }
        attempt += 1;
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
}

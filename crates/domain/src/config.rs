//! Configuration tree: TOML file with serde defaults, overridden by
//! environment variables at load time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub titles: TitleConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_3200")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 3200,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Static,
    Docker,
    Kube,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "d_driver_kind")]
    pub kind: DriverKind,
    /// Pre-existing worker endpoint for the static driver.
    #[serde(default)]
    pub static_worker_url: Option<String>,
    /// On graceful shutdown, keep worker pods/containers alive.
    #[serde(default = "d_true")]
    pub preserve_on_shutdown: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Static,
            static_worker_url: None,
            preserve_on_shutdown: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "d_image")]
    pub image: String,
    #[serde(default = "d_8080")]
    pub port: u16,
    /// Seconds to wait for a cold worker to become healthy.
    #[serde(default = "d_90")]
    pub readiness_timeout_secs: u64,
    /// Environment propagated into every worker (credentials, model ids).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: d_image(),
            port: 8080,
            readiness_timeout_secs: 90,
            env: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kubernetes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStorage {
    Ephemeral,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(default = "d_namespace")]
    pub namespace: String,
    #[serde(default = "d_storage")]
    pub workspace_storage: WorkspaceStorage,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default = "d_cpu_request")]
    pub cpu_request: String,
    #[serde(default = "d_mem_request")]
    pub mem_request: String,
    #[serde(default = "d_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "d_mem_limit")]
    pub mem_limit: String,
    /// Idle seconds before the reaper deletes a worker. 0 disables.
    #[serde(default = "d_3600")]
    pub idle_ttl_secs: u64,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            namespace: d_namespace(),
            workspace_storage: WorkspaceStorage::Ephemeral,
            storage_class: None,
            cpu_request: d_cpu_request(),
            mem_request: d_mem_request(),
            cpu_limit: d_cpu_limit(),
            mem_limit: d_mem_limit(),
            idle_ttl_secs: 3600,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Title generator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "d_title_base_url")]
    pub base_url: String,
    #[serde(default = "d_title_model")]
    pub model: String,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: d_title_base_url(),
            model: d_title_model(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webhook_demo: WebhookDemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookDemoConfig {
    /// HMAC-SHA256 secret for inbound signature verification. When unset,
    /// inbound requests are accepted unsigned (dev mode).
    #[serde(default)]
    pub secret: Option<String>,
    /// Result delivery endpoint. When unset, delivery is skipped.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Default skills injected into every task from this channel.
    #[serde(default)]
    pub skills: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Prefix for worker env passthrough variables: `WORKER_ENV_FOO=bar`
/// becomes `FOO=bar` inside every worker.
const WORKER_ENV_PREFIX: &str = "WORKER_ENV_";

impl Config {
    /// Load `workgrid.toml` if present, then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let default_path = PathBuf::from("workgrid.toml");
        let path = path.unwrap_or(default_path.as_path());
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| crate::Error::Config(e.to_string()))?
        } else {
            Self::default()
        };
        config.apply_env(&std::env::vars().collect::<HashMap<_, _>>());
        Ok(config)
    }

    /// Apply environment overrides from the given variable map.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) {
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty());

        if let Some(v) = get("WG_HOST") {
            self.server.host = v.clone();
        }
        if let Some(v) = get("WG_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = get("WG_DATA_DIR") {
            self.store.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WG_DRIVER").or_else(|| get("DRIVER")) {
            match v.to_ascii_lowercase().as_str() {
                "static" => self.driver.kind = DriverKind::Static,
                "docker" | "local" => self.driver.kind = DriverKind::Docker,
                "kube" | "kubernetes" | "orchestrated" => self.driver.kind = DriverKind::Kube,
                other => tracing::warn!(driver = other, "unrecognized DRIVER value, keeping configured"),
            }
        }
        if let Some(v) = get("STATIC_WORKER_URL") {
            self.driver.static_worker_url = Some(v.clone());
        }
        if let Some(v) = get("WORKER_IMAGE") {
            self.worker.image = v.clone();
        }
        if let Some(v) = get("WORKER_PORT").and_then(|v| v.parse().ok()) {
            self.worker.port = v;
        }
        if let Some(v) = get("NAMESPACE") {
            self.kube.namespace = v.clone();
        }
        if let Some(v) = get("WORKSPACE_STORAGE") {
            match v.to_ascii_lowercase().as_str() {
                "ephemeral" => self.kube.workspace_storage = WorkspaceStorage::Ephemeral,
                "persistent" => self.kube.workspace_storage = WorkspaceStorage::Persistent,
                other => tracing::warn!(storage = other, "unrecognized WORKSPACE_STORAGE value"),
            }
        }
        if let Some(v) = get("STORAGE_CLASS") {
            self.kube.storage_class = Some(v.clone());
        }
        if let Some(v) = get("WORKER_CPU_REQUEST") {
            self.kube.cpu_request = v.clone();
        }
        if let Some(v) = get("WORKER_MEM_REQUEST") {
            self.kube.mem_request = v.clone();
        }
        if let Some(v) = get("WORKER_CPU_LIMIT") {
            self.kube.cpu_limit = v.clone();
        }
        if let Some(v) = get("WORKER_MEM_LIMIT") {
            self.kube.mem_limit = v.clone();
        }
        if let Some(v) = get("IDLE_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.kube.idle_ttl_secs = v;
        }
        if let Some(v) = get("TITLE_API_KEY") {
            self.titles.api_key = Some(v.clone());
        }
        if let Some(v) = get("TITLE_BASE_URL") {
            self.titles.base_url = v.clone();
        }
        if let Some(v) = get("TITLE_MODEL") {
            self.titles.model = v.clone();
        }
        if let Some(v) = get("WEBHOOK_DEMO_SECRET") {
            self.channels.webhook_demo.secret = Some(v.clone());
        }
        if let Some(v) = get("WEBHOOK_DEMO_CALLBACK_URL") {
            self.channels.webhook_demo.callback_url = Some(v.clone());
        }
        if let Some(v) = get("WEBHOOK_DEMO_SKILLS") {
            self.channels.webhook_demo.skills = v
                .split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Worker env passthrough.
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(WORKER_ENV_PREFIX) {
                if !name.is_empty() {
                    self.worker.env.insert(name.to_owned(), value.clone());
                }
            }
        }
    }

    /// Validate the configuration; returns human-readable issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.driver.kind == DriverKind::Static && self.driver.static_worker_url.is_none() {
            issues.push(ConfigIssue::error(
                "driver.static_worker_url is required for the static driver",
            ));
        }
        if let Some(url) = &self.driver.static_worker_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                issues.push(ConfigIssue::error(
                    "driver.static_worker_url must be an http(s) URL",
                ));
            }
        }
        if self.worker.port == 0 {
            issues.push(ConfigIssue::error("worker.port must be non-zero"));
        }
        if self.kube.workspace_storage == WorkspaceStorage::Persistent
            && self.kube.storage_class.is_none()
        {
            issues.push(ConfigIssue::warning(
                "kube.workspace_storage=persistent without kube.storage_class uses the cluster default",
            ));
        }
        if self.titles.api_key.is_none() {
            issues.push(ConfigIssue::warning(
                "titles.api_key unset; session titles will not be generated",
            ));
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "0.0.0.0".to_string()
}
fn d_3200() -> u16 {
    3200
}
fn d_8080() -> u16 {
    8080
}
fn d_90() -> u64 {
    90
}
fn d_3600() -> u64 {
    3600
}
fn d_true() -> bool {
    true
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn d_driver_kind() -> DriverKind {
    DriverKind::Static
}
fn d_image() -> String {
    "workgrid-worker:latest".to_string()
}
fn d_namespace() -> String {
    "default".to_string()
}
fn d_storage() -> WorkspaceStorage {
    WorkspaceStorage::Ephemeral
}
fn d_cpu_request() -> String {
    "250m".to_string()
}
fn d_mem_request() -> String {
    "512Mi".to_string()
}
fn d_cpu_limit() -> String {
    "1".to_string()
}
fn d_mem_limit() -> String {
    "2Gi".to_string()
}
fn d_title_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn d_title_model() -> String {
    "gpt-4o-mini".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

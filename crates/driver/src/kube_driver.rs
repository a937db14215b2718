//! Kubernetes driver: one pod + cluster-local service per session.
//!
//! `acquire` reconciles toward "one healthy worker per session":
//!
//! 1. deterministic name from the session id
//! 2. cached healthy endpoint → bump `last_used_at`, return
//! 3. pod running/pending → ensure service, fall through to wait-for-ready
//! 4. pod in a terminal phase (or being deleted) → delete pod + service
//! 5. persistent workspace mode → ensure the session's PVC
//! 6. create pod (readiness/liveness probing `/health`)
//! 7. ensure service (selector pinned to the pod-name label)
//! 8. wait until phase == Running and all containers are ready
//! 9. probe `/health` through the service, cache, return
//!
//! An idle reaper sweeps every 5 minutes and deletes workers whose
//! `last_used_at` is older than the configured TTL (0 disables).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use parking_lot::Mutex;

use wg_domain::config::{KubeConfig, WorkerConfig, WorkspaceStorage};
use wg_domain::{Error, Result};

use crate::names::worker_name;
use crate::{probe_health, wait_until_healthy, Driver, Endpoint};

const SESSION_LABEL: &str = "workgrid.dev/session-worker";
const REAPER_INTERVAL: Duration = Duration::from_secs(300);
const DELETE_WAIT: Duration = Duration::from_secs(30);

struct CachedEndpoint {
    endpoint: Endpoint,
    last_used_at: Instant,
}

pub struct KubeDriver {
    client: Client,
    kube: KubeConfig,
    worker: WorkerConfig,
    http: reqwest::Client,
    /// worker name → cached endpoint. Mutated by acquire, release, and the
    /// reaper; all three go through this one lock.
    cache: Mutex<std::collections::HashMap<String, CachedEndpoint>>,
}

impl KubeDriver {
    pub async fn connect(kube: KubeConfig, worker: WorkerConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Driver(format!("kube client: {e}")))?;
        Ok(Self {
            client,
            kube,
            worker,
            http: reqwest::Client::new(),
            cache: Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.kube.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.kube.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.kube.namespace)
    }

    fn service_url(&self, name: &str) -> String {
        format!(
            "http://{name}.{}.svc.cluster.local:{}",
            self.kube.namespace, self.worker.port
        )
    }

    /// Start the idle reaper; a no-op when TTL is 0.
    pub fn spawn_reaper(self: Arc<Self>) {
        if self.kube.idle_ttl_secs == 0 {
            tracing::info!("idle reaper disabled (ttl=0)");
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            interval.tick().await; // consume the immediate first tick
            loop {
                interval.tick().await;
                self.reap_idle().await;
            }
        });
    }

    async fn reap_idle(&self) {
        let ttl = Duration::from_secs(self.kube.idle_ttl_secs);
        let expired: Vec<String> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(_, c)| c.last_used_at.elapsed() > ttl)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in expired {
            tracing::info!(worker = %name, "reaping idle worker");
            self.delete_worker(&name).await;
            self.cache.lock().remove(&name);
        }
    }

    async fn delete_worker(&self, name: &str) {
        let dp = DeleteParams::default();
        if let Err(e) = self.pods().delete(name, &dp).await {
            if !is_not_found(&e) {
                tracing::warn!(worker = %name, error = %e, "pod delete failed");
            }
        }
        if let Err(e) = self.services().delete(name, &dp).await {
            if !is_not_found(&e) {
                tracing::warn!(worker = %name, error = %e, "service delete failed");
            }
        }
    }

    /// Block until the named pod is gone, so a recreate does not race the
    /// old pod's termination.
    async fn wait_deleted(&self, name: &str) -> Result<()> {
        let pods = self.pods();
        let deadline = tokio::time::Instant::now() + DELETE_WAIT;
        loop {
            match pods.get_opt(name).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                Err(e) => return Err(Error::Driver(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::WorkerUnavailable(format!(
                    "pod {name} stuck terminating"
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn ensure_pvc(&self, name: &str) -> Result<()> {
        let pvcs = self.pvcs();
        let claim_name = pvc_name(name);
        if pvcs
            .get_opt(&claim_name)
            .await
            .map_err(|e| Error::Driver(e.to_string()))?
            .is_some()
        {
            return Ok(());
        }
        let pvc = build_pvc(&claim_name, &self.kube.namespace, self.kube.storage_class.as_deref());
        match pvcs.create(&PostParams::default(), &pvc).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(Error::Driver(format!("pvc create: {e}"))),
        }
    }

    async fn ensure_service(&self, name: &str) -> Result<()> {
        let svcs = self.services();
        if svcs
            .get_opt(name)
            .await
            .map_err(|e| Error::Driver(e.to_string()))?
            .is_some()
        {
            return Ok(());
        }
        let service = build_service(name, &self.kube.namespace, self.worker.port);
        match svcs.create(&PostParams::default(), &service).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(Error::Driver(format!("service create: {e}"))),
        }
    }

    async fn create_pod(&self, name: &str) -> Result<()> {
        let pod = build_pod(&PodParams {
            name: name.to_owned(),
            namespace: self.kube.namespace.clone(),
            image: self.worker.image.clone(),
            port: self.worker.port,
            env: self.worker.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cpu_request: self.kube.cpu_request.clone(),
            mem_request: self.kube.mem_request.clone(),
            cpu_limit: self.kube.cpu_limit.clone(),
            mem_limit: self.kube.mem_limit.clone(),
            persistent_claim: (self.kube.workspace_storage == WorkspaceStorage::Persistent)
                .then(|| pvc_name(name)),
        });
        match self.pods().create(&PostParams::default(), &pod).await {
            Ok(_) => Ok(()),
            // A concurrent acquire for the same session won the race.
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(Error::Driver(format!("pod create: {e}"))),
        }
    }

    /// Poll until phase == Running and every container reports ready.
    async fn wait_for_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let pods = self.pods();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(pod) = pods
                .get_opt(name)
                .await
                .map_err(|e| Error::Driver(e.to_string()))?
            {
                if pod_is_ready(&pod) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::WorkerUnavailable(format!(
                    "pod {name} not ready within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait]
impl Driver for KubeDriver {
    async fn acquire(&self, session_id: &str) -> Result<Endpoint> {
        let name = worker_name(session_id);

        // Cached healthy endpoint → bump and return.
        let cached = self.cache.lock().get(&name).map(|c| c.endpoint.clone());
        if let Some(endpoint) = cached {
            if probe_health(&self.http, &endpoint.url).await {
                if let Some(entry) = self.cache.lock().get_mut(&name) {
                    entry.last_used_at = Instant::now();
                }
                return Ok(endpoint);
            }
            self.cache.lock().remove(&name);
        }

        // Reconcile the pod.
        let existing = self
            .pods()
            .get_opt(&name)
            .await
            .map_err(|e| Error::Driver(e.to_string()))?;
        let mut create_needed = true;
        if let Some(pod) = existing {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            let terminating = pod.metadata.deletion_timestamp.is_some();
            if terminating || phase == "Succeeded" || phase == "Failed" {
                tracing::info!(worker = %name, %phase, "replacing terminal pod");
                self.delete_worker(&name).await;
                self.wait_deleted(&name).await?;
            } else {
                create_needed = false;
            }
        }

        if create_needed {
            if self.kube.workspace_storage == WorkspaceStorage::Persistent {
                self.ensure_pvc(&name).await?;
            }
            self.create_pod(&name).await?;
            tracing::info!(session_id, worker = %name, "worker pod created");
        }
        self.ensure_service(&name).await?;

        let timeout = Duration::from_secs(self.worker.readiness_timeout_secs);
        self.wait_for_ready(&name, timeout).await?;

        let url = self.service_url(&name);
        wait_until_healthy(&self.http, &url, timeout).await?;

        let endpoint = Endpoint {
            url,
            container_id: name.clone(),
        };
        self.cache.lock().insert(
            name,
            CachedEndpoint {
                endpoint: endpoint.clone(),
                last_used_at: Instant::now(),
            },
        );
        Ok(endpoint)
    }

    async fn release(&self, session_id: &str) -> Result<()> {
        let name = worker_name(session_id);
        self.delete_worker(&name).await;
        self.cache.lock().remove(&name);
        Ok(())
    }

    async fn health(&self, endpoint: &Endpoint) -> bool {
        probe_health(&self.http, &endpoint.url).await
    }

    async fn shutdown(&self, preserve: bool) {
        if preserve {
            tracing::info!("leaving worker pods in place");
            return;
        }
        let names: Vec<String> = self.cache.lock().keys().cloned().collect();
        for name in names {
            self.delete_worker(&name).await;
        }
        self.cache.lock().clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Object construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PodParams {
    name: String,
    namespace: String,
    image: String,
    port: u16,
    env: Vec<(String, String)>,
    cpu_request: String,
    mem_request: String,
    cpu_limit: String,
    mem_limit: String,
    /// PVC name when the workspace is persistent; None = emptyDir scratch.
    persistent_claim: Option<String>,
}

fn pvc_name(worker: &str) -> String {
    format!("{worker}-ws")
}

fn worker_labels(name: &str) -> BTreeMap<String, String> {
    [
        ("app".to_string(), "wg-worker".to_string()),
        (SESSION_LABEL.to_string(), name.to_string()),
    ]
    .into_iter()
    .collect()
}

fn http_probe(port: u16, period_seconds: i32, failure_threshold: Option<i32>) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::Int(i32::from(port)),
            ..Default::default()
        }),
        period_seconds: Some(period_seconds),
        failure_threshold,
        ..Default::default()
    }
}

fn quantities(cpu: &str, mem: &str) -> BTreeMap<String, Quantity> {
    [
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(mem.to_string())),
    ]
    .into_iter()
    .collect()
}

fn build_pod(params: &PodParams) -> Pod {
    let workspace_volume = match &params.persistent_claim {
        Some(claim_name) => Volume {
            name: "workspace".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: "workspace".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };

    let env: Vec<EnvVar> = params
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: "worker".to_string(),
        image: Some(params.image.clone()),
        working_dir: Some("/workspace".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(params.port),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: "workspace".to_string(),
            mount_path: "/workspace".to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(&params.cpu_request, &params.mem_request)),
            limits: Some(quantities(&params.cpu_limit, &params.mem_limit)),
            ..Default::default()
        }),
        // 30 failures * 5s = 150s for image pull + runtime boot.
        startup_probe: Some(http_probe(params.port, 5, Some(30))),
        readiness_probe: Some(http_probe(params.port, 5, None)),
        liveness_probe: Some(http_probe(params.port, 30, None)),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            labels: Some(worker_labels(&params.name)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(vec![workspace_volume]),
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(name: &str, namespace: &str, port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(worker_labels(name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(worker_labels(name)),
            ports: Some(vec![ServicePort {
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pvc(name: &str, namespace: &str, storage_class: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class.map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [("storage".to_string(), Quantity("1Gi".to_string()))]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .map(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
        .unwrap_or(false)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 404)
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 409)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn params(persistent: bool) -> PodParams {
        PodParams {
            name: "wg-s1-abcd1234".into(),
            namespace: "agents".into(),
            image: "worker:1".into(),
            port: 8080,
            env: vec![("API_KEY".into(), "k".into())],
            cpu_request: "250m".into(),
            mem_request: "512Mi".into(),
            cpu_limit: "1".into(),
            mem_limit: "2Gi".into(),
            persistent_claim: persistent.then(|| pvc_name("wg-s1-abcd1234")),
        }
    }

    #[test]
    fn pod_carries_labels_and_probes() {
        let pod = build_pod(&params(false));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("app").unwrap(), "wg-worker");
        assert_eq!(labels.get(SESSION_LABEL).unwrap(), "wg-s1-abcd1234");

        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        let readiness = container.readiness_probe.as_ref().unwrap();
        let http_get = readiness.http_get.as_ref().unwrap();
        assert_eq!(http_get.path.as_deref(), Some("/health"));
        assert_eq!(http_get.port, IntOrString::Int(8080));
        assert!(container.liveness_probe.is_some());
        assert!(container.startup_probe.is_some());
    }

    #[test]
    fn pod_env_and_resources_propagate() {
        let pod = build_pod(&params(false));
        let container = &pod.spec.unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "API_KEY" && e.value.as_deref() == Some("k")));
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.requests.as_ref().unwrap().get("cpu").unwrap().0,
            "250m"
        );
        assert_eq!(
            resources.limits.as_ref().unwrap().get("memory").unwrap().0,
            "2Gi"
        );
    }

    #[test]
    fn ephemeral_pod_uses_empty_dir() {
        let pod = build_pod(&params(false));
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
        assert!(volumes[0].persistent_volume_claim.is_none());
    }

    #[test]
    fn persistent_pod_mounts_claim() {
        let pod = build_pod(&params(true));
        let volumes = pod.spec.unwrap().volumes.unwrap();
        let claim = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(claim.claim_name, "wg-s1-abcd1234-ws");
    }

    #[test]
    fn service_selector_matches_pod_labels() {
        let pod = build_pod(&params(false));
        let service = build_service("wg-s1-abcd1234", "agents", 8080);
        let selector = service.spec.unwrap().selector.unwrap();
        let pod_labels = pod.metadata.labels.unwrap();
        for (key, value) in &selector {
            assert_eq!(pod_labels.get(key), Some(value));
        }
    }

    #[test]
    fn pvc_uses_storage_class_when_set() {
        let pvc = build_pvc("wg-x-ws", "agents", Some("fast-ssd"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast-ssd"));
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce"]);

        let default_class = build_pvc("wg-x-ws", "agents", None);
        assert!(default_class.spec.unwrap().storage_class_name.is_none());
    }

    fn pod_with_status(phase: &str, ready: &[bool]) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|r| ContainerStatus {
                            ready: *r,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_requires_running_and_all_containers() {
        assert!(pod_is_ready(&pod_with_status("Running", &[true])));
        assert!(!pod_is_ready(&pod_with_status("Running", &[true, false])));
        assert!(!pod_is_ready(&pod_with_status("Pending", &[true])));
        assert!(!pod_is_ready(&pod_with_status("Running", &[])));
        assert!(!pod_is_ready(&Pod::default()));
    }
}

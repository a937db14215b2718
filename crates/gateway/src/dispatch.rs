//! The dispatcher: resolve → acquire → prepare → chat → fan out → deliver.
//!
//! One call to [`Dispatcher::run_task`] owns a task from pending to its
//! terminal state. Worker events are fanned out in stream-receive order:
//! persisted first (seq assignment), then forwarded to the live subscriber
//! if one is attached and still open. A closed subscriber is dropped
//! silently — persistence never gates on it.
//!
//! Cancellation is cooperative: the cancel endpoint signals the task's
//! token and the loop stops issuing status updates, but keeps draining the
//! stream into the log until the worker closes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use wg_domain::event::{ServerFrame, WorkerEvent};
use wg_domain::model::{ExecStats, Task, TaskStatus};
use wg_domain::Result;
use wg_driver::{Driver, Endpoint};
use wg_store::{Store, TaskPatch};
use wg_worker::WorkerClient;

use crate::channels::ChannelRegistry;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cancellation token observed by the dispatcher loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

struct CancelEntry {
    token: CancelToken,
    /// Known once the driver has handed out an endpoint; used for the
    /// best-effort worker interrupt.
    endpoint: Option<Endpoint>,
}

/// Tracks in-flight tasks: one token per task, plus the endpoint the task
/// is bound to once acquired.
#[derive(Default)]
pub struct CancelMap {
    entries: Mutex<HashMap<Uuid, CancelEntry>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.entries.lock().insert(
            task_id,
            CancelEntry {
                token: token.clone(),
                endpoint: None,
            },
        );
        token
    }

    pub fn set_endpoint(&self, task_id: &Uuid, endpoint: Endpoint) {
        if let Some(entry) = self.entries.lock().get_mut(task_id) {
            entry.endpoint = Some(endpoint);
        }
    }

    /// Signal cancellation; returns the bound endpoint when the task is
    /// in flight.
    pub fn cancel(&self, task_id: &Uuid) -> Option<Endpoint> {
        let entries = self.entries.lock();
        match entries.get(task_id) {
            Some(entry) => {
                entry.token.cancel();
                entry.endpoint.clone()
            }
            None => None,
        }
    }

    pub fn remove(&self, task_id: &Uuid) {
        self.entries.lock().remove(task_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Live subscriber
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Weak, write-only handle to a live duplex connection. The peer may
/// disappear at any time; a failed send means "drop further sends".
#[derive(Clone)]
pub struct Subscriber {
    tx: mpsc::Sender<ServerFrame>,
}

impl Subscriber {
    pub fn new(tx: mpsc::Sender<ServerFrame>) -> Self {
        Self { tx }
    }

    /// Returns false once the peer is gone.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Dispatcher {
    store: Arc<Store>,
    driver: Arc<dyn Driver>,
    worker: WorkerClient,
    channels: Arc<ChannelRegistry>,
    cancels: Arc<CancelMap>,
    push_http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        driver: Arc<dyn Driver>,
        worker: WorkerClient,
        channels: Arc<ChannelRegistry>,
        cancels: Arc<CancelMap>,
    ) -> Self {
        Self {
            store,
            driver,
            worker,
            channels,
            cancels,
            push_http: reqwest::Client::new(),
        }
    }

    /// Run a persisted pending task to its terminal state.
    pub async fn run_task(&self, task_id: Uuid, subscriber: Option<Subscriber>) {
        let Some(task) = self.store.get_task(&task_id) else {
            tracing::warn!(%task_id, "dispatch requested for unknown task");
            return;
        };
        if task.status != TaskStatus::Pending {
            tracing::warn!(%task_id, status = task.status.as_str(), "dispatch skipped, task not pending");
            return;
        }

        let token = self.cancels.register(task_id);
        let started = Instant::now();
        let outcome = self
            .execute(&task, subscriber.as_ref(), &token, started)
            .await;

        match outcome {
            Ok(()) => {
                // Re-read: the terminal transition happened inside execute
                // (or the task was canceled out from under it).
                if let Some(final_task) = self.store.get_task(&task_id) {
                    if final_task.status == TaskStatus::Completed {
                        self.deliver(&final_task).await;
                    }
                    if final_task.status.is_terminal() {
                        self.push(&final_task).await;
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(%task_id, error = %message, "task execution failed");
                // The store ignores this when the task is already terminal
                // (e.g. canceled mid-flight).
                if let Err(store_err) = self.store.update_task(
                    &task_id,
                    TaskPatch::status(TaskStatus::Failed).error(message.clone()),
                ) {
                    tracing::error!(%task_id, error = %store_err, "failed to record task failure");
                }
                if let Some(sub) = &subscriber {
                    let session = task.session_id.as_str();
                    if sub
                        .send(ServerFrame::error(message).with_session(session))
                        .await
                    {
                        let _ = sub.send(ServerFrame::done().with_session(session)).await;
                    }
                }
            }
        }

        self.cancels.remove(&task_id);
    }

    /// Steps 1–6 of the pipeline. Any `Err` here fails the task; delivery
    /// and push never run on that path.
    async fn execute(
        &self,
        task: &Task,
        subscriber: Option<&Subscriber>,
        token: &CancelToken,
        started: Instant,
    ) -> Result<()> {
        // 1. Acquire a healthy worker endpoint.
        let endpoint = self.driver.acquire(&task.session_id).await?;
        self.cancels.set_endpoint(&task.id, endpoint.clone());

        // 2. pending → running. The store ignores this if the task was
        // canceled while queued; stop before touching the worker.
        let updated = self.store.update_task(
            &task.id,
            TaskPatch::status(TaskStatus::Running).worker_id(endpoint.container_id.clone()),
        )?;
        if updated.status != TaskStatus::Running {
            return Ok(());
        }

        // 3. Inject capabilities if the task carries any.
        if !task.skills.is_empty() || !task.bridge_configs.is_empty() {
            self.worker
                .prepare(&endpoint.url, task.id, &task.skills, &task.bridge_configs)
                .await?;
        }

        // 4. Open the event stream.
        let mut stream = self
            .worker
            .chat(&endpoint.url, &task.session_id, &task.message)
            .await?;

        // 5. Fan out in order.
        let mut accumulated = String::new();
        let mut subscriber_open = subscriber.is_some();
        let mut finished = false;

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    if finished {
                        // Transport hiccup after the terminal event; the
                        // task outcome is already recorded.
                        tracing::debug!(task_id = %task.id, error = %e, "stream error after terminal event");
                        break;
                    }
                    return Err(e);
                }
            };

            // 5a. Persist before anything else. PersistError is fatal.
            self.store
                .append_log(&task.id, &event.kind, &event.content, event.metadata.clone())?;

            // 5b. Forward to the live subscriber while it lasts.
            if subscriber_open {
                if let Some(sub) = subscriber {
                    if !sub
                        .send(ServerFrame::from_worker_event(&event, &task.session_id))
                        .await
                    {
                        tracing::debug!(task_id = %task.id, "subscriber gone, continuing without it");
                        subscriber_open = false;
                    }
                }
            }

            // 5c. Accumulate text into the eventual result.
            if event.kind == "text" {
                accumulated.push_str(&event.content);
            }

            // 5d. Terminal events: exactly one transition, trailing events
            // only append history. After cancellation, no updates at all.
            if !finished && !token.is_canceled() {
                if event.is_done() {
                    let mut patch = TaskPatch::status(TaskStatus::Completed)
                        .stats(stats_from(&event, started));
                    if !accumulated.is_empty() {
                        patch = patch.result(accumulated.clone());
                    }
                    if let Some(output) = event.metadata.as_ref().and_then(|m| m.get("output")) {
                        patch = patch.output(output.clone());
                    }
                    self.store.update_task(&task.id, patch)?;
                    finished = true;
                } else if event.is_error() {
                    self.store.update_task(
                        &task.id,
                        TaskPatch::status(TaskStatus::Failed).error(event.content.clone()),
                    )?;
                    finished = true;
                }
            }
        }

        // 6. Stream-end fallback: closed while still running → completed.
        if !finished && !token.is_canceled() {
            let still_running = self
                .store
                .get_task(&task.id)
                .map(|t| t.status == TaskStatus::Running)
                .unwrap_or(false);
            if still_running {
                let mut patch = TaskPatch::status(TaskStatus::Completed).stats(ExecStats {
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                });
                if !accumulated.is_empty() {
                    patch = patch.result(accumulated.clone());
                }
                self.store.update_task(&task.id, patch)?;
            }
        }

        Ok(())
    }

    /// Step 7: channel-bound delivery, at most once, failures logged.
    async fn deliver(&self, task: &Task) {
        let Some(channel) = self.channels.get(&task.channel_type) else {
            return;
        };
        if !channel.delivers() {
            return;
        }
        if let Err(e) = channel.deliver(task).await {
            tracing::warn!(task_id = %task.id, channel = %task.channel_type, error = %e, "delivery failed, task remains completed");
        } else {
            tracing::info!(task_id = %task.id, channel = %task.channel_type, "task delivered");
        }
    }

    /// Step 8: outbound push, bounded, best effort, at most once.
    async fn push(&self, task: &Task) {
        let Some(push) = &task.push else {
            return;
        };
        if !push.wants(task.status) {
            return;
        }
        let body = serde_json::json!({
            "taskId": task.id,
            "sessionId": task.session_id,
            "status": task.status,
            "result": task.result,
            "error": task.error,
        });
        let mut request = self
            .push_http
            .post(&push.url)
            .timeout(PUSH_TIMEOUT)
            .json(&body);
        if let Some(auth) = &push.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(task_id = %task.id, status = %response.status(), "push rejected");
            }
            Ok(_) => {
                tracing::debug!(task_id = %task.id, url = %push.url, "push delivered");
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "push failed");
            }
        }
    }

    /// Best-effort interrupt of the worker bound to a task, used by the
    /// cancel endpoint.
    pub async fn interrupt_worker(&self, task: &Task) {
        if let Some(endpoint) = self.cancels.cancel(&task.id) {
            self.worker.cancel(&endpoint.url, &task.session_id).await;
        }
    }
}

/// Execution stats from a `done` event's metadata plus the measured
/// wall-clock duration.
fn stats_from(event: &WorkerEvent, started: Instant) -> ExecStats {
    let metadata = event.metadata.as_ref();
    ExecStats {
        cost_usd: metadata
            .and_then(|m| m.get("cost_usd"))
            .and_then(|v| v.as_f64())
            .map(|v| v.max(0.0))
            .unwrap_or(0.0),
        turns: metadata
            .and_then(|m| m.get("turns"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Channel, InboundRequest};
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::atomic::AtomicUsize;
    use wg_domain::model::{ChannelDefaults, TaskRequest};

    // ── Mock worker ─────────────────────────────────────────────────

    #[derive(Clone)]
    struct MockState {
        prepare_fail: bool,
        prepare_calls: Arc<AtomicUsize>,
        cancel_calls: Arc<AtomicUsize>,
        push_calls: Arc<AtomicUsize>,
        /// (sse frame, delay before sending it)
        chat_script: Arc<Vec<(String, u64)>>,
    }

    async fn mock_prepare(State(state): State<MockState>) -> impl IntoResponse {
        state.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if state.prepare_fail {
            (StatusCode::INTERNAL_SERVER_ERROR, "skill install exploded").into_response()
        } else {
            StatusCode::OK.into_response()
        }
    }

    async fn mock_chat(State(state): State<MockState>) -> impl IntoResponse {
        let script = state.chat_script.clone();
        let stream = futures_util::stream::iter((0..script.len()).collect::<Vec<_>>()).then(
            move |i| {
                let script = script.clone();
                async move {
                    let (frame, delay_ms) = script[i].clone();
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    Ok::<Bytes, std::convert::Infallible>(Bytes::from(frame))
                }
            },
        );
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(stream),
        )
    }

    async fn mock_cancel(State(state): State<MockState>) -> StatusCode {
        state.cancel_calls.fetch_add(1, Ordering::SeqCst);
        StatusCode::OK
    }

    async fn mock_push(State(state): State<MockState>) -> StatusCode {
        state.push_calls.fetch_add(1, Ordering::SeqCst);
        StatusCode::OK
    }

    struct MockWorker {
        base_url: String,
        state: MockState,
    }

    async fn spawn_mock_worker(prepare_fail: bool, chat_script: Vec<(&str, u64)>) -> MockWorker {
        let state = MockState {
            prepare_fail,
            prepare_calls: Arc::new(AtomicUsize::new(0)),
            cancel_calls: Arc::new(AtomicUsize::new(0)),
            push_calls: Arc::new(AtomicUsize::new(0)),
            chat_script: Arc::new(
                chat_script
                    .into_iter()
                    .map(|(f, d)| (f.to_string(), d))
                    .collect(),
            ),
        };
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/prepare", post(mock_prepare))
            .route("/chat", post(mock_chat))
            .route("/cancel", post(mock_cancel))
            .route("/push", post(mock_push))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockWorker {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    // ── Mock driver ─────────────────────────────────────────────────

    struct MockDriver {
        url: String,
    }

    #[async_trait]
    impl Driver for MockDriver {
        async fn acquire(&self, _session_id: &str) -> Result<Endpoint> {
            Ok(Endpoint {
                url: self.url.clone(),
                container_id: "mock-worker".into(),
            })
        }

        async fn release(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }

        async fn health(&self, _endpoint: &Endpoint) -> bool {
            true
        }
    }

    // ── Counting delivery channel ───────────────────────────────────

    struct CountingChannel {
        deliveries: Arc<AtomicUsize>,
        last_status: Arc<Mutex<Option<TaskStatus>>>,
    }

    #[async_trait]
    impl Channel for CountingChannel {
        fn channel_type(&self) -> &str {
            "counting"
        }

        fn defaults(&self) -> ChannelDefaults {
            ChannelDefaults::default()
        }

        fn verify(&self, _request: &InboundRequest) -> bool {
            true
        }

        fn translate(&self, _request: &InboundRequest) -> Option<TaskRequest> {
            None
        }

        fn delivers(&self) -> bool {
            true
        }

        async fn deliver(&self, task: &Task) -> Result<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            *self.last_status.lock() = Some(task.status);
            Ok(())
        }
    }

    // ── Harness ─────────────────────────────────────────────────────

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        dispatcher: Dispatcher,
        deliveries: Arc<AtomicUsize>,
        cancels: Arc<CancelMap>,
    }

    fn harness(worker_url: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let deliveries = Arc::new(AtomicUsize::new(0));
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(CountingChannel {
            deliveries: deliveries.clone(),
            last_status: Arc::new(Mutex::new(None)),
        }));
        let cancels = Arc::new(CancelMap::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(MockDriver {
                url: worker_url.to_string(),
            }),
            WorkerClient::new(),
            Arc::new(registry),
            cancels.clone(),
        );
        Harness {
            _dir: dir,
            store,
            dispatcher,
            deliveries,
            cancels,
        }
    }

    fn make_task(store: &Store, skills: Vec<String>) -> Task {
        store.create_session("s1", "counting").unwrap();
        let request = TaskRequest {
            message: "do the thing".into(),
            skills,
            ..Default::default()
        };
        let task = Task::from_request("s1", "counting", request, &ChannelDefaults::default());
        store.create_task(task).unwrap()
    }

    fn frame(kind: &str, content: &str) -> String {
        format!("event: {kind}\ndata: {{\"content\":{}}}\n\n", serde_json::json!(content))
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_completes_and_delivers_once() {
        let script = vec![
            (frame("text", "Hello "), 0),
            (frame("text", "world"), 0),
            ("event: done\ndata: {\"content\":\"\",\"metadata\":{\"cost_usd\":0.5,\"turns\":3}}\n\n".to_string(), 0),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        h.dispatcher.run_task(task.id, None).await;

        let done = h.store.get_task(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("Hello world"));
        assert_eq!(done.worker_id.as_deref(), Some("mock-worker"));
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());
        let stats = done.stats.unwrap();
        assert_eq!(stats.turns, 3);
        assert!((stats.cost_usd - 0.5).abs() < f64::EPSILON);

        // text, text, done — all persisted, in order.
        let logs = h.store.read_logs(&task.id, None, 100);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].kind, "text");
        assert_eq!(logs[2].kind, "done");

        // Prepare skipped (no skills), delivery exactly once.
        assert_eq!(worker.state.prepare_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.deliveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscriber_receives_frames_in_order() {
        let script = vec![
            (frame("text", "a"), 0),
            (frame("tool_call", "ls"), 0),
            (frame("done", ""), 0),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        let (tx, mut rx) = mpsc::channel(64);
        h.dispatcher
            .run_task(task.id, Some(Subscriber::new(tx)))
            .await;

        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.session_id.as_deref(), Some("s1"));
            kinds.push(frame.kind);
        }
        assert_eq!(kinds, vec!["text", "tool_call", "done"]);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_stop_persistence() {
        let script = vec![
            (frame("text", "one"), 0),
            (frame("text", "two"), 0),
            (frame("done", ""), 0),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        let (tx, rx) = mpsc::channel(64);
        drop(rx); // peer disconnected before the stream starts
        h.dispatcher
            .run_task(task.id, Some(Subscriber::new(tx)))
            .await;

        let done = h.store.get_task(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.store.count_logs(&task.id), 3);
    }

    #[tokio::test]
    async fn prepare_failure_fails_task_without_delivery() {
        let worker = spawn_mock_worker(true, vec![]).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec!["code".into()]);

        h.dispatcher.run_task(task.id, None).await;

        let failed = h.store.get_task(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error.as_ref().unwrap().contains("skill install exploded"));
        assert!(failed.finished_at.is_some());
        assert_eq!(worker.state.prepare_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.deliveries.load(Ordering::SeqCst), 0);
        assert_eq!(worker.state.push_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prepare_failure_notifies_subscriber_with_synthetic_frames() {
        let worker = spawn_mock_worker(true, vec![]).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec!["code".into()]);

        let (tx, mut rx) = mpsc::channel(16);
        h.dispatcher
            .run_task(task.id, Some(Subscriber::new(tx)))
            .await;

        let error_frame = rx.recv().await.unwrap();
        assert_eq!(error_frame.kind, "error");
        let done_frame = rx.recv().await.unwrap();
        assert_eq!(done_frame.kind, "done");
    }

    #[tokio::test]
    async fn worker_error_event_fails_task() {
        let script = vec![
            (frame("text", "partial"), 0),
            (frame("error", "model blew up"), 0),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        h.dispatcher.run_task(task.id, None).await;

        let failed = h.store.get_task(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("model blew up"));
        assert_eq!(h.deliveries.load(Ordering::SeqCst), 0);
        // Both events are history.
        assert_eq!(h.store.count_logs(&task.id), 2);
    }

    #[tokio::test]
    async fn stream_end_without_done_completes_with_accumulated_text() {
        let script = vec![(frame("text", "all I got"), 0)];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        h.dispatcher.run_task(task.id, None).await;

        let done = h.store.get_task(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("all I got"));
    }

    #[tokio::test]
    async fn trailing_events_after_done_only_append_history() {
        let script = vec![
            (frame("text", "result"), 0),
            (frame("done", ""), 0),
            (frame("text", "late straggler"), 0),
            (frame("done", ""), 0),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        h.dispatcher.run_task(task.id, None).await;

        let done = h.store.get_task(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        // Result frozen at the first terminal event.
        assert_eq!(done.result.as_deref(), Some("result"));
        // But every frame is history.
        assert_eq!(h.store.count_logs(&task.id), 4);
        assert_eq!(h.deliveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_sticky_and_keeps_draining() {
        // Slow stream: text, long pause, done.
        let script = vec![
            (frame("text", "started"), 0),
            (frame("done", ""), 400),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        let dispatcher = Arc::new(h.dispatcher);
        let run = {
            let dispatcher = dispatcher.clone();
            let task_id = task.id;
            tokio::spawn(async move { dispatcher.run_task(task_id, None).await })
        };

        // Let the task reach running, then cancel the way the API does:
        // interrupt the worker, then mark canceled.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let running = h.store.get_task(&task.id).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        dispatcher.interrupt_worker(&running).await;
        h.store
            .update_task(&task.id, TaskPatch::status(TaskStatus::Canceled))
            .unwrap();

        run.await.unwrap();

        let final_task = h.store.get_task(&task.id).unwrap();
        assert_eq!(final_task.status, TaskStatus::Canceled);
        assert!(final_task.result.is_none());
        // The worker got a best-effort /cancel.
        assert_eq!(worker.state.cancel_calls.load(Ordering::SeqCst), 1);
        // The late done frame was still drained into the log.
        let logs = h.store.read_logs(&task.id, None, 100);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].kind, "done");
        // Canceled tasks are not delivered.
        assert_eq!(h.deliveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn push_notification_fires_once_on_completion() {
        let script = vec![(frame("text", "r"), 0), (frame("done", ""), 0)];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);

        h.store.create_session("s1", "counting").unwrap();
        let request = TaskRequest {
            message: "m".into(),
            push: Some(wg_domain::model::PushConfig {
                url: format!("{}/push", worker.base_url),
                auth_header: Some("Bearer tok".into()),
                events: vec![],
            }),
            ..Default::default()
        };
        let task = Task::from_request("s1", "counting", request, &ChannelDefaults::default());
        let task = h.store.create_task(task).unwrap();

        h.dispatcher.run_task(task.id, None).await;

        assert_eq!(worker.state.push_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn push_filter_skips_unwanted_status() {
        // Worker errors out; push filter only wants "completed".
        let script = vec![(frame("error", "boom"), 0)];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);

        h.store.create_session("s1", "counting").unwrap();
        let request = TaskRequest {
            message: "m".into(),
            push: Some(wg_domain::model::PushConfig {
                url: format!("{}/push", worker.base_url),
                auth_header: None,
                events: vec!["completed".into()],
            }),
            ..Default::default()
        };
        let task = Task::from_request("s1", "counting", request, &ChannelDefaults::default());
        let task = h.store.create_task(task).unwrap();

        h.dispatcher.run_task(task.id, None).await;

        assert_eq!(
            h.store.get_task(&task.id).unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(worker.state.push_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_worker_event_kinds_are_persisted_and_forwarded() {
        let script = vec![
            ("event: telemetry\ndata: {\"content\":\"cpu=2%\"}\n\n".to_string(), 0),
            (frame("done", ""), 0),
        ];
        let worker =
            spawn_mock_worker(false, script.iter().map(|(f, d)| (f.as_str(), *d)).collect()).await;
        let h = harness(&worker.base_url);
        let task = make_task(&h.store, vec![]);

        let (tx, mut rx) = mpsc::channel(16);
        h.dispatcher
            .run_task(task.id, Some(Subscriber::new(tx)))
            .await;

        let logs = h.store.read_logs(&task.id, None, 10);
        assert_eq!(logs[0].kind, "telemetry");
        assert_eq!(logs[0].content, "cpu=2%");
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.kind, "telemetry");
    }

    #[test]
    fn cancel_map_roundtrip() {
        let map = CancelMap::new();
        let id = Uuid::new_v4();
        let token = map.register(id);
        assert!(!token.is_canceled());

        // No endpoint bound yet: cancel signals but returns no endpoint.
        assert!(map.cancel(&id).is_none());
        assert!(token.is_canceled());

        let token2 = map.register(id);
        map.set_endpoint(
            &id,
            Endpoint {
                url: "http://w".into(),
                container_id: "c".into(),
            },
        );
        let endpoint = map.cancel(&id).unwrap();
        assert_eq!(endpoint.container_id, "c");
        assert!(token2.is_canceled());

        map.remove(&id);
        assert!(map.cancel(&id).is_none());
    }

    #[test]
    fn stats_clamp_negative_cost() {
        let event = WorkerEvent {
            kind: "done".into(),
            content: String::new(),
            metadata: Some(serde_json::json!({"cost_usd": -1.0, "turns": 2})),
        };
        let stats = stats_from(&event, Instant::now());
        assert_eq!(stats.cost_usd, 0.0);
        assert_eq!(stats.turns, 2);
    }
}

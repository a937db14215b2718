//! Task map backed by `tasks.json`, with partial-update semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use wg_domain::model::{ExecStats, Task, TaskStatus};
use wg_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Patch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Partial field update for a task. Unset fields are left untouched.
///
/// `started_at` / `finished_at` are not settable from outside: the store
/// stamps them on the pending→running and terminal transitions.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub result: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub stats: Option<ExecStats>,
    pub worker_id: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn stats(mut self, stats: ExecStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// List filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filter and pagination for task listings. Results are newest-first.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub session_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            session_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct TaskMap {
    path: PathBuf,
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl TaskMap {
    pub(crate) fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("tasks.json");
        let tasks = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::debug!(count = tasks.len(), path = %path.display(), "tasks loaded");

        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    pub(crate) fn insert(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.write();
        tasks.insert(task.id, task.clone());
        self.persist(&tasks)?;
        Ok(task)
    }

    pub(crate) fn get(&self, id: &Uuid) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    /// Apply a patch. Terminal tasks are immutable: the patch is dropped
    /// and the stored record returned as-is.
    pub(crate) fn update(&self, id: &Uuid, patch: TaskPatch) -> Result<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| wg_domain::Error::NotFound(format!("task {id}")))?;

        if task.status.is_terminal() {
            tracing::debug!(task_id = %id, status = task.status.as_str(), "patch against terminal task ignored");
            return Ok(task.clone());
        }

        if let Some(status) = patch.status {
            if task.status == TaskStatus::Pending && status == TaskStatus::Running {
                task.started_at = Some(Utc::now());
            }
            if status.is_terminal() {
                task.finished_at = Some(Utc::now());
            }
            task.status = status;
        }
        if let Some(result) = patch.result {
            task.result = Some(result);
        }
        if let Some(output) = patch.output {
            task.output = Some(output);
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        if let Some(stats) = patch.stats {
            task.stats = Some(stats);
        }
        if let Some(worker_id) = patch.worker_id {
            task.worker_id = Some(worker_id);
        }

        let updated = task.clone();
        self.persist(&tasks)?;
        Ok(updated)
    }

    pub(crate) fn list_by_session(&self, session_id: &str) -> Vec<Task> {
        let tasks = self.tasks.read();
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matching
    }

    /// Filtered page plus total matching count, newest first.
    pub(crate) fn list(&self, filter: &TaskFilter) -> (Vec<Task>, usize) {
        let tasks = self.tasks.read();
        let mut matching: Vec<&Task> = tasks
            .values()
            .filter(|t| {
                filter
                    .session_id
                    .as_deref()
                    .map_or(true, |sid| t.session_id == sid)
                    && filter.status.map_or(true, |s| t.status == s)
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        (page, total)
    }

    /// Remove all tasks of a session; returns the removed ids.
    pub(crate) fn remove_by_session(&self, session_id: &str) -> Result<Vec<Uuid>> {
        let mut tasks = self.tasks.write();
        let ids: Vec<Uuid> = tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            tasks.remove(id);
        }
        if !ids.is_empty() {
            self.persist(&tasks)?;
        }
        Ok(ids)
    }

    fn persist(&self, tasks: &HashMap<Uuid, Task>) -> Result<()> {
        let json = serde_json::to_string_pretty(tasks)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

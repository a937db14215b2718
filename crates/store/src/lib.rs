//! Durable state for sessions, tasks, and task logs.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/sessions.json          # map id → Session
//! <data_dir>/tasks.json             # map id → Task
//! <data_dir>/logs/<task_id>.jsonl   # append-only log entries
//! ```
//!
//! In-memory maps behind `parking_lot::RwLock` are authoritative during a
//! process lifetime; every mutation persists before returning. The [`Store`]
//! facade owns the three sub-stores and enforces the cross-cutting rules:
//! tasks cannot exist without their session, and deleting a session cascades
//! to its tasks and logs.

mod logs;
mod sessions;
mod tasks;

use std::path::Path;

use uuid::Uuid;

use wg_domain::model::{Session, Task, TaskLogEntry, TaskStatus};
use wg_domain::{Error, Result};

pub use tasks::{TaskFilter, TaskPatch};

pub struct Store {
    sessions: sessions::SessionMap,
    tasks: tasks::TaskMap,
    logs: logs::LogStore,
}

impl Store {
    /// Open (or initialize) the store rooted at `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            sessions: sessions::SessionMap::load(data_dir)?,
            tasks: tasks::TaskMap::load(data_dir)?,
            logs: logs::LogStore::open(data_dir)?,
        })
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Idempotent insert: an existing session is returned unchanged.
    pub fn create_session(&self, id: &str, channel_type: &str) -> Result<(Session, bool)> {
        self.sessions.create(id, channel_type)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id)
    }

    /// All sessions, most recently active first.
    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.list()
    }

    pub fn update_session_title(&self, id: &str, title: &str) -> Result<bool> {
        self.sessions.set_title(id, title)
    }

    pub fn touch_session(&self, id: &str) -> Result<bool> {
        self.sessions.touch(id)
    }

    /// Delete a session and cascade to its tasks and logs.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        if !self.sessions.remove(id)? {
            return Ok(false);
        }
        let task_ids = self.tasks.remove_by_session(id)?;
        for task_id in &task_ids {
            self.logs.remove(task_id);
        }
        tracing::info!(session_id = id, tasks = task_ids.len(), "session deleted");
        Ok(true)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Insert a pending task. The owning session must exist.
    pub fn create_task(&self, task: Task) -> Result<Task> {
        if self.sessions.get(&task.session_id).is_none() {
            return Err(Error::NotFound(format!(
                "session {} does not exist",
                task.session_id
            )));
        }
        if task.status != TaskStatus::Pending {
            return Err(Error::BadRequest("new tasks must be pending".into()));
        }
        self.tasks.insert(task)
    }

    pub fn get_task(&self, id: &Uuid) -> Option<Task> {
        self.tasks.get(id)
    }

    /// Partial update. Patches against a terminal task are ignored and the
    /// stored record is returned unchanged.
    pub fn update_task(&self, id: &Uuid, patch: TaskPatch) -> Result<Task> {
        self.tasks.update(id, patch)
    }

    pub fn list_tasks_by_session(&self, session_id: &str) -> Vec<Task> {
        self.tasks.list_by_session(session_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> (Vec<Task>, usize) {
        self.tasks.list(filter)
    }

    // ── Task logs ─────────────────────────────────────────────────────

    /// Append one log entry, assigning the next dense `seq` atomically.
    pub fn append_log(
        &self,
        task_id: &Uuid,
        kind: &str,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<u64> {
        self.logs.append(task_id, kind, content, metadata)
    }

    /// Entries with `seq > after` (or from the start when `after` is None),
    /// ordered by seq ascending, at most `limit`.
    pub fn read_logs(&self, task_id: &Uuid, after: Option<u64>, limit: usize) -> Vec<TaskLogEntry> {
        self.logs.read(task_id, after, limit)
    }

    /// Total entries for the task (== next seq, since seqs are dense).
    pub fn count_logs(&self, task_id: &Uuid) -> u64 {
        self.logs.count(task_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

//! Append-only JSONL task logs with dense per-task sequence numbers.
//!
//! Each task gets a `<task_id>.jsonl` file under `logs/`. The next seq per
//! task lives in an in-memory counter seeded from disk on first touch; all
//! seq assignment happens under one mutex so concurrent appenders can never
//! produce a gap or duplicate.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use wg_domain::model::TaskLogEntry;
use wg_domain::{Error, Result};

pub(crate) struct LogStore {
    dir: PathBuf,
    /// task_id → next seq to assign.
    counters: Mutex<HashMap<Uuid, u64>>,
}

impl LogStore {
    pub(crate) fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("logs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counters: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, task_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{task_id}.jsonl"))
    }

    /// Append one entry; returns the assigned seq. A write failure here is
    /// a `PersistError` and is fatal to the caller's stream.
    pub(crate) fn append(
        &self,
        task_id: &Uuid,
        kind: &str,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<u64> {
        let mut counters = self.counters.lock();
        let seq = match counters.get(task_id) {
            Some(next) => *next,
            None => self.seed_from_disk(task_id),
        };

        let entry = TaskLogEntry {
            task_id: *task_id,
            seq,
            kind: kind.to_owned(),
            content: content.to_owned(),
            metadata,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| Error::PersistError(format!("serializing log entry: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(task_id))
            .map_err(|e| Error::PersistError(format!("opening log file: {e}")))?;
        writeln!(file, "{json}").map_err(|e| Error::PersistError(format!("appending log: {e}")))?;

        counters.insert(*task_id, seq + 1);
        Ok(seq)
    }

    /// Entries with `seq > after` (all from the start when `after` is None),
    /// seq ascending, at most `limit`.
    pub(crate) fn read(&self, task_id: &Uuid, after: Option<u64>, limit: usize) -> Vec<TaskLogEntry> {
        let path = self.path_for(task_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };

        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskLogEntry>(line) {
                Ok(entry) => {
                    if after.map_or(true, |a| entry.seq > a) {
                        entries.push(entry);
                        if entries.len() >= limit {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "skipping malformed log line");
                }
            }
        }
        entries
    }

    /// Total entries for the task. Seqs are dense, so this equals next seq.
    pub(crate) fn count(&self, task_id: &Uuid) -> u64 {
        let mut counters = self.counters.lock();
        match counters.get(task_id) {
            Some(next) => *next,
            None => {
                let next = self.seed_from_disk(task_id);
                counters.insert(*task_id, next);
                next
            }
        }
    }

    /// Delete the task's log file and counter (session cascade only).
    pub(crate) fn remove(&self, task_id: &Uuid) {
        self.counters.lock().remove(task_id);
        let path = self.path_for(task_id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to delete log file");
            }
        }
    }

    /// Next seq derived from the last well-formed line on disk.
    fn seed_from_disk(&self, task_id: &Uuid) -> u64 {
        let path = self.path_for(task_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return 0,
        };
        raw.lines()
            .rev()
            .find_map(|line| serde_json::from_str::<TaskLogEntry>(line).ok())
            .map(|entry| entry.seq + 1)
            .unwrap_or(0)
    }
}

//! Session map backed by `sessions.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;

use wg_domain::model::Session;
use wg_domain::Result;

pub(crate) struct SessionMap {
    path: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionMap {
    pub(crate) fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("sessions.json");
        let sessions = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::debug!(count = sessions.len(), path = %path.display(), "sessions loaded");

        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
        })
    }

    /// Returns `(session, created)`; an existing id is a no-op.
    pub(crate) fn create(&self, id: &str, channel_type: &str) -> Result<(Session, bool)> {
        // Fast path: already exists.
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(id) {
                return Ok((existing.clone(), false));
            }
        }

        let session = Session::new(id, channel_type);
        let mut sessions = self.sessions.write();
        // Re-check under the write lock; another writer may have won.
        if let Some(existing) = sessions.get(id) {
            return Ok((existing.clone(), false));
        }
        sessions.insert(id.to_owned(), session.clone());
        self.persist(&sessions)?;
        Ok((session, true))
    }

    pub(crate) fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    pub(crate) fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        sessions
    }

    pub(crate) fn set_title(&self, id: &str, title: &str) -> Result<bool> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(id) {
            Some(session) => {
                session.title = Some(title.to_owned());
                self.persist(&sessions)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn touch(&self, id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(id) {
            Some(session) => {
                session.last_active = Utc::now();
                self.persist(&sessions)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn remove(&self, id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write();
        if sessions.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&sessions)?;
        Ok(true)
    }

    fn persist(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let json = serde_json::to_string_pretty(sessions)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

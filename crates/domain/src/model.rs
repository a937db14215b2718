//! Core data model: sessions, tasks, task logs, and the unified task request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An execution environment shared by the tasks that target it.
///
/// A session maps to exactly one worker instance at the driver level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub channel_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, channel_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            channel_type: channel_type.into(),
            title: None,
            created_at: now,
            last_active: now,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// True while cancellation is still allowed.
    pub fn is_cancelable(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::InputRequired)
    }

    /// The snake_case wire name (matches the serde representation).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::InputRequired => "input_required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execution statistics reported by the worker on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecStats {
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Outbound push-notification descriptor, configured per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub url: String,
    /// Value for the `Authorization` header, sent verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    /// Terminal statuses to push for. Empty = all.
    #[serde(default)]
    pub events: Vec<String>,
}

impl PushConfig {
    /// Whether the filter admits the given terminal status.
    pub fn wants(&self, status: TaskStatus) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == status.as_str())
    }
}

/// One request→response execution: the unit of scheduling, observability,
/// and cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub session_id: String,
    pub channel_type: String,
    /// Opaque channel payload, passed through to delivery untouched.
    #[serde(default)]
    pub channel_meta: serde_json::Value,
    pub status: TaskStatus,
    pub message: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub bridge_configs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ExecStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Materialize a pending task from a translated request. Channel
    /// defaults are merged here, once, and frozen on the record.
    pub fn from_request(
        session_id: impl Into<String>,
        channel_type: impl Into<String>,
        request: TaskRequest,
        defaults: &ChannelDefaults,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            channel_type: channel_type.into(),
            channel_meta: request.channel_meta,
            status: TaskStatus::Pending,
            message: request.message,
            skills: merge_defaults(&defaults.skills, &request.skills),
            bridge_configs: merge_defaults(&defaults.bridge_configs, &request.bridge_configs),
            push: request.push,
            result: None,
            output: None,
            error: None,
            stats: None,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task log entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single streamed event, durably recorded with a dense per-task `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: Uuid,
    pub seq: u64,
    pub kind: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task request (channel translate output)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The unified request a channel produces from its inbound payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub bridge_configs: Vec<serde_json::Value>,
    #[serde(default)]
    pub channel_meta: serde_json::Value,
    #[serde(default)]
    pub push: Option<PushConfig>,
}

/// Default capability declaration of a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelDefaults {
    pub skills: Vec<String>,
    pub bridge_configs: Vec<serde_json::Value>,
}

/// Merge channel defaults with the per-request list: defaults first,
/// order preserved on both sides.
pub fn merge_defaults<T: Clone>(defaults: &[T], requested: &[T]) -> Vec<T> {
    let mut merged = Vec::with_capacity(defaults.len() + requested.len());
    merged.extend_from_slice(defaults);
    merged.extend_from_slice(requested);
    merged
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::InputRequired.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn status_is_cancelable() {
        assert!(TaskStatus::Pending.is_cancelable());
        assert!(TaskStatus::Running.is_cancelable());
        assert!(TaskStatus::InputRequired.is_cancelable());
        assert!(!TaskStatus::Completed.is_cancelable());
        assert!(!TaskStatus::Canceled.is_cancelable());
    }

    #[test]
    fn status_snake_case_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InputRequired).unwrap(),
            "\"input_required\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Canceled).unwrap(),
            "\"canceled\""
        );
        let back: TaskStatus = serde_json::from_str("\"input_required\"").unwrap();
        assert_eq!(back, TaskStatus::InputRequired);
    }

    #[test]
    fn status_as_str_matches_serde() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::InputRequired,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn merge_preserves_order_defaults_first() {
        let defaults = vec!["code".to_string(), "search".to_string()];
        let requested = vec!["deploy".to_string()];
        let merged = merge_defaults(&defaults, &requested);
        assert_eq!(merged, vec!["code", "search", "deploy"]);
    }

    #[test]
    fn merge_idempotent_against_empty_request() {
        let defaults = vec!["a".to_string(), "b".to_string()];
        let once = merge_defaults(&defaults, &[]);
        assert_eq!(once, defaults);
        // Merging the already-merged list with an empty request changes nothing.
        let twice = merge_defaults(&once, &[]);
        assert_eq!(twice, once);
    }

    #[test]
    fn merge_empty_defaults_is_request() {
        let requested = vec!["x".to_string()];
        assert_eq!(merge_defaults(&[], &requested), requested);
    }

    #[test]
    fn task_from_request_freezes_merged_lists() {
        let defaults = ChannelDefaults {
            skills: vec!["base".into()],
            bridge_configs: vec![serde_json::json!({"bridge": "default"})],
        };
        let request = TaskRequest {
            message: "hi".into(),
            skills: vec!["extra".into()],
            ..Default::default()
        };
        let task = Task::from_request("s1", "duplex", request, &defaults);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.skills, vec!["base", "extra"]);
        assert_eq!(task.bridge_configs.len(), 1);
        assert!(task.started_at.is_none());
        assert!(task.finished_at.is_none());
    }

    #[test]
    fn push_filter_empty_admits_all() {
        let push = PushConfig {
            url: "http://cb".into(),
            auth_header: None,
            events: vec![],
        };
        assert!(push.wants(TaskStatus::Completed));
        assert!(push.wants(TaskStatus::Failed));
    }

    #[test]
    fn push_filter_matches_status_name() {
        let push = PushConfig {
            url: "http://cb".into(),
            auth_header: None,
            events: vec!["completed".into()],
        };
        assert!(push.wants(TaskStatus::Completed));
        assert!(!push.wants(TaskStatus::Failed));
    }

    #[test]
    fn session_new_sets_timestamps() {
        let s = Session::new("abc", "duplex");
        assert_eq!(s.id, "abc");
        assert_eq!(s.channel_type, "duplex");
        assert!(s.title.is_none());
        assert_eq!(s.created_at, s.last_active);
    }
}

//! Wire frames: worker event stream and the browser duplex protocol.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for the worker event stream.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker event stream (SSE, worker → control plane)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One framed event from the worker's `/chat` stream.
///
/// `kind` is an open set: `text`, `tool_call`, `tool_result`, `error`,
/// `done` are understood by the dispatcher; anything else is persisted and
/// forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub kind: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WorkerEvent {
    pub fn is_done(&self) -> bool {
        self.kind == "done"
    }

    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Duplex protocol (browser ↔ control plane)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inbound frame from the browser peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Chat {
        #[serde(default)]
        session_id: Option<String>,
        message: String,
        #[serde(default)]
        skills: Vec<String>,
        #[serde(default)]
        bridge_configs: Vec<serde_json::Value>,
    },
    Ping,
}

/// Outbound frame to the browser peer.
///
/// The type field is an open string rather than an enum so that unknown
/// worker event kinds are forwarded verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ServerFrame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: None,
            session_id: None,
            metadata: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn pong() -> Self {
        Self::new("pong")
    }

    pub fn session_created(session_id: &str) -> Self {
        Self::new("session_created").with_session(session_id)
    }

    pub fn session_title(session_id: &str, title: &str) -> Self {
        Self::new("session_title")
            .with_session(session_id)
            .with_content(title)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error").with_content(message)
    }

    pub fn done() -> Self {
        Self::new("done")
    }

    /// Forwarding projection of a worker event for a given session.
    pub fn from_worker_event(event: &WorkerEvent, session_id: &str) -> Self {
        Self {
            kind: event.kind.clone(),
            content: Some(event.content.clone()),
            session_id: Some(session_id.to_owned()),
            metadata: event.metadata.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_chat_minimal() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"chat","message":"hi"}"#).unwrap();
        match frame {
            ClientFrame::Chat {
                session_id,
                message,
                skills,
                bridge_configs,
            } => {
                assert!(session_id.is_none());
                assert_eq!(message, "hi");
                assert!(skills.is_empty());
                assert!(bridge_configs.is_empty());
            }
            ClientFrame::Ping => panic!("expected chat"),
        }
    }

    #[test]
    fn client_frame_ping() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn client_frame_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn server_frame_omits_empty_fields() {
        let json = serde_json::to_string(&ServerFrame::pong()).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn server_frame_forwards_unknown_kind() {
        let event = WorkerEvent {
            kind: "telemetry".into(),
            content: "cpu=3%".into(),
            metadata: None,
        };
        let frame = ServerFrame::from_worker_event(&event, "s1");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "telemetry");
        assert_eq!(json["content"], "cpu=3%");
        assert_eq!(json["session_id"], "s1");
    }

    #[test]
    fn worker_event_kind_predicates() {
        let done = WorkerEvent {
            kind: "done".into(),
            content: String::new(),
            metadata: None,
        };
        assert!(done.is_done());
        assert!(!done.is_error());
    }
}

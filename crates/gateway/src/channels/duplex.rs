//! Interactive duplex channel.
//!
//! Verification is satisfied by connection acceptance: the WebSocket
//! handshake already admitted the peer, so `verify` is always true.

use serde::Deserialize;

use wg_domain::model::{ChannelDefaults, TaskRequest};

use super::{Channel, InboundRequest};

#[derive(Debug, Deserialize)]
struct ChatPayload {
    #[serde(default)]
    session_id: Option<String>,
    message: String,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    bridge_configs: Vec<serde_json::Value>,
}

#[derive(Default)]
pub struct DuplexChannel;

impl DuplexChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Channel for DuplexChannel {
    fn channel_type(&self) -> &str {
        "duplex"
    }

    fn defaults(&self) -> ChannelDefaults {
        ChannelDefaults::default()
    }

    fn verify(&self, _request: &InboundRequest) -> bool {
        true
    }

    fn translate(&self, request: &InboundRequest) -> Option<TaskRequest> {
        let payload: ChatPayload = serde_json::from_slice(&request.body).ok()?;
        if payload.message.is_empty() {
            return None;
        }
        Some(TaskRequest {
            session_id: payload.session_id,
            message: payload.message,
            skills: payload.skills,
            bridge_configs: payload.bridge_configs,
            channel_meta: serde_json::Value::Null,
            push: None,
        })
    }
}

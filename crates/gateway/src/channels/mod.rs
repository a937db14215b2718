//! Polymorphic ingress channels.
//!
//! A channel is a named capability: verify the raw inbound request,
//! translate it into the unified [`TaskRequest`], declare default skills
//! and tool-bridge configs, and optionally deliver the finished task back
//! to the originating platform.

pub mod duplex;
pub mod webhook_demo;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use wg_domain::model::{ChannelDefaults, Task, TaskRequest};
use wg_domain::Result;

pub use duplex::DuplexChannel;
pub use webhook_demo::WebhookDemoChannel;

/// A raw inbound request: lowercase header map plus the unparsed body.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn from_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel type key.
    fn channel_type(&self) -> &str;

    /// Default skills and bridge configs merged into every task.
    fn defaults(&self) -> ChannelDefaults;

    /// Signature/auth check over the raw request.
    fn verify(&self, request: &InboundRequest) -> bool;

    /// Map the channel payload to a task request. `None` means "ignore"
    /// (e.g. an event type this channel does not act on).
    fn translate(&self, request: &InboundRequest) -> Option<TaskRequest>;

    /// Whether [`Channel::deliver`] should be invoked on completion.
    fn delivers(&self) -> bool {
        false
    }

    /// Channel-bound post-completion side effect. Invoked at most once per
    /// task; failures are logged by the dispatcher, never propagated.
    async fn deliver(&self, _task: &Task) -> Result<()> {
        Ok(())
    }
}

/// Process-wide map from channel-type string to capability.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let key = channel.channel_type().to_owned();
        if self.channels.insert(key.clone(), channel).is_some() {
            tracing::warn!(channel_type = %key, "channel re-registered, previous entry replaced");
        }
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(channel_type).cloned()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.channels.keys().cloned().collect();
        types.sort();
        types
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

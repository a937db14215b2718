//! Platform webhook channel.
//!
//! Inbound requests are verified with HMAC-SHA256 over the raw body
//! (GitHub-style `X-Hub-Signature-256: sha256=<hex>` header, constant-time
//! comparison). Payloads with `action: "run"` translate into tasks; every
//! other action is ignored. When a callback URL is configured, completed
//! tasks are delivered back to it as a JSON POST.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use wg_domain::config::WebhookDemoConfig;
use wg_domain::model::{ChannelDefaults, PushConfig, Task, TaskRequest};
use wg_domain::{Error, Result};

use super::{Channel, InboundRequest};

type HmacSha256 = Hmac<Sha256>;

const DELIVER_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    action: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    bridge_configs: Vec<serde_json::Value>,
    #[serde(default)]
    push: Option<PushConfig>,
}

pub struct WebhookDemoChannel {
    config: WebhookDemoConfig,
    http: reqwest::Client,
}

impl WebhookDemoChannel {
    pub fn new(config: WebhookDemoConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn signature_matches(&self, secret: &str, request: &InboundRequest) -> bool {
        let sig_header = request.header(SIGNATURE_HEADER).unwrap_or("");
        let sig_hex = sig_header.strip_prefix("sha256=").unwrap_or(sig_header);

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(&request.body);
        let computed = hex::encode(mac.finalize().into_bytes());

        // Constant-time comparison to prevent timing attacks.
        computed.as_bytes().ct_eq(sig_hex.as_bytes()).unwrap_u8() == 1
    }
}

#[async_trait::async_trait]
impl Channel for WebhookDemoChannel {
    fn channel_type(&self) -> &str {
        "webhook-demo"
    }

    fn defaults(&self) -> ChannelDefaults {
        ChannelDefaults {
            skills: self.config.skills.clone(),
            bridge_configs: Vec::new(),
        }
    }

    fn verify(&self, request: &InboundRequest) -> bool {
        match &self.config.secret {
            Some(secret) => self.signature_matches(secret, request),
            // No secret configured: accept unsigned (dev mode).
            None => true,
        }
    }

    fn translate(&self, request: &InboundRequest) -> Option<TaskRequest> {
        let raw: serde_json::Value = serde_json::from_slice(&request.body).ok()?;
        let payload: WebhookPayload = serde_json::from_value(raw.clone()).ok()?;
        if payload.action != "run" || payload.message.is_empty() {
            return None;
        }
        Some(TaskRequest {
            session_id: payload.session_id,
            message: payload.message,
            skills: payload.skills,
            bridge_configs: payload.bridge_configs,
            channel_meta: raw,
            push: payload.push,
        })
    }

    fn delivers(&self) -> bool {
        self.config.callback_url.is_some()
    }

    async fn deliver(&self, task: &Task) -> Result<()> {
        let Some(callback_url) = &self.config.callback_url else {
            return Ok(());
        };
        let body = serde_json::json!({
            "taskId": task.id,
            "status": task.status,
            "result": task.result,
            "channelMeta": task.channel_meta,
        });
        let response = self
            .http
            .post(callback_url)
            .timeout(DELIVER_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::DeliverError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::DeliverError(format!(
                "callback returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

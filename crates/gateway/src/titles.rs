//! Fire-and-forget session title generation.
//!
//! Runs concurrently with the first task of a new session against an
//! OpenAI-compatible chat-completions endpoint. On success it updates the
//! session title in the store and emits a side-channel `session_title`
//! frame; on any failure it logs and disappears — it must never block or
//! fail the task.

use std::time::Duration;

use serde::Deserialize;

use wg_domain::event::ServerFrame;

use crate::dispatch::Subscriber;
use crate::state::AppState;

const TITLE_TIMEOUT: Duration = Duration::from_secs(10);
const TITLE_MAX_CHARS: usize = 80;

const SYSTEM_PROMPT: &str = "Write a short title (max 6 words) for a conversation \
that starts with the following user message. Reply with the title only, no quotes.";

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

/// Spawn title generation for a freshly minted session.
pub fn spawn_title_generation(
    state: AppState,
    session_id: String,
    first_message: String,
    subscriber: Option<Subscriber>,
) {
    if state.config.titles.api_key.is_none() {
        return;
    }
    tokio::spawn(async move {
        match generate(&state, &first_message).await {
            Ok(title) => {
                if let Err(e) = state.store.update_session_title(&session_id, &title) {
                    tracing::warn!(%session_id, error = %e, "failed to store session title");
                    return;
                }
                tracing::debug!(%session_id, %title, "session title generated");
                if let Some(sub) = subscriber {
                    let _ = sub.send(ServerFrame::session_title(&session_id, &title)).await;
                }
            }
            Err(e) => {
                tracing::debug!(%session_id, error = %e, "title generation failed");
            }
        }
    });
}

async fn generate(state: &AppState, first_message: &str) -> Result<String, String> {
    let titles = &state.config.titles;
    let api_key = titles.api_key.as_deref().unwrap_or_default();

    let body = serde_json::json!({
        "model": titles.model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": first_message},
        ],
        "max_tokens": 24,
    });

    let response = reqwest::Client::new()
        .post(format!("{}/chat/completions", titles.base_url.trim_end_matches('/')))
        .timeout(TITLE_TIMEOUT)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("title endpoint returned {}", response.status()));
    }

    let completion: CompletionResponse = response.json().await.map_err(|e| e.to_string())?;
    let raw = completion
        .choices
        .first()
        .map(|c| c.message.content.as_str())
        .unwrap_or_default();
    let title = clean_title(raw);
    if title.is_empty() {
        return Err("empty title".into());
    }
    Ok(title)
}

/// Strip quotes/whitespace and clamp length.
fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(['"', '\'']).trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_title_strips_quotes() {
        assert_eq!(clean_title("\"Fix the build\""), "Fix the build");
        assert_eq!(clean_title("  'Deploy plan'  "), "Deploy plan");
    }

    #[test]
    fn clean_title_clamps_length() {
        let long = "x".repeat(200);
        let cleaned = clean_title(&long);
        assert_eq!(cleaned.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(cleaned.ends_with('…'));
    }

    #[test]
    fn clean_title_empty_input() {
        assert_eq!(clean_title("  \"\"  "), "");
    }
}

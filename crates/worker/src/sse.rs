//! SSE framing for the worker's `/chat` stream.
//!
//! The worker emits UTF-8 framed events:
//!
//! ```text
//! event: <type>\n
//! data: <json>\n
//! \n
//! ```
//!
//! [`drain_frames`] pulls complete frames from a buffer (trailing partial
//! frames stay for the next call); [`worker_event_stream`] turns a
//! `reqwest::Response` into a stream of [`WorkerEvent`]s. Unknown `event:`
//! names pass through verbatim — the dispatcher persists and forwards them.

use wg_domain::event::{BoxStream, WorkerEvent};
use wg_domain::{Error, Result};

/// One raw SSE frame: the `event:` name (if any) plus joined `data:` lines.
#[derive(Debug, PartialEq)]
pub(crate) struct RawFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Extract complete frames from an SSE buffer.
///
/// Frames are delimited by `\n\n`. Within a frame, `event:` sets the type
/// and multiple `data:` lines are joined with `\n` (per the SSE spec);
/// `id:` / `retry:` lines are ignored. The buffer is drained in place.
pub(crate) fn drain_frames(buffer: &mut String) -> Vec<RawFrame> {
    let mut frames = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_owned());
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim());
            }
        }

        if event.is_none() && data_lines.is_empty() {
            continue; // comment-only or empty block
        }
        frames.push(RawFrame {
            event,
            data: data_lines.join("\n"),
        });
    }

    frames
}

/// Decode one raw frame into a [`WorkerEvent`].
///
/// `data` is expected to be `{"content": "...", "metadata": {...}}`; a
/// non-JSON payload becomes the content verbatim so a lax worker build
/// cannot stall the pipeline.
pub(crate) fn decode_frame(frame: RawFrame) -> WorkerEvent {
    let kind = frame.event.unwrap_or_else(|| "text".to_owned());
    match serde_json::from_str::<serde_json::Value>(&frame.data) {
        Ok(value) => {
            let content = value
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_owned();
            let metadata = value.get("metadata").filter(|m| !m.is_null()).cloned();
            WorkerEvent {
                kind,
                content,
                metadata,
            }
        }
        Err(_) => WorkerEvent {
            kind,
            content: frame.data,
            metadata: None,
        },
    }
}

/// Build a [`BoxStream`] of worker events from an SSE `reqwest::Response`.
///
/// The stream buffers incoming chunks, drains complete frames, flushes any
/// trailing partial frame when the body closes, and surfaces transport
/// errors as `Error::StreamError`. It does not synthesize a terminal event:
/// the dispatcher owns the stream-end fallback.
pub fn worker_event_stream(response: reqwest::Response) -> BoxStream<'static, Result<WorkerEvent>> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for frame in drain_frames(&mut buffer) {
                        yield Ok(decode_frame(frame));
                    }
                }
                Ok(None) => {
                    // Body ended — flush a trailing partial frame, if any.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for frame in drain_frames(&mut buffer) {
                            yield Ok(decode_frame(frame));
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(Error::StreamError(e.to_string()));
                    break;
                }
            }
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

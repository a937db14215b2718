//! HTTP + event-stream client to the worker runtime.

mod client;
mod sse;

pub use client::WorkerClient;
pub use sse::worker_event_stream;

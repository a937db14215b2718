//! Duplex interactive ingress.
//!
//! Flow:
//! 1. Browser connects to `GET /ws` (verification = connection acceptance)
//! 2. Inbound `{type:"chat", ...}` frames become tasks on the duplex channel
//! 3. The connection is attached to the dispatcher as the live subscriber;
//!    worker events stream back as outbound frames
//! 4. `{type:"ping"}` / `{type:"pong"}` keep the connection alive
//!
//! The socket is split: a writer task drains an mpsc channel into the sink,
//! and the reader loop below parses inbound frames. The same mpsc sender
//! backs the dispatcher's [`Subscriber`] handle — when the peer goes away
//! the channel closes and the dispatcher silently stops forwarding.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use wg_domain::event::{ClientFrame, ServerFrame};
use wg_domain::model::Task;

use crate::channels::InboundRequest;
use crate::dispatch::Subscriber;
use crate::state::AppState;
use crate::titles;

/// `GET /ws` — upgrade to the duplex protocol.
pub async fn duplex_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: forwards outbound frames to the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "unserializable outbound frame");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!("duplex peer connected");

    // Reader loop.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Ping) => {
                    let _ = outbound_tx.send(ServerFrame::pong()).await;
                }
                Ok(ClientFrame::Chat { .. }) => {
                    handle_chat(&state, &outbound_tx, text.as_bytes()).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "discarding unparseable duplex frame");
                    let _ = outbound_tx
                        .send(ServerFrame::error("unrecognized frame"))
                        .await;
                }
            },
            Message::Close(_) => break,
            // axum answers WS-level ping/pong on its own.
            _ => {}
        }
    }

    writer.abort();
    tracing::debug!("duplex peer disconnected");
}

/// Handle one chat frame: resolve the session, create the task, and run
/// the dispatcher with this connection as the live subscriber.
async fn handle_chat(state: &AppState, outbound_tx: &mpsc::Sender<ServerFrame>, raw: &[u8]) {
    let Some(channel) = state.channels.get("duplex") else {
        tracing::error!("duplex channel not registered");
        return;
    };

    let request = InboundRequest::from_body(raw.to_vec());
    let Some(task_request) = channel.translate(&request) else {
        let _ = outbound_tx
            .send(ServerFrame::error("chat frame missing a message"))
            .await;
        return;
    };

    // Resolve or mint the session.
    let session_id = task_request
        .session_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created = match state.store.create_session(&session_id, "duplex") {
        Ok((_, created)) => created,
        Err(e) => {
            let _ = outbound_tx.send(ServerFrame::error(e.to_string())).await;
            return;
        }
    };
    if created {
        let _ = outbound_tx
            .send(ServerFrame::session_created(&session_id))
            .await;
        titles::spawn_title_generation(
            state.clone(),
            session_id.clone(),
            task_request.message.clone(),
            Some(Subscriber::new(outbound_tx.clone())),
        );
    }

    let task = Task::from_request(&session_id, "duplex", task_request, &channel.defaults());
    let task = match state.store.create_task(task) {
        Ok(task) => task,
        Err(e) => {
            let _ = outbound_tx.send(ServerFrame::error(e.to_string())).await;
            return;
        }
    };

    tracing::info!(task_id = %task.id, session_id = %session_id, "chat task accepted");

    // Run in the background so the reader loop keeps serving pings and
    // further chat frames while the task streams.
    let dispatcher = state.dispatcher.clone();
    let store = state.store.clone();
    let subscriber = Subscriber::new(outbound_tx.clone());
    tokio::spawn(async move {
        dispatcher.run_task(task.id, Some(subscriber)).await;
        let _ = store.touch_session(&session_id);
    });
}

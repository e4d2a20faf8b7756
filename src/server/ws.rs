//! WebSocket handler for the price stream.
//!
//! Clients connect to `/ws` and receive JSON events:
//! - `{ "event": "sol", "data": { ...snapshot } }`
//!
//! The current snapshot is sent right after the upgrade, then one event per
//! broadcaster tick.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AppState;
use crate::core::{current_time_ms, EmitError, CONNECTION_CHANNEL_CAPACITY};

/// Upper bound on delivering the Close frame to a client at shutdown
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler at GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let tasks = state.tasks.clone();
        tasks.track_future(handle_ws(socket, state))
    })
}

/// Handle an individual WebSocket connection.
///
/// Registers with the connection registry and forwards every event queued
/// for it as JSON until the client leaves or the gateway stops.
async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
    let connection = state.registry.on_connect(tx);
    let id = connection.id();

    for event in state.broadcaster.latest_events() {
        if let Err(EmitError::Full) = connection.emit(event) {
            break;
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => break,
            // Forward queued events to the WS client
            event = rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if !send_until_shutdown(&mut socket, Message::Text(json.into()), &state.shutdown).await {
                            // Client disconnected or gateway stopping
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Failed to serialize event");
                    }
                }
            }
            // Handle incoming messages from client (ping/pong + close)
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if !send_until_shutdown(&mut socket, Message::Pong(data), &state.shutdown).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "WebSocket receive error");
                        break;
                    }
                    _ => {
                        // Ignore other incoming messages (text, binary)
                    }
                }
            }
        }
    }

    if state.shutdown.is_cancelled() && !send_close(&mut socket, CLOSE_TIMEOUT).await {
        debug!(connection_id = %id, "Close frame not delivered");
    }

    debug!(
        connection_id = %id,
        session_ms = current_time_ms().saturating_sub(connection.connected_at_ms()),
        "Stream session ended"
    );
    state.registry.on_disconnect(&id);
}

/// Send one frame unless shutdown starts first. Returns `false` if the
/// frame was not delivered.
async fn send_until_shutdown<S>(sink: &mut S, message: Message, shutdown: &CancellationToken) -> bool
where
    S: Sink<Message> + Unpin,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        result = sink.send(message) => result.is_ok(),
    }
}

/// Send a Close frame, giving up after `limit` on a stalled client.
async fn send_close<S>(sink: &mut S, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    matches!(
        tokio::time::timeout(limit, sink.send(Message::Close(None))).await,
        Ok(Ok(()))
    )
}

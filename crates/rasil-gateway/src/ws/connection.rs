//! Per-connection WS task: registers with the fan-out registry, forwards
//! outbound frames, and relays client-side indicator events (typing,
//! recording, presence) back into the same license's stream.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use rasil_core::types::{EventKind, LicenseId};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::AppState;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Deserialize)]
pub struct WsParams {
    pub license: LicenseId,
}

/// GET /ws?license=N: upgrade and run for the connection lifetime.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, params.license))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, license_id: LicenseId) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    state
        .registry
        .clone()
        .register(license_id, conn_id.clone(), tx)
        .await;

    loop {
        tokio::select! {
            // Outbound: frames queued by the registry.
            outbound = rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if sink.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Inbound: client indicator events get rebroadcast to the
            // license's other clients; everything else is ignored.
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        relay_indicator(&state, license_id, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.registry.unregister(license_id, &conn_id);
}

async fn relay_indicator(state: &Arc<AppState>, license_id: LicenseId, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let kind = match value.get("event").and_then(|e| e.as_str()) {
        Some("typing_indicator") => EventKind::TypingIndicator,
        Some("recording_indicator") => EventKind::RecordingIndicator,
        Some("presence_update") => EventKind::PresenceUpdate,
        _ => {
            debug!(license_id, "ignoring unrecognized client ws frame");
            return;
        }
    };
    let data = value.get("data").cloned().unwrap_or(serde_json::json!({}));
    state.registry.broadcast(license_id, kind, data).await;
}

//! The WebSocket push channel.
//!
//! Clients connect once, send `subscribe`/`unsubscribe`/`ping` frames and
//! receive `server_status`/`server_update`/`error`/`pong` frames. Outbound
//! delivery is in order per subscriber; a slow or dead client only stalls
//! its own socket task.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};

use crate::events::{InboundMessage, OutboundMessage};

use super::state::AppState;

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// WebSocket upgrade handler: `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handles one push-channel connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (subscriber_id, mut outbound) = state.events.register().await;
    let (mut sender, mut receiver) = socket.split();

    // Forward bus messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("failed to encode push message: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Apply client frames to the subscription state.
    let events = state.events.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(inbound) => events.handle_inbound(subscriber_id, inbound).await,
                    Err(_) => {
                        events
                            .send_to(
                                subscriber_id,
                                OutboundMessage::Error {
                                    message: format!("unrecognised message: {}", text),
                                    code: Some("bad_message".to_string()),
                                },
                            )
                            .await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(subscriber = subscriber_id, "websocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.events.unregister(subscriber_id).await;
}

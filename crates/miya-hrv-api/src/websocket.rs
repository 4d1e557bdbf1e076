//! WebSocket handler for real-time updates

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use miya_hrv::DeviceEvent;
use miya_protocol::{ConnectionState, StatusSnapshot};
use serde::Serialize;

use crate::AppState;

/// Greeting sent to each client on connect
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Hello {
    Connected {
        state: ConnectionState,
        status: Option<StatusSnapshot>,
    },
}

/// Handle a WebSocket connection
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let device = state.device;

    // Subscribe before the greeting so no update falls in between
    let mut event_rx = device.subscribe();

    let hello = Hello::Connected {
        state: device.transport().state(),
        status: device.current_status(),
    };
    let Some(hello) = to_json(&hello) else {
        return;
    };
    if sender.send(Message::Text(hello)).await.is_err() {
        return;
    }

    // Forward device events to the client
    let send_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let Some(json) = to_json::<DeviceEvent>(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("WebSocket client lagged, skipped {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    // Client messages are ignored; the socket is read only to notice a close
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
}

fn to_json<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!("Failed to serialize WebSocket event: {}", e);
            None
        }
    }
}

//! WebSocket handler for battlefield observers

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::AppState;
use crate::battlefield::{ClientMessage, ServerMessage, SubscriberId};

/// Handle WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an individual observer connection
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.config.outbox_capacity);
    let subscriber = state.battlefield.connect(tx);

    info!("Observer connected: {}", subscriber);

    // Main loop: outbox frames out, client messages in
    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if socket.send(Message::Text(frame.as_ref().into())).await.is_err() {
                    break;
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, subscriber, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.battlefield.unsubscribe_all(subscriber);
    info!("Observer disconnected: {}", subscriber);
}

/// Handle one text frame from the observer
fn handle_client_frame(state: &AppState, subscriber: SubscriberId, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Malformed frame from {}: {}", subscriber, e);
            state.battlefield.send_to(
                subscriber,
                &ServerMessage::Error {
                    message: format!("invalid message: {}", e),
                },
            );
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { encounter_id } => {
            // The battlefield queues the snapshot itself on success
            if let Err(e) =
                state
                    .battlefield
                    .subscribe(subscriber, &encounter_id, state.engine.as_ref())
            {
                state.battlefield.send_to(
                    subscriber,
                    &ServerMessage::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        ClientMessage::Unsubscribe { encounter_id } => {
            state.battlefield.unsubscribe(subscriber, &encounter_id);
        }
        ClientMessage::Ping => {
            state.battlefield.send_to(subscriber, &ServerMessage::Pong);
        }
    }
}

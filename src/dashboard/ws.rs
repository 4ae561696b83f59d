//! WebSocket feed of record and pipeline events.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::events::Event;
use crate::review::EmailStatus;

/// Records included in the sync snapshot.
const SYNC_LIMIT: usize = 200;

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so nothing falls between the two.
    let mut rx = state.events.subscribe();

    if !send_sync(&mut socket, &state).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &state).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Send the pending records. Returns false if the client is gone.
async fn send_sync(socket: &mut WebSocket, state: &AppState) -> bool {
    let emails = match state
        .workflow
        .list(Some(EmailStatus::Pending), SYNC_LIMIT)
        .await
    {
        Ok(emails) => emails,
        Err(e) => {
            warn!(error = %e, "Failed to load pending emails for sync");
            Vec::new()
        }
    };
    send_event(socket, &Event::EmailsSync { emails }).await
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize event");
            true
        }
    }
}

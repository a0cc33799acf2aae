//! WebSocket endpoint for subscribed auditors.
//!
//! Clients authenticate with a bearer token in the query string, then drive
//! the join/leave protocol. Outbound frames flow through the notifier's
//! per-session channel; a dead socket tears the session out of every room.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;

use crate::AppState;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: String,
}

/// Client-emitted protocol messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room: String,
        #[serde(default)]
        filters: HashMap<String, serde_json::Value>,
        #[serde(rename = "userId")]
        user_id: Option<String>,
    },
    LeaveRoom {
        room: String,
    },
}

/// WebSocket handler: `GET /ws?token=...`
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let claims = match state.tokens.verify(&params.token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "websocket auth rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let user_agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, claims.sub, remote_addr, user_agent)
    })
}

/// Handles one connected socket.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    subject: String,
    remote_addr: Option<String>,
    user_agent: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let session_id = state
        .notifier
        .add_session(remote_addr, user_agent, tx.clone())
        .await;
    tracing::info!(%session_id, subject, "websocket session opened");

    let welcome = json!({
        "event": "welcome",
        "sessionId": session_id,
        "timestamp": Utc::now(),
    })
    .to_string();
    let _ = tx.send(welcome);

    // Pump: notifier frames out to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                let parsed: Result<ClientMessage, _> = serde_json::from_str(&text.to_string());
                match parsed {
                    Ok(ClientMessage::JoinRoom { room, filters, user_id }) => {
                        match state.notifier.join_room(session_id, &room, filters).await {
                            Some(ack) => {
                                tracing::debug!(
                                    %session_id,
                                    room = %ack.room,
                                    user_id = user_id.as_deref().unwrap_or(""),
                                    members = ack.member_count,
                                    "joined room"
                                );
                                let frame = json!({
                                    "event": "room-joined",
                                    "room": ack.room,
                                    "memberCount": ack.member_count,
                                    "filters": ack.filters,
                                    "timestamp": Utc::now(),
                                })
                                .to_string();
                                let _ = tx.send(frame);
                            }
                            None => break, // session already torn down
                        }
                    }
                    Ok(ClientMessage::LeaveRoom { room }) => {
                        state.notifier.leave_room(session_id, &room).await;
                    }
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "unparseable client frame");
                        let frame = json!({
                            "event": "error",
                            "message": format!("unparseable message: {e}"),
                            "timestamp": Utc::now(),
                        })
                        .to_string();
                        let _ = tx.send(frame);
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.notifier.remove_session(session_id).await;
    send_task.abort();
    tracing::info!(%session_id, "websocket session closed");
}

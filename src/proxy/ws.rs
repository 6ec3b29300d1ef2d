//! Dashboard event channel
//!
//! A WebSocket endpoint for dashboard observers. On accept the server sends
//! a `connected` envelope, then pushes key-lifecycle and usage events as the
//! broadcaster publishes them. The socket is bidirectional but the inbound
//! direction is only used for liveness (pings and close frames); payload
//! messages from the client are ignored.
//!
//! Auth accepts the admin credential in the `Authorization` header or, for
//! browser clients that cannot set headers on a WebSocket, via the
//! `auth_type`/`auth_token` query parameters.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use crate::events::DashboardEvent;

use super::error::ProxyError;
use super::state::ProxyState;

/// Query-parameter auth for browser WebSocket clients.
#[derive(Debug, Default, Deserialize)]
pub struct WsAuthParams {
    /// `bearer` or `basic`.
    pub auth_type: Option<String>,
    pub auth_token: Option<String>,
}

fn authorized(state: &ProxyState, headers: &HeaderMap, params: &WsAuthParams) -> bool {
    let Some(expected) = &state.config.admin_api_key else {
        return false;
    };

    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    {
        return token == expected;
    }

    match (params.auth_type.as_deref(), params.auth_token.as_deref()) {
        (Some("bearer") | Some("basic"), Some(token)) => token == expected,
        _ => false,
    }
}

/// GET /ws - upgrade to the event channel.
pub async fn ws_handler(
    State(state): State<ProxyState>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsAuthParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers, &params) {
        return ProxyError::Unauthenticated.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ProxyState) {
    let mut subscription = state.broadcaster.subscribe();
    tracing::debug!(
        subscribers = state.broadcaster.subscriber_count(),
        "dashboard subscriber connected"
    );

    let greeting = DashboardEvent::Connected {
        timestamp: Utc::now(),
        message: "connected to tollgate event stream".to_string(),
    };
    if send_event(&mut socket, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    // Broadcaster shut down; close politely.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // Pings are answered by axum; payloads are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("dashboard subscriber disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &DashboardEvent) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(json)).await.map_err(|_| ())
}

//! WebSocket transport binding contexts to the message bus.
//!
//! Each socket becomes one bus connection. Outbound frames are drained from
//! the bus receiver onto the socket; inbound text frames go through
//! [`crate::bus::MessageBus::dispatch_text`], which validates them before any
//! handler runs. When either direction ends the connection is torn down and
//! the coordinator is notified.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use super::routes::AppState;
use crate::bus::ConnectionKind;

const WS_SUBPROTOCOL: &str = "pagelens";

/// Extract a static token from the WebSocket subprotocol list. Browser
/// clients cannot set an Authorization header on the upgrade request, so they
/// send `["pagelens", "token.<value>"]` instead.
fn extract_token_from_protocols(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())?;
    for part in raw.split(',').map(|s| s.trim()) {
        if let Some(rest) = part.strip_prefix("token.") {
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// Check the upgrade request against the configured static token. Always
/// passes when no token is configured.
fn token_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let token = bearer.or_else(|| extract_token_from_protocols(headers));
    token.as_deref() == Some(expected)
}

/// WebSocket endpoint for page contexts.
pub async fn page_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !token_matches(state.config.auth_token.as_deref(), &headers) {
        return (StatusCode::UNAUTHORIZED, "Missing or invalid token").into_response();
    }
    ws.protocols([WS_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state, ConnectionKind::Page))
}

/// WebSocket endpoint for UI surfaces.
pub async fn ui_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !token_matches(state.config.auth_token.as_deref(), &headers) {
        return (StatusCode::UNAUTHORIZED, "Missing or invalid token").into_response();
    }
    ws.protocols([WS_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state, ConnectionKind::Ui))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, kind: ConnectionKind) {
    let (conn, mut outbound) = state.bus.connect(kind);
    tracing::info!(connection = %conn, "WebSocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize outbound frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let bus = state.bus.clone();
    let recv_conn = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => bus.dispatch_text(&recv_conn, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.bus.close_connection(&conn);
    match kind {
        ConnectionKind::Page => state.coordinator.page_connection_closed(&conn).await,
        ConnectionKind::Ui => state.coordinator.ui_connection_closed(&conn),
    }
    tracing::info!(connection = %conn, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_no_token_configured_allows_all() {
        assert!(token_matches(None, &HeaderMap::new()));
    }

    #[test]
    fn test_bearer_header_token() {
        let headers = headers_with("authorization", "Bearer secret");
        assert!(token_matches(Some("secret"), &headers));
        assert!(!token_matches(Some("other"), &headers));
    }

    #[test]
    fn test_subprotocol_token() {
        let headers = headers_with("sec-websocket-protocol", "pagelens, token.secret");
        assert!(token_matches(Some("secret"), &headers));
    }

    #[test]
    fn test_missing_token_rejected() {
        assert!(!token_matches(Some("secret"), &HeaderMap::new()));
    }
}

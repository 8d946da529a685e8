use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lookout_core::{HostHello, PairingToken, VisitorReport};

use crate::registry::HostHandle;
use crate::AppState;

#[derive(Debug, Error)]
enum HostSocketError {
    #[error("malformed frame from host: {0}")]
    MalformedFrame(serde_json::Error),
    #[error("registration frame token does not match the connection path")]
    TokenMismatch,
    #[error("transport error: {0}")]
    Transport(axum::Error),
}

impl HostSocketError {
    fn metric_label(&self) -> &'static str {
        match self {
            HostSocketError::MalformedFrame(_) => "malformed_frame",
            HostSocketError::TokenMismatch => "token_mismatch",
            HostSocketError::Transport(_) => "transport_error",
        }
    }
}

/// Upgrade handler for `/host/:token`.
pub async fn host_socket_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match token.parse::<PairingToken>() {
        Ok(token) => token,
        Err(_) => {
            counter!("lookout_host_rejected_total", 1, "reason" => "bad_token");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_host_socket(socket, token, state))
        .into_response()
}

async fn handle_host_socket(socket: WebSocket, token: PairingToken, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<VisitorReport>();
    let handle = HostHandle::new(tx);
    let connection_id = handle.connection_id();

    // Install the handle before the first frame is read or written so a
    // visitor arriving the instant the host believes it is connected still
    // finds the registration.
    if let Some(superseded) = state.registry.register(token.clone(), handle) {
        counter!("lookout_host_superseded_total", 1);
        debug!(
            %token,
            superseded = %superseded.connection_id(),
            superseded_registered_at = %superseded.registered_at(),
            "replaced previous host connection"
        );
    }
    gauge!("lookout_hosts_active", state.registry.len() as f64);
    counter!("lookout_host_connected_total", 1);
    info!(%token, %connection_id, "host connection registered");

    // Writer task: forwards relayed reports onto the socket.
    let writer_token = token.clone();
    let writer = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            let payload = match serde_json::to_string(&report) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(token = %writer_token, error = %err, "failed to encode visitor report");
                    continue;
                }
            };
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        debug!(token = %writer_token, "host writer task finished");
    });

    match read_host_frames(&mut receiver, &token).await {
        Ok(()) => debug!(%token, %connection_id, "host closed its socket"),
        Err(err) => {
            counter!("lookout_host_protocol_errors_total", 1, "reason" => err.metric_label());
            warn!(%token, %connection_id, error = %err, "dropping host connection");
        }
    }

    // Compare-and-remove: if this socket was already superseded by a
    // reconnect, the newer registration stays untouched.
    if state.registry.remove(&token, connection_id) {
        gauge!("lookout_hosts_active", state.registry.len() as f64);
    }
    counter!("lookout_host_disconnected_total", 1);
    writer.abort();
    info!(%token, %connection_id, "host connection closed");
}

/// Reads frames until the host disconnects. The only meaningful inbound
/// frame is the registration hello, which is redundant with the path token
/// and accepted without ceremony; anything unparseable drops the connection.
async fn read_host_frames(
    receiver: &mut SplitStream<WebSocket>,
    token: &PairingToken,
) -> Result<(), HostSocketError> {
    while let Some(frame) = receiver.next().await {
        match frame.map_err(HostSocketError::Transport)? {
            Message::Text(text) => accept_hello(text.as_bytes(), token)?,
            Message::Binary(bytes) => accept_hello(&bytes, token)?,
            Message::Close(_) => return Ok(()),
            // Ping/Pong handled by axum.
            _ => continue,
        }
    }
    Ok(())
}

fn accept_hello(payload: &[u8], token: &PairingToken) -> Result<(), HostSocketError> {
    let hello: HostHello =
        serde_json::from_slice(payload).map_err(HostSocketError::MalformedFrame)?;
    if hello.token != token.as_str() {
        return Err(HostSocketError::TokenMismatch);
    }
    debug!(%token, "accepted registration frame");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_with_the_path_token_is_accepted() {
        let token: PairingToken = "abc123".parse().unwrap();
        assert!(accept_hello(br#"{"token":"abc123"}"#, &token).is_ok());
    }

    #[test]
    fn hello_with_a_foreign_token_is_a_protocol_error() {
        let token: PairingToken = "abc123".parse().unwrap();
        let err = accept_hello(br#"{"token":"zzz999"}"#, &token).unwrap_err();
        assert_eq!(err.metric_label(), "token_mismatch");
    }

    #[test]
    fn garbage_frames_are_protocol_errors() {
        let token: PairingToken = "abc123".parse().unwrap();
        let err = accept_hello(b"not json", &token).unwrap_err();
        assert_eq!(err.metric_label(), "malformed_frame");
    }
}

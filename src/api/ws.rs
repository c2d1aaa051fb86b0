// =============================================================================
// WebSocket Handler — Push-based state updates
// =============================================================================
//
// Mounted at the bare `/ws` path. Clients connect with `?token=<token>` and
// receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A fresh snapshot once per second whenever state_version has changed
//      since the last push.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::{AppState, StateSnapshot};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request. Validates the token from
/// the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token, &state.config.dashboard_admin_token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state)).into_response()
}

/// Manages a single observer connection: an immediate snapshot on connect,
/// then a fresh one every time the shared snapshot feed publishes (~1 Hz,
/// driven by the broadcast loop in `main` rather than by this handler), plus
/// Ping/Pong/Close handling on the receive side.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut snapshot_rx = state.subscribe_snapshot();

    if let Err(e) = send_snapshot(&mut sender, snapshot_rx.borrow().clone()).await {
        warn!(error = %e, "failed to send initial WebSocket snapshot");
        return;
    }

    loop {
        tokio::select! {
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    debug!("snapshot feed closed — disconnecting");
                    break;
                }
                let snapshot = snapshot_rx.borrow_and_update().clone();
                if let Err(e) = send_snapshot(&mut sender, snapshot).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("WebSocket Pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Serialize and send a previously-published `StateSnapshot`.
async fn send_snapshot(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    snapshot: Arc<StateSnapshot>,
) -> Result<(), axum::Error> {
    match serde_json::to_string(&*snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json.into())).await?;
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize snapshot");
            Ok(())
        }
    }
}

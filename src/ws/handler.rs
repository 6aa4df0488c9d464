//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::PeerInput;
use crate::util::rate_limit::PeerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session to join; created on first connection
    pub session_id: Uuid,
    /// Stable peer id for reconnects, otherwise one is assigned
    pub peer_id: Option<Uuid>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let peer_id = query.peer_id.unwrap_or_else(Uuid::new_v4);
    info!(session_id = %query.session_id, peer_id = %peer_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, query.session_id, peer_id, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, session_id: Uuid, peer_id: Uuid, state: AppState) {
    info!(session_id = %session_id, peer_id = %peer_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        peer_id,
        server_time: unix_millis(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(peer_id = %peer_id, error = %e, "Failed to send welcome");
        return;
    }

    // Only the peer's channels outlive this call, so an ended session
    // closes the event stream and with it the socket
    let (input_tx, events_rx) = state.sessions.get_or_create(session_id).into_peer_channels();

    run_session(peer_id, ws_sink, ws_stream, input_tx, events_rx).await;

    info!(session_id = %session_id, peer_id = %peer_id, "WebSocket connection closed");
}

/// Relay session events to the socket and peer messages to the session
/// until either side goes away
async fn run_session(
    peer_id: Uuid,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    input_tx: mpsc::Sender<PeerInput>,
    mut events_rx: broadcast::Receiver<ServerMsg>,
) {
    let rate_limiter = PeerRateLimiter::new();

    // Writer task: session events -> WebSocket
    let mut writer_handle = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(msg) => {
                    if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                        debug!(peer_id = %peer_id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(peer_id = %peer_id, lagged_count = n, "Peer lagged behind session events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(peer_id = %peer_id, "Session ended, closing socket");
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader: WebSocket -> session loop
    let reader = async {
        while let Some(result) = ws_stream.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if !rate_limiter.check_message() {
                        warn!(peer_id = %peer_id, "Rate limited peer message");
                        continue;
                    }

                    // Malformed messages are dropped, never fatal
                    let msg = match serde_json::from_str::<ClientMsg>(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(peer_id = %peer_id, error = %e, "Failed to parse peer message");
                            continue;
                        }
                    };

                    if input_tx.send(PeerInput { peer_id, msg }).await.is_err() {
                        debug!(peer_id = %peer_id, "Session input channel closed");
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    warn!(peer_id = %peer_id, "Received binary message, ignoring");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => {
                    info!(peer_id = %peer_id, "Peer initiated close");
                    break;
                }
                Err(e) => {
                    error!(peer_id = %peer_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer_handle => {}
    }

    // Signal disconnect to session loop; fails harmlessly if it already ended
    let _ = input_tx
        .send(PeerInput {
            peer_id,
            msg: ClientMsg::Leave,
        })
        .await;

    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

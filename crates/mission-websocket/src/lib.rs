//! # Mission WebSocket Server
//!
//! Streams one mission's telemetry to operator clients at
//! `/ws/mission/{id}` and relays missions upstream. Supports:
//! - A `connected` snapshot followed by every telemetry envelope
//! - Operator decisions and mission commands from the client
//! - Heartbeat pings
//!
//! ## Protocol
//!
//! Messages are JSON-encoded using the types from `mission_core::events`:
//! - Server → Client: `ServerMessage`
//! - Client → Server: `ClientMessage`
//!
//! The server closes the socket after forwarding the mission's terminal
//! event.

pub mod error;
pub mod hub;
pub mod upstream;

pub use error::{WsError, WsResult};
pub use hub::MissionHub;
pub use upstream::{WsUpstreamSink, WsUpstreamSinkFactory};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use mission_core::{MissionId, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Path prefix of mission streams
pub const MISSION_PATH_PREFIX: &str = "/ws/mission/";

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bind `0.0.0.0:port` and serve until `shutdown` is cancelled
pub async fn start_server(hub: Arc<MissionHub>, port: u16, shutdown: CancellationToken) -> WsResult<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("🔌 WebSocket server listening on ws://{}", addr);

    serve(listener, hub, shutdown).await;
    Ok(())
}

/// Accept connections on `listener` until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, hub: Arc<MissionHub>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WebSocket server shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let hub = hub.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(hub, stream, addr, shutdown).await {
                            warn!(%addr, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Failed to accept WebSocket connection"),
            }
        }
    }
}

/// Mission id addressed by a stream path
pub fn mission_from_path(path: &str) -> Option<MissionId> {
    let id = path.strip_prefix(MISSION_PATH_PREFIX)?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(MissionId::new(id))
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

/// Handle a single WebSocket connection
async fn handle_connection(
    hub: Arc<MissionHub>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> WsResult<()> {
    let mut requested: Option<MissionId> = None;
    let check = |request: &Request, response: Response| {
        let path = request.uri().path();
        let Some(mission_id) = mission_from_path(path) else {
            return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
        };
        if hub.registry().get_status(&mission_id).is_err() {
            return Err(reject(StatusCode::NOT_FOUND, "mission not found"));
        }
        requested = Some(mission_id);
        Ok(response)
    };
    let ws_stream = accept_hdr_async(stream, check).await?;
    let mission_id = requested.ok_or_else(|| WsError::InvalidPath(addr.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = Uuid::new_v4();
    let (state, mut events) = hub.register_client(client_id, &mission_id)?;
    info!(%client_id, %addr, mission_id = %mission_id, "🔗 WebSocket client connected");

    let finished = state.is_terminal();
    let result = async {
        send(&mut ws_sender, &hub, &ServerMessage::Connected { state }).await?;
        if finished {
            return Ok(());
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = events.recv() => match received {
                    Ok(envelope) => {
                        let terminal = envelope.event.is_terminal();
                        send(&mut ws_sender, &hub, &ServerMessage::Telemetry(envelope)).await?;
                        if terminal {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%client_id, skipped, "Client lagged behind mission stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                incoming = ws_receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = hub.handle_client_message(client_id, &mission_id, text.as_str()).await {
                            send(&mut ws_sender, &hub, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%client_id, "Client closed the stream");
                        return Ok(());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(%client_id, "Received unexpected binary message");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(WsError::from(e)),
                },
                _ = ping.tick() => {
                    let timestamp = chrono::Utc::now().timestamp_millis();
                    send(&mut ws_sender, &hub, &ServerMessage::Ping { timestamp }).await?;
                }
            }
        }
    }
    .await;

    let _ = ws_sender.close().await;
    hub.unregister_client(client_id);
    info!(%client_id, mission_id = %mission_id, "🔌 WebSocket client disconnected");
    result
}

async fn send<S>(sender: &mut S, hub: &MissionHub, message: &ServerMessage) -> WsResult<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    sender.send(Message::Text(json.into())).await?;
    hub.record_sent();
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

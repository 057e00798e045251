//! WebSocket connection handler
//!
//! Handles individual peer connections: WebSocket handshake on
//! `/ws/{room}/{peer}`, admission, the receive/dispatch loop and
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::admission::{request_admission, AdmissionOutcome};
use crate::error::AppError;
use crate::message::{CloseReason, Outbound};
use crate::peer::PeerConnection;
use crate::router::MessageRouter;
use crate::server::RelayContext;
use crate::types::{ConnectionId, PeerId, RoomId};

/// Time allowed for the writer to flush after teardown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract `(room, peer)` from a `/ws/{room}/{peer}` request path
pub fn parse_path(path: &str) -> Option<(RoomId, PeerId)> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != "ws" {
        return None;
    }
    let room = segments.next().filter(|s| !s.is_empty())?;
    let peer = segments.next().filter(|s| !s.is_empty())?;
    if segments.next().is_some_and(|s| !s.is_empty()) {
        return None;
    }
    Some((RoomId::from(room), PeerId::from(peer)))
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, waits for admission, relays the peer's
/// messages until it disconnects, then removes it from its room.
pub async fn handle_connection(
    stream: TcpStream,
    context: Arc<RelayContext>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake, capturing the path parameters
    let mut target = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match parse_path(request.uri().path()) {
                Some(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                None => {
                    let mut reject = ErrorResponse::new(Some("expected /ws/{room}/{peer}".into()));
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    Err(reject)
                }
            }
        },
    )
    .await
    .map_err(|e| AppError::ConnectionRejected(format!("{}: {}", peer_addr, e)))?;

    let Some((room_id, peer_id)) = target else {
        return Err(AppError::ConnectionRejected(peer_addr));
    };

    let conn_id = ConnectionId::new();
    info!(
        "Peer {} connecting to room {} from {} ({})",
        peer_id, room_id, peer_addr, conn_id
    );

    let (ws_sender, mut ws_receiver) = ws_stream.split();

    // Channel for relay -> peer messages
    let (msg_tx, msg_rx) = mpsc::channel::<Outbound>(context.settings.outbound_buffer);
    let mut write_task = tokio::spawn(write_loop(ws_sender, msg_rx, conn_id));

    let peer = PeerConnection::new(peer_id.clone(), conn_id, msg_tx);
    let outcome = request_admission(
        &context.registry,
        &room_id,
        peer.clone(),
        &mut ws_receiver,
        context.settings.admission_timeout,
    )
    .await;

    let (room, admission) = match outcome {
        Ok(AdmissionOutcome::Admitted { room, admission }) => (room, admission),
        Ok(AdmissionOutcome::Withdrawn) => {
            drop(peer);
            drain_writer(write_task).await;
            info!("Peer {} withdrew from room {}", peer_id, room_id);
            return Ok(());
        }
        Err(e) => {
            match e.close_reason() {
                Some(reason) => {
                    info!("Peer {} not admitted to room {}: {}", peer_id, room_id, e);
                    let _ = peer.close(reason);
                }
                None => warn!("Admission of {} to room {} failed: {}", peer_id, room_id, e),
            }
            drop(peer);
            drain_writer(write_task).await;
            return Ok(());
        }
    };

    // From here on the room holds the only strong sender: once the room
    // drops this peer the writer ends and closes the socket.
    let closer = peer.sender.downgrade();
    drop(peer);

    info!("Peer {} active in room {} ({:?})", peer_id, room_id, admission);

    let router = MessageRouter::new(
        room.clone(),
        peer_id.clone(),
        conn_id,
        context.store.clone(),
        context.settings.exclude_sender,
    );

    let idle_timeout = context.settings.idle_timeout;
    let mut writer_done = false;

    loop {
        let next = tokio::select! {
            frame = next_frame(&mut ws_receiver, idle_timeout) => frame,
            _ = &mut write_task => {
                debug!("Write task completed for {}", conn_id);
                writer_done = true;
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if router.route_text(&text).await.is_err() {
                    debug!("Room {} closed, ending session for {}", room_id, peer_id);
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!("Peer {} sent close frame", peer_id);
                break;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("Ignoring binary frame from {}", peer_id);
            }
            Some(Ok(_)) => {
                // Ping/pong is handled by tungstenite
            }
            Some(Err(e)) => {
                debug!("WebSocket error for {}: {}", peer_id, e);
                break;
            }
            None => {
                info!("Closing idle connection of {}", peer_id);
                if let Some(sender) = closer.upgrade() {
                    let _ = sender.try_send(Outbound::Close(CloseReason::Idle));
                }
                break;
            }
        }
    }

    let _ = room.depart(peer_id.clone(), conn_id).await;
    if !writer_done {
        drain_writer(write_task).await;
    }

    info!("Peer {} disconnected from room {}", peer_id, room_id);

    Ok(())
}

/// Next inbound frame
///
/// End of stream is reported as `Some(Ok(Message::Close(None)))`; `None`
/// means the idle timeout elapsed.
async fn next_frame<S>(
    inbound: &mut S,
    idle_timeout: Option<Duration>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let frame = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, inbound.next()).await.ok()?,
        None => inbound.next().await,
    };
    Some(frame.unwrap_or(Ok(Message::Close(None))))
}

/// Drain the peer's outbound channel into the socket
async fn write_loop(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut msg_rx: mpsc::Receiver<Outbound>,
    conn_id: ConnectionId,
) {
    while let Some(msg) = msg_rx.recv().await {
        let closing = matches!(msg, Outbound::Close(_));
        match msg.to_frame() {
            Ok(frame) => {
                if ws_sender.send(frame).await.is_err() {
                    debug!("WebSocket send failed, ending write task for {}", conn_id);
                    break;
                }
            }
            Err(e) => {
                // Continue - don't break on serialization errors
                error!("Failed to serialize message: {}", e);
            }
        }
        if closing {
            break;
        }
    }
    debug!("Write task ended for {}", conn_id);

    // Send close frame when done
    let _ = ws_sender.close().await;
}

async fn drain_writer(write_task: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, write_task)
        .await
        .is_err()
    {
        debug!("Writer did not finish in time");
    }
}

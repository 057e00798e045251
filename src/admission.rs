//! Admission controller
//!
//! Drives a new connection from `Connecting` to either active or gone.
//! The room actor decides admin-vs-pending; this side waits for the
//! admin's decision while watching the candidate's own socket, so only
//! the candidate's task is suspended.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use crate::error::AppError;
use crate::peer::PeerConnection;
use crate::registry::{Admission, JoinTicket, RegistryHandle, RoomHandle};
use crate::room::Decision;
use crate::types::RoomId;

/// Lookups retried when a room is reaped between lookup and join
const JOIN_ATTEMPTS: usize = 3;

/// How an admission attempt ended
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// The peer is an active participant of `room`
    Admitted { room: RoomHandle, admission: Admission },
    /// The client closed its connection while pending
    Withdrawn,
}

/// Register `peer` with its room and wait until it is admitted
///
/// `inbound` is the candidate's receive side. Anything it sends while
/// pending is discarded; a close aborts the attempt.
pub async fn request_admission<S>(
    registry: &RegistryHandle,
    room_id: &RoomId,
    peer: PeerConnection,
    inbound: &mut S,
    timeout: Duration,
) -> Result<AdmissionOutcome, AppError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    for attempt in 1..=JOIN_ATTEMPTS {
        let room = registry.get_or_create(room_id.clone()).await?;
        match room.join(peer.clone()).await {
            Ok(JoinTicket::Active(admission)) => {
                return Ok(AdmissionOutcome::Admitted { room, admission })
            }
            Ok(JoinTicket::Pending(decision)) => {
                return await_decision(room, &peer, decision, inbound, timeout).await
            }
            Err(AppError::RoomClosed) => {
                debug!(
                    "Room {} closed during join of {} (attempt {})",
                    room_id, peer.peer_id, attempt
                );
            }
            Err(e) => return Err(e),
        }
    }
    Err(AppError::RoomClosed)
}

async fn await_decision<S>(
    room: RoomHandle,
    peer: &PeerConnection,
    mut decision: tokio::sync::oneshot::Receiver<Decision>,
    inbound: &mut S,
    timeout: Duration,
) -> Result<AdmissionOutcome, AppError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            result = &mut decision => {
                return match result {
                    Ok(Decision::Approved) => Ok(AdmissionOutcome::Admitted {
                        room,
                        admission: Admission::Approved,
                    }),
                    Ok(Decision::Rejected) => Err(AppError::AdmissionRejected),
                    Err(_) => Err(AppError::RoomClosed),
                };
            }
            _ = &mut deadline => {
                // A decision that landed together with the deadline still counts
                match decision.try_recv() {
                    Ok(Decision::Approved) => {
                        return Ok(AdmissionOutcome::Admitted {
                            room,
                            admission: Admission::Approved,
                        })
                    }
                    Ok(Decision::Rejected) => return Err(AppError::AdmissionRejected),
                    Err(_) => {}
                }
                info!("Admission of {} to room {} timed out", peer.peer_id, room.id);
                let _ = room.depart(peer.peer_id.clone(), peer.conn_id).await;
                return Err(AppError::AdmissionTimedOut);
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    info!("Pending peer {} closed its connection", peer.peer_id);
                    let _ = room.depart(peer.peer_id.clone(), peer.conn_id).await;
                    return Ok(AdmissionOutcome::Withdrawn);
                }
                Some(Err(e)) => {
                    debug!("WebSocket error for pending {}: {}", peer.peer_id, e);
                    let _ = room.depart(peer.peer_id.clone(), peer.conn_id).await;
                    return Ok(AdmissionOutcome::Withdrawn);
                }
                Some(Ok(_)) => {
                    debug!("Discarding message from pending peer {}", peer.peer_id);
                }
            },
        }
    }
}

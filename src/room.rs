//! Room struct definition
//!
//! Per-room state: the admin, the active participants and the ordered
//! queue of peers waiting for approval. A `Room` is owned by exactly one
//! room actor, so none of these methods need synchronization.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::AppError;
use crate::message::Outbound;
use crate::peer::PeerConnection;
use crate::types::{ConnectionId, PeerId, RoomId};

/// Final decision delivered to a pending candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

/// How a new connection enters the room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// First peer ever: becomes admin, admitted immediately
    Admin,
    /// The admin coming back: admitted immediately
    AdminReconnect,
    /// Anyone else: waits for the admin's decision
    Pending,
}

/// A candidate waiting for approval
#[derive(Debug)]
pub struct PendingPeer {
    pub connection: PeerConnection,
    /// Resolves the candidate's admission wait
    pub decision: oneshot::Sender<Decision>,
}

/// Meeting room
///
/// Invariant: a peer id is in at most one of `participants` and `pending`.
#[derive(Debug)]
pub struct Room {
    /// Room id for identification
    pub id: RoomId,
    /// First peer to join; never changes for the lifetime of the room
    admin: Option<PeerId>,
    /// Active peers
    participants: HashMap<PeerId, PeerConnection>,
    /// Candidates in arrival order
    pending: Vec<PendingPeer>,
}

impl Room {
    /// Create a new empty room
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            admin: None,
            participants: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn admin(&self) -> Option<&PeerId> {
        self.admin.as_ref()
    }

    /// Decide how `peer_id` enters the room
    ///
    /// The admin always gets back in, even over a still-registered
    /// connection. Anyone else fails if already a participant or pending.
    pub fn classify(&self, peer_id: &PeerId) -> Result<JoinKind, AppError> {
        if self.admin.as_ref() == Some(peer_id) {
            return Ok(JoinKind::AdminReconnect);
        }
        if self.is_participant(peer_id) {
            return Err(AppError::AlreadyAdmitted(peer_id.to_string()));
        }
        if self.is_pending(peer_id) {
            return Err(AppError::AlreadyPending(peer_id.to_string()));
        }
        Ok(match &self.admin {
            None => JoinKind::Admin,
            Some(_) => JoinKind::Pending,
        })
    }

    /// Record the room's admin
    ///
    /// Only the first call has any effect.
    pub fn claim_admin(&mut self, peer_id: PeerId) -> bool {
        if self.admin.is_some() {
            return false;
        }
        self.admin = Some(peer_id);
        true
    }

    /// Queue a candidate for approval
    pub fn add_pending(&mut self, candidate: PendingPeer) -> Result<(), AppError> {
        let peer_id = &candidate.connection.peer_id;
        if self.is_participant(peer_id) {
            return Err(AppError::AlreadyAdmitted(peer_id.to_string()));
        }
        if self.is_pending(peer_id) {
            return Err(AppError::AlreadyPending(peer_id.to_string()));
        }
        self.pending.push(candidate);
        Ok(())
    }

    /// Remove a candidate from the queue
    ///
    /// With `conn_id` set, only that connection's entry is removed.
    /// Removing an absent id is a no-op.
    pub fn remove_pending(
        &mut self,
        peer_id: &PeerId,
        conn_id: Option<ConnectionId>,
    ) -> Option<PendingPeer> {
        let index = self.pending.iter().position(|p| {
            p.connection.peer_id == *peer_id
                && conn_id.map_or(true, |id| p.connection.is_connection(id))
        })?;
        Some(self.pending.remove(index))
    }

    /// Make a connection an active participant
    ///
    /// A pending entry for the same id is dropped.
    pub fn admit(&mut self, connection: PeerConnection) -> Result<(), AppError> {
        if self.is_participant(&connection.peer_id) {
            return Err(AppError::AlreadyAdmitted(connection.peer_id.to_string()));
        }
        self.remove_pending(&connection.peer_id, None);
        self.participants.insert(connection.peer_id.clone(), connection);
        Ok(())
    }

    /// Install `connection` as the participant's live connection
    ///
    /// Returns the connection it displaced, if any.
    pub fn replace(&mut self, connection: PeerConnection) -> Option<PeerConnection> {
        self.participants.insert(connection.peer_id.clone(), connection)
    }

    /// Remove an active participant's connection
    ///
    /// Returns whether it was present, which decides if a departure
    /// notice is due.
    pub fn remove(&mut self, peer_id: &PeerId, conn_id: ConnectionId) -> bool {
        match self.participants.get(peer_id) {
            Some(conn) if conn.is_connection(conn_id) => {
                self.participants.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    /// Send `msg` to every participant except `exclude`
    ///
    /// Delivery failures never stop the fan-out. The failed recipients are
    /// returned so the caller can evict them.
    pub fn broadcast(
        &self,
        msg: &Outbound,
        exclude: Option<&PeerId>,
    ) -> Vec<(PeerId, ConnectionId)> {
        let mut failed = Vec::new();
        for (peer_id, conn) in &self.participants {
            if Some(peer_id) == exclude {
                continue;
            }
            if let Err(e) = conn.send(msg.clone()) {
                warn!("Send to {} in room {} failed: {}", peer_id, self.id, e);
                failed.push((peer_id.clone(), conn.conn_id));
            }
        }
        failed
    }

    pub fn participant(&self, peer_id: &PeerId) -> Option<&PeerConnection> {
        self.participants.get(peer_id)
    }

    /// Check if `conn_id` is the live connection of participant `peer_id`
    pub fn is_active_connection(&self, peer_id: &PeerId, conn_id: ConnectionId) -> bool {
        self.participant(peer_id)
            .is_some_and(|conn| conn.is_connection(conn_id))
    }

    pub fn is_participant(&self, peer_id: &PeerId) -> bool {
        self.participants.contains_key(peer_id)
    }

    pub fn is_pending(&self, peer_id: &PeerId) -> bool {
        self.pending.iter().any(|p| p.connection.peer_id == *peer_id)
    }

    /// Pending candidate ids in arrival order
    pub fn pending_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.pending.iter().map(|p| &p.connection.peer_id)
    }

    pub fn participant_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.participants.keys()
    }

    /// Check if nobody is active or waiting
    pub fn is_idle(&self) -> bool {
        self.participants.is_empty() && self.pending.is_empty()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

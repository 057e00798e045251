//! Room registry and room actors
//!
//! The `RoomRegistry` actor owns the mapping from room id to room actor.
//! Every room is its own actor owning a [`Room`] exclusively, so all
//! mutations of one room are serialized while different rooms never wait
//! on each other. Room actors never await a peer: delivery is `try_send`
//! and a failed recipient is evicted.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::message::{CloseReason, Outbound, ServerMessage};
use crate::peer::PeerConnection;
use crate::room::{Decision, JoinKind, PendingPeer, Room};
use crate::types::{ConnectionId, PeerId, RoomId};

/// Channel buffer size for each room actor
const ROOM_CHANNEL_SIZE: usize = 256;

/// How a peer became active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First peer in the room
    Admin,
    /// The admin connected again
    Reconnected,
    /// Approved by the admin
    Approved,
}

/// Result of a join request
#[derive(Debug)]
pub enum JoinTicket {
    /// Active right away
    Active(Admission),
    /// Waiting for the admin; resolves with the decision
    Pending(oneshot::Receiver<Decision>),
}

/// Point-in-time view of a room, for inspection and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub admin: Option<PeerId>,
    /// Sorted participant ids
    pub participants: Vec<PeerId>,
    /// Pending ids in arrival order
    pub pending: Vec<PeerId>,
}

/// Commands sent from connection handlers to a room actor
#[derive(Debug)]
pub enum RoomCommand {
    /// A new connection wants in
    Join {
        peer: PeerConnection,
        reply: oneshot::Sender<Result<JoinTicket, AppError>>,
    },
    /// Admission decision sent by (supposedly) the admin
    Decide {
        from: PeerId,
        conn_id: ConnectionId,
        candidate: PeerId,
        approved: bool,
    },
    /// Fan a message out to the room
    Broadcast {
        from: PeerId,
        conn_id: ConnectionId,
        payload: Outbound,
        exclude_sender: bool,
        /// Answered with whether the sender was active
        accepted: Option<oneshot::Sender<bool>>,
    },
    /// A connection ended, pending or active
    Depart {
        peer_id: PeerId,
        conn_id: ConnectionId,
    },
    /// Stop the actor if nobody is active or waiting
    ShutdownIfIdle { reply: oneshot::Sender<bool> },
    /// Report the current state
    Snapshot { reply: oneshot::Sender<RoomSnapshot> },
}

/// Handle to a running room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub id: RoomId,
    /// Distinguishes successive rooms created under the same id
    epoch: u64,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    async fn send(&self, cmd: RoomCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::RoomClosed)
    }

    /// Ask to join the room
    pub async fn join(&self, peer: PeerConnection) -> Result<JoinTicket, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join { peer, reply }).await?;
        rx.await.map_err(|_| AppError::RoomClosed)?
    }

    pub async fn decide(
        &self,
        from: PeerId,
        conn_id: ConnectionId,
        candidate: PeerId,
        approved: bool,
    ) -> Result<(), AppError> {
        self.send(RoomCommand::Decide {
            from,
            conn_id,
            candidate,
            approved,
        })
        .await
    }

    pub async fn broadcast(
        &self,
        from: PeerId,
        conn_id: ConnectionId,
        payload: Outbound,
        exclude_sender: bool,
    ) -> Result<(), AppError> {
        self.send(RoomCommand::Broadcast {
            from,
            conn_id,
            payload,
            exclude_sender,
            accepted: None,
        })
        .await
    }

    /// Like [`RoomHandle::broadcast`], returning whether the room took the
    /// message (false if `from` is no longer an active participant)
    pub async fn broadcast_acked(
        &self,
        from: PeerId,
        conn_id: ConnectionId,
        payload: Outbound,
        exclude_sender: bool,
    ) -> Result<bool, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Broadcast {
            from,
            conn_id,
            payload,
            exclude_sender,
            accepted: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| AppError::RoomClosed)
    }

    pub async fn depart(&self, peer_id: PeerId, conn_id: ConnectionId) -> Result<(), AppError> {
        self.send(RoomCommand::Depart { peer_id, conn_id }).await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| AppError::RoomClosed)
    }

    /// Returns true if the actor stopped (or was already gone)
    async fn shutdown_if_idle(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(RoomCommand::ShutdownIfIdle { reply }).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }
}

/// The per-room actor
struct RoomActor {
    room: Room,
    epoch: u64,
    receiver: mpsc::Receiver<RoomCommand>,
    /// Weak so that rooms never keep the registry alive
    registry: mpsc::WeakSender<RegistryCommand>,
    idle_reported: bool,
}

impl RoomActor {
    async fn run(mut self) {
        debug!("Room {} (epoch {}) started", self.room.id, self.epoch);

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Join { peer, reply } => {
                    let result = self.handle_join(peer);
                    let _ = reply.send(result);
                }
                RoomCommand::Decide {
                    from,
                    conn_id,
                    candidate,
                    approved,
                } => self.handle_decide(from, conn_id, candidate, approved),
                RoomCommand::Broadcast {
                    from,
                    conn_id,
                    payload,
                    exclude_sender,
                    accepted,
                } => {
                    let taken = self.handle_broadcast(from, conn_id, payload, exclude_sender);
                    if let Some(accepted) = accepted {
                        let _ = accepted.send(taken);
                    }
                }
                RoomCommand::Depart { peer_id, conn_id } => self.handle_depart(peer_id, conn_id),
                RoomCommand::ShutdownIfIdle { reply } => {
                    let idle = self.room.is_idle();
                    let _ = reply.send(idle);
                    if idle {
                        break;
                    }
                    self.idle_reported = false;
                    continue;
                }
                RoomCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                    continue;
                }
            }
            self.report_if_idle();
        }

        debug!("Room {} (epoch {}) stopped", self.room.id, self.epoch);
    }

    fn handle_join(&mut self, peer: PeerConnection) -> Result<JoinTicket, AppError> {
        let peer_id = peer.peer_id.clone();
        let kind = self.room.classify(&peer_id)?;

        match kind {
            JoinKind::Admin => {
                self.room.claim_admin(peer_id.clone());
                self.activate(peer)?;
                info!("Peer {} is admin of room {}", peer_id, self.room.id);
                Ok(JoinTicket::Active(Admission::Admin))
            }
            JoinKind::AdminReconnect => {
                if self.room.is_participant(&peer_id) {
                    // Takes over from a connection that may be half-open;
                    // dropping the old sender ends its writer.
                    if let Some(stale) = self.room.replace(peer) {
                        let _ = stale.close(CloseReason::Replaced);
                    }
                    info!("Admin {} replaced its connection in room {}", peer_id, self.room.id);
                } else {
                    self.activate(peer)?;
                    info!("Admin {} rejoined room {}", peer_id, self.room.id);
                }
                // Candidates queued while the admin was away
                let waiting: Vec<PeerId> = self.room.pending_ids().cloned().collect();
                for candidate in waiting {
                    self.request_approval(candidate);
                }
                Ok(JoinTicket::Active(Admission::Reconnected))
            }
            JoinKind::Pending => {
                let (decision, rx) = oneshot::channel();
                self.room.add_pending(PendingPeer {
                    connection: peer,
                    decision,
                })?;
                info!(
                    "Peer {} pending in room {} ({} waiting)",
                    peer_id,
                    self.room.id,
                    self.room.pending_count()
                );
                self.request_approval(peer_id);
                Ok(JoinTicket::Pending(rx))
            }
        }
    }

    /// Admit a connection and tell everyone already active
    fn activate(&mut self, peer: PeerConnection) -> Result<(), AppError> {
        let peer_id = peer.peer_id.clone();
        self.room.admit(peer)?;
        let joined = Outbound::from(ServerMessage::UserJoined {
            peer_id: peer_id.clone(),
        });
        self.fan_out(&joined, Some(&peer_id));
        Ok(())
    }

    /// Send an approval request for `candidate` to the admin, if connected
    fn request_approval(&mut self, candidate: PeerId) {
        let Some(admin) = self.room.admin().cloned() else {
            return;
        };
        let Some(conn) = self.room.participant(&admin) else {
            debug!(
                "Admin {} of room {} is away; {} keeps waiting",
                admin, self.room.id, candidate
            );
            return;
        };
        let conn_id = conn.conn_id;
        let sent = conn.send(ServerMessage::ApprovalRequest { peer_id: candidate });
        if let Err(e) = sent {
            warn!("Approval request to admin {} failed: {}", admin, e);
            self.evict(vec![(admin, conn_id)]);
        }
    }

    fn handle_decide(
        &mut self,
        from: PeerId,
        conn_id: ConnectionId,
        candidate: PeerId,
        approved: bool,
    ) {
        let is_admin = self.room.admin() == Some(&from);
        if !is_admin || !self.room.is_active_connection(&from, conn_id) {
            warn!(
                "Invalid message: admission decision from non-admin {} in room {}",
                from, self.room.id
            );
            return;
        }

        let Some(PendingPeer {
            connection,
            decision,
        }) = self.room.remove_pending(&candidate, None)
        else {
            debug!(
                "Decision for {} in room {} ignored (not pending)",
                candidate, self.room.id
            );
            return;
        };

        if !approved {
            info!("Peer {} rejected from room {}", candidate, self.room.id);
            let _ = decision.send(Decision::Rejected);
            return;
        }

        if decision.is_closed() {
            debug!("Candidate {} gave up before approval", candidate);
            return;
        }

        // The candidate hears about its approval before any room traffic
        if let Err(e) = connection.send(ServerMessage::Approved {
            peer_id: candidate.clone(),
        }) {
            warn!("Approval notice to {} failed: {}", candidate, e);
            return;
        }

        match self.activate(connection) {
            Ok(()) => {
                info!("Peer {} approved into room {}", candidate, self.room.id);
                let _ = decision.send(Decision::Approved);
            }
            Err(e) => {
                warn!("Approval of {} failed: {}", candidate, e);
                let _ = decision.send(Decision::Rejected);
            }
        }
    }

    fn handle_broadcast(
        &mut self,
        from: PeerId,
        conn_id: ConnectionId,
        payload: Outbound,
        exclude_sender: bool,
    ) -> bool {
        if !self.room.is_active_connection(&from, conn_id) {
            debug!(
                "Dropping message from inactive connection of {} in room {}",
                from, self.room.id
            );
            return false;
        }
        let exclude = exclude_sender.then_some(&from);
        self.fan_out(&payload, exclude);
        true
    }

    fn handle_depart(&mut self, peer_id: PeerId, conn_id: ConnectionId) {
        if self.room.remove_pending(&peer_id, Some(conn_id)).is_some() {
            info!("Pending peer {} left room {}", peer_id, self.room.id);
            return;
        }
        if self.room.remove(&peer_id, conn_id) {
            info!("Peer {} left room {}", peer_id, self.room.id);
            let left = Outbound::from(ServerMessage::UserLeft { peer_id });
            self.fan_out(&left, None);
        }
    }

    fn fan_out(&mut self, msg: &Outbound, exclude: Option<&PeerId>) {
        let failed = self.room.broadcast(msg, exclude);
        self.evict(failed);
    }

    /// Remove unreachable participants, announcing each departure once
    fn evict(&mut self, mut failed: Vec<(PeerId, ConnectionId)>) {
        while let Some((peer_id, conn_id)) = failed.pop() {
            if self.room.remove(&peer_id, conn_id) {
                warn!("Evicting unreachable peer {} from room {}", peer_id, self.room.id);
                let left = Outbound::from(ServerMessage::UserLeft { peer_id });
                failed.extend(self.room.broadcast(&left, None));
            }
        }
    }

    fn report_if_idle(&mut self) {
        if !self.room.is_idle() {
            self.idle_reported = false;
            return;
        }
        if self.idle_reported {
            return;
        }
        self.idle_reported = true;

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let cmd = RegistryCommand::Idle {
            room_id: self.room.id.clone(),
            epoch: self.epoch,
        };
        // Never wait on the registry from inside a room
        tokio::spawn(async move {
            let _ = registry.send(cmd).await;
        });
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<PeerId> = self.room.participant_ids().cloned().collect();
        participants.sort_by(|a, b| a.0.cmp(&b.0));
        RoomSnapshot {
            admin: self.room.admin().cloned(),
            participants,
            pending: self.room.pending_ids().cloned().collect(),
        }
    }
}

/// Commands sent to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Look up a room, creating it if needed
    GetOrCreate {
        room_id: RoomId,
        reply: oneshot::Sender<RoomHandle>,
    },
    /// A room became empty
    Idle { room_id: RoomId, epoch: u64 },
    /// Number of live rooms
    RoomCount { reply: oneshot::Sender<usize> },
}

/// Handle to the registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Returns the room's actor, starting one on first use
    pub async fn get_or_create(&self, room_id: RoomId) -> Result<RoomHandle, AppError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::GetOrCreate { room_id, reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn room_count(&self) -> Result<usize, AppError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::RoomCount { reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}

/// The registry actor
///
/// Owns only the room id → actor mapping; room state lives in the room
/// actors.
pub struct RoomRegistry {
    rooms: HashMap<RoomId, RoomHandle>,
    receiver: mpsc::Receiver<RegistryCommand>,
    /// Handed to room actors for idle notices
    weak_sender: mpsc::WeakSender<RegistryCommand>,
    next_epoch: u64,
}

impl RoomRegistry {
    /// Create a registry and its handle
    pub fn new(buffer: usize) -> (Self, RegistryHandle) {
        let (sender, receiver) = mpsc::channel(buffer);
        let registry = Self {
            rooms: HashMap::new(),
            receiver,
            weak_sender: sender.downgrade(),
            next_epoch: 0,
        };
        (registry, RegistryHandle::new(sender))
    }

    /// Create a registry and run it on its own task
    pub fn spawn(buffer: usize) -> RegistryHandle {
        let (registry, handle) = Self::new(buffer);
        tokio::spawn(registry.run());
        handle
    }

    /// Run the registry event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("RoomRegistry started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RegistryCommand::GetOrCreate { room_id, reply } => {
                    let handle = self.get_or_create(room_id);
                    let _ = reply.send(handle);
                }
                RegistryCommand::Idle { room_id, epoch } => {
                    self.reap(room_id, epoch).await;
                }
                RegistryCommand::RoomCount { reply } => {
                    let _ = reply.send(self.rooms.len());
                }
            }
        }

        info!("RoomRegistry shutting down");
    }

    fn get_or_create(&mut self, room_id: RoomId) -> RoomHandle {
        if let Some(handle) = self.rooms.get(&room_id) {
            if !handle.sender.is_closed() {
                return handle.clone();
            }
        }

        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_SIZE);
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let actor = RoomActor {
            room: Room::new(room_id.clone()),
            epoch,
            receiver,
            registry: self.weak_sender.clone(),
            idle_reported: false,
        };
        tokio::spawn(actor.run());

        let handle = RoomHandle {
            id: room_id.clone(),
            epoch,
            sender,
        };
        self.rooms.insert(room_id.clone(), handle.clone());
        info!("Room {} created (total rooms: {})", room_id, self.rooms.len());
        handle
    }

    async fn reap(&mut self, room_id: RoomId, epoch: u64) {
        let Some(handle) = self.rooms.get(&room_id) else {
            return;
        };
        if handle.epoch != epoch {
            return;
        }
        if handle.shutdown_if_idle().await {
            self.rooms.remove(&room_id);
            info!("Room {} reaped (total rooms: {})", room_id, self.rooms.len());
        }
    }
}

//! Peer connection handle
//!
//! Represents the relay side of one participant's full-duplex channel.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::{CloseReason, Outbound};
use crate::types::{ConnectionId, PeerId};

/// Connected peer information
///
/// Holds the peer id, the id of this particular connection and the
/// relay → peer channel drained by the connection's writer task.
/// Dropping every clone of `sender` closes the connection.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    /// Caller-supplied peer id
    pub peer_id: PeerId,
    /// Identifies this physical connection
    pub conn_id: ConnectionId,
    /// Relay → peer message channel
    pub sender: mpsc::Sender<Outbound>,
}

impl PeerConnection {
    /// Create a new peer connection handle
    pub fn new(peer_id: PeerId, conn_id: ConnectionId, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            peer_id,
            conn_id,
            sender,
        }
    }

    /// Queue a message for this peer without waiting
    ///
    /// Returns an error if the channel is closed (peer disconnected) or
    /// full (peer is not keeping up).
    pub fn send(&self, msg: impl Into<Outbound>) -> Result<(), SendError> {
        self.sender.try_send(msg.into()).map_err(|e| match e {
            TrySendError::Full(_) => SendError::ChannelFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Ask the writer task to close the connection with a reason
    pub fn close(&self, reason: CloseReason) -> Result<(), SendError> {
        self.send(Outbound::Close(reason))
    }

    /// Check whether this handle belongs to the given connection
    pub fn is_connection(&self, conn_id: ConnectionId) -> bool {
        self.conn_id == conn_id
    }
}

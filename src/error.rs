//! Error types for the relay
//!
//! Defines application-level errors, per-recipient send errors and
//! chat store errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::CloseReason;

/// Application-level errors
///
/// Only errors that invalidate the connection itself end a peer's task.
/// Registry-level and persistence failures are contained and logged.
#[derive(Debug, Error)]
pub enum AppError {
    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Transport-level accept failure; nothing was registered
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// The peer id is already an active participant of the room
    #[error("Peer '{0}' is already admitted")]
    AlreadyAdmitted(String),

    /// The peer id is already waiting for approval in the room
    #[error("Peer '{0}' is already pending")]
    AlreadyPending(String),

    /// The admin rejected the candidate
    #[error("Admission rejected")]
    AdmissionRejected,

    /// No admission decision arrived in time
    #[error("Admission timed out")]
    AdmissionTimedOut,

    /// The room actor is gone (reaped or shut down)
    #[error("Room closed")]
    RoomClosed,

    /// Malformed or unrecognized inbound payload
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl AppError {
    /// Close reason to report to the peer, if this error warrants one
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            AppError::AlreadyAdmitted(_) => Some(CloseReason::AlreadyAdmitted),
            AppError::AlreadyPending(_) => Some(CloseReason::AlreadyPending),
            AppError::AdmissionRejected => Some(CloseReason::Rejected),
            AppError::AdmissionTimedOut => Some(CloseReason::TimedOut),
            AppError::RoomClosed => Some(CloseReason::RoomClosed),
            _ => None,
        }
    }
}

/// Message send errors
///
/// Occurs when a recipient's outbound channel cannot take a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The recipient is not draining its queue fast enough
    #[error("Channel full")]
    ChannelFull,
}

/// Chat store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Store refused the write (used by test doubles)
    #[error("Store unavailable")]
    Unavailable,
}

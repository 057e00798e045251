//! Message protocol definitions
//!
//! Inbound text is classified once at the boundary into [`Inbound`]:
//! opaque relay payloads pass through untouched, control messages are
//! parsed into a closed tagged enum. Outbound messages use Serde's tagged
//! enum with the kebab-case names browsers already speak.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::AppError;
use crate::types::PeerId;

/// `type` values that belong to peer-to-peer negotiation and are relayed
/// without interpretation.
pub const SIGNALING_TYPES: &[&str] = &[
    "offer",
    "answer",
    "ice-candidate",
    "candidate",
    "new-user",
    "call",
    "renegotiate",
    "hang-up",
];

/// Client → Server control message
///
/// Only the control types the relay itself acts on.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Chat line to persist and broadcast
    ChatMessage { sender: String, message: String },
    /// Admin's decision on a pending candidate
    AdmissionDecision {
        #[serde(rename = "peerId")]
        peer_id: String,
        approved: bool,
    },
    /// Shorthand for an approving decision
    Approved {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Shorthand for a rejecting decision
    Rejected {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Opaque negotiation payload, forwarded verbatim
    Relay(Arc<str>),
    /// Chat message
    Chat { sender: String, message: String },
    /// Admission decision about a pending candidate
    Decision { candidate: PeerId, approved: bool },
}

impl Inbound {
    /// Classify one inbound text frame
    ///
    /// Unknown or malformed control messages yield `AppError::InvalidMessage`.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Ok(Inbound::Relay(Arc::from(text)));
        };

        let kind = match &value {
            Value::Object(map) => match map.get("type") {
                None => return Ok(Inbound::Relay(Arc::from(text))),
                Some(Value::String(kind)) => kind.clone(),
                Some(_) => {
                    return Err(AppError::InvalidMessage("non-string type".to_string()))
                }
            },
            _ => return Ok(Inbound::Relay(Arc::from(text))),
        };

        if SIGNALING_TYPES.contains(&kind.as_str()) {
            return Ok(Inbound::Relay(Arc::from(text)));
        }

        let msg = serde_json::from_value::<ClientMessage>(value)
            .map_err(|e| AppError::InvalidMessage(format!("type '{}': {}", kind, e)))?;

        Ok(match msg {
            ClientMessage::ChatMessage { sender, message } => Inbound::Chat { sender, message },
            ClientMessage::AdmissionDecision { peer_id, approved } => Inbound::Decision {
                candidate: PeerId(peer_id),
                approved,
            },
            ClientMessage::Approved { peer_id } => Inbound::Decision {
                candidate: PeerId(peer_id),
                approved: true,
            },
            ClientMessage::Rejected { peer_id } => Inbound::Decision {
                candidate: PeerId(peer_id),
                approved: false,
            },
        })
    }
}

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent to the admin when a candidate is waiting
    ApprovalRequest {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Sent to the candidate right before it becomes active
    Approved {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A peer became active
    UserJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// An active peer's connection closed
    UserLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Broadcast form of a chat message
    ChatMessage { sender: String, message: String },
}

/// Why the relay closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Rejected,
    TimedOut,
    AlreadyAdmitted,
    AlreadyPending,
    RoomClosed,
    Idle,
    /// The same peer connected again
    Replaced,
}

impl CloseReason {
    /// Application close code (4000-4999 range)
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Rejected => 4003,
            CloseReason::TimedOut => 4008,
            CloseReason::AlreadyAdmitted | CloseReason::AlreadyPending => 4009,
            CloseReason::RoomClosed => 4010,
            CloseReason::Idle => 4011,
            CloseReason::Replaced => 4012,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            CloseReason::Rejected => "admission rejected",
            CloseReason::TimedOut => "admission timed out",
            CloseReason::AlreadyAdmitted => "already admitted",
            CloseReason::AlreadyPending => "already pending",
            CloseReason::RoomClosed => "room closed",
            CloseReason::Idle => "idle timeout",
            CloseReason::Replaced => "replaced by a newer connection",
        }
    }
}

/// One frame queued on a peer's outbound channel
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Relay payload, written exactly as received
    Relay(Arc<str>),
    /// Close the connection with a reason
    Close(CloseReason),
}

impl Outbound {
    /// Convert into a WebSocket frame
    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        Ok(match self {
            Outbound::Message(msg) => Message::Text(serde_json::to_string(msg)?),
            Outbound::Relay(text) => Message::Text(text.to_string()),
            Outbound::Close(reason) => Message::Close(Some(CloseFrame {
                code: CloseCode::from(reason.code()),
                reason: reason.text().into(),
            })),
        })
    }
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Outbound::Message(msg)
    }
}

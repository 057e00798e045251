//! Meeting Signaling Relay Library
//!
//! A WebSocket relay for peers collaborating in named meeting rooms,
//! built with tokio-tungstenite using the Actor pattern for room state.
//!
//! # Features
//! - One connection per peer at `/ws/{room}/{peer}`
//! - First peer of a room becomes its admin
//! - Later peers wait for the admin's approval (bounded by a timeout)
//! - Opaque signaling payloads relayed verbatim to the rest of the room
//! - Chat messages broadcast and persisted through a `ChatStore`
//! - Join/leave notifications and reaping of empty rooms
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `RoomRegistry` maps room ids to room actors
//! - Each room is an actor owning its admin, participants and pending queue
//! - Each connection has a `handler` task talking to its room actor
//! - No locks needed - all room state access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use meeting_relay::{serve, MemoryChatStore, RelayContext, RelaySettings, RoomRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let registry = RoomRegistry::spawn(256);
//!     let store = Arc::new(MemoryChatStore::new());
//!     let context = Arc::new(RelayContext::new(registry, RelaySettings::default(), store));
//!
//!     serve(listener, context).await;
//! }
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod peer;
pub mod registry;
pub mod room;
pub mod router;
pub mod server;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use admission::{request_admission, AdmissionOutcome};
pub use config::Config;
pub use error::{AppError, SendError, StoreError};
pub use handler::handle_connection;
pub use message::{ClientMessage, CloseReason, Inbound, Outbound, ServerMessage};
pub use peer::PeerConnection;
pub use registry::{Admission, RegistryHandle, RoomHandle, RoomRegistry, RoomSnapshot};
pub use room::Room;
pub use router::MessageRouter;
pub use server::{serve, RelayContext, RelaySettings};
pub use store::{
    ChatRecord, ChatStore, JsonlChatStore, LogChatStore, MemoryChatStore, RecordId,
};
pub use types::{ConnectionId, PeerId, RoomId};

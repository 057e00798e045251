//! Message router
//!
//! Classifies an active peer's inbound text and dispatches it: relay
//! payloads and chat go to the room's fan-out, chat additionally to the
//! chat store, admission decisions to the room's admission logic.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::AppError;
use crate::message::{Inbound, Outbound, ServerMessage};
use crate::registry::RoomHandle;
use crate::store::{ChatRecord, ChatStore};
use crate::types::{ConnectionId, PeerId};

/// Per-connection router for one active peer
pub struct MessageRouter {
    room: RoomHandle,
    peer_id: PeerId,
    conn_id: ConnectionId,
    store: Arc<dyn ChatStore>,
    /// Echo policy shared by relay and chat broadcasts
    exclude_sender: bool,
}

impl MessageRouter {
    pub fn new(
        room: RoomHandle,
        peer_id: PeerId,
        conn_id: ConnectionId,
        store: Arc<dyn ChatStore>,
        exclude_sender: bool,
    ) -> Self {
        Self {
            room,
            peer_id,
            conn_id,
            store,
            exclude_sender,
        }
    }

    /// Route one text frame
    ///
    /// Invalid messages are logged and dropped. Only `RoomClosed` is
    /// returned, meaning the connection can no longer take part.
    pub async fn route_text(&self, text: &str) -> Result<(), AppError> {
        match Inbound::parse(text) {
            Ok(inbound) => self.dispatch(inbound).await,
            Err(e) => {
                warn!("Discarding message from {} in room {}: {}", self.peer_id, self.room.id, e);
                Ok(())
            }
        }
    }

    pub async fn dispatch(&self, inbound: Inbound) -> Result<(), AppError> {
        match inbound {
            Inbound::Relay(payload) => {
                debug!("Relaying {} bytes from {}", payload.len(), self.peer_id);
                self.broadcast(Outbound::Relay(payload)).await
            }
            Inbound::Chat { sender, message } => {
                debug!("Chat from {} in room {}", sender, self.room.id);
                let record = ChatRecord::new(self.room.id.clone(), sender.clone(), message.clone());
                let accepted = self
                    .room
                    .broadcast_acked(
                        self.peer_id.clone(),
                        self.conn_id,
                        Outbound::from(ServerMessage::ChatMessage { sender, message }),
                        self.exclude_sender,
                    )
                    .await?;
                // Only chat the room delivered is stored
                if accepted {
                    tokio::spawn(persist(self.store.clone(), record));
                }
                Ok(())
            }
            Inbound::Decision {
                candidate,
                approved,
            } => {
                self.room
                    .decide(self.peer_id.clone(), self.conn_id, candidate, approved)
                    .await
            }
        }
    }

    async fn broadcast(&self, payload: Outbound) -> Result<(), AppError> {
        self.room
            .broadcast(
                self.peer_id.clone(),
                self.conn_id,
                payload,
                self.exclude_sender,
            )
            .await
    }
}

/// Best-effort, at-most-once chat write
async fn persist(store: Arc<dyn ChatStore>, record: ChatRecord) {
    let room_id = record.room_id.clone();
    match store.insert(record).await {
        Ok(id) => debug!("Stored chat record {:?} for room {}", id, room_id),
        Err(e) => warn!("Persistence failure for room {}: {}", room_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerConnection;
    use crate::registry::{JoinTicket, RegistryHandle, RoomRegistry};
    use crate::store::MemoryChatStore;
    use crate::types::RoomId;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connect(name: &str) -> (PeerConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (
            PeerConnection::new(PeerId::from(name), ConnectionId::new(), tx),
            rx,
        )
    }

    /// Room "r1" with admin alice and approved bob, admission traffic drained
    async fn setup(
        registry: &RegistryHandle,
    ) -> (
        RoomHandle,
        PeerConnection,
        mpsc::Receiver<Outbound>,
        mpsc::Receiver<Outbound>,
    ) {
        let room = registry.get_or_create(RoomId::from("r1")).await.unwrap();
        let (alice, mut alice_rx) = connect("alice");
        let (bob, mut bob_rx) = connect("bob");
        room.join(alice.clone()).await.unwrap();
        let JoinTicket::Pending(decision) = room.join(bob.clone()).await.unwrap() else {
            panic!("bob should be pending");
        };
        room.decide(alice.peer_id.clone(), alice.conn_id, bob.peer_id, true)
            .await
            .unwrap();
        decision.await.unwrap();
        alice_rx.recv().await.unwrap();
        alice_rx.recv().await.unwrap();
        bob_rx.recv().await.unwrap();
        (room, alice, alice_rx, bob_rx)
    }

    async fn wait_for_records(store: &MemoryChatStore, count: usize) -> Vec<ChatRecord> {
        for _ in 0..100 {
            let records = store.records().await;
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.records().await
    }

    #[tokio::test]
    async fn test_chat_is_persisted_and_broadcast() {
        let registry = RoomRegistry::spawn(16);
        let (room, alice, mut alice_rx, mut bob_rx) = setup(&registry).await;
        let store = Arc::new(MemoryChatStore::new());
        let router = MessageRouter::new(room, alice.peer_id, alice.conn_id, store.clone(), true);

        router
            .route_text(r#"{"type":"chat-message","sender":"alice","message":"hi"}"#)
            .await
            .unwrap();

        assert_eq!(
            bob_rx.recv().await,
            Some(Outbound::from(ServerMessage::ChatMessage {
                sender: "alice".to_string(),
                message: "hi".to_string()
            }))
        );
        let records = wait_for_records(&store, 1).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].room_id, RoomId::from("r1"));
        assert_eq!(records[0].sender, "alice");
        assert_eq!(records[0].message, "hi");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_broadcast_survives_store_failure() {
        let registry = RoomRegistry::spawn(16);
        let (room, alice, _alice_rx, mut bob_rx) = setup(&registry).await;
        let store = Arc::new(MemoryChatStore::new());
        store.set_failing(true);
        let router = MessageRouter::new(room, alice.peer_id, alice.conn_id, store.clone(), true);

        router
            .route_text(r#"{"type":"chat-message","sender":"alice","message":"still here"}"#)
            .await
            .unwrap();

        assert!(matches!(
            bob_rx.recv().await,
            Some(Outbound::Message(ServerMessage::ChatMessage { .. }))
        ));
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_chat_echo_when_sender_included() {
        let registry = RoomRegistry::spawn(16);
        let (room, alice, mut alice_rx, mut bob_rx) = setup(&registry).await;
        let store = Arc::new(MemoryChatStore::new());
        let router = MessageRouter::new(room, alice.peer_id, alice.conn_id, store, false);

        router
            .route_text(r#"{"type":"chat-message","sender":"alice","message":"hi"}"#)
            .await
            .unwrap();

        assert!(bob_rx.recv().await.is_some());
        assert!(alice_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_relay_forwarded_verbatim_and_invalid_dropped() {
        let registry = RoomRegistry::spawn(16);
        let (room, alice, _alice_rx, mut bob_rx) = setup(&registry).await;
        let store = Arc::new(MemoryChatStore::new());
        let router = MessageRouter::new(room, alice.peer_id, alice.conn_id, store, true);

        let offer = r#"{"type":"offer","sdp":"v=0",  "target":"bob"}"#;
        router.route_text(r#"{"type":"bogus"}"#).await.unwrap();
        router.route_text(offer).await.unwrap();

        assert_eq!(bob_rx.recv().await, Some(Outbound::Relay(offer.into())));
    }

    #[tokio::test]
    async fn test_chat_from_departed_peer_is_dropped() {
        let registry = RoomRegistry::spawn(16);
        let (room, alice, _alice_rx, mut bob_rx) = setup(&registry).await;
        let store = Arc::new(MemoryChatStore::new());
        room.depart(alice.peer_id.clone(), alice.conn_id).await.unwrap();
        let router = MessageRouter::new(room, alice.peer_id, alice.conn_id, store.clone(), true);

        router
            .route_text(r#"{"type":"chat-message","sender":"alice","message":"late"}"#)
            .await
            .unwrap();

        assert_eq!(
            bob_rx.recv().await,
            Some(Outbound::from(ServerMessage::UserLeft {
                peer_id: PeerId::from("alice")
            }))
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bob_rx.try_recv().is_err());
        assert!(store.records().await.is_empty());
    }
}

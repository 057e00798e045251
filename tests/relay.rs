//! End-to-end tests: a relay on a local port driven by WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use meeting_relay::{
    serve, ChatRecord, MemoryChatStore, PeerId, RegistryHandle, RelayContext, RelaySettings,
    RoomId, RoomRegistry, RoomSnapshot,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct Relay {
    addr: SocketAddr,
    registry: RegistryHandle,
    store: Arc<MemoryChatStore>,
}

impl Relay {
    async fn start(settings: RelaySettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = RoomRegistry::spawn(64);
        let store = Arc::new(MemoryChatStore::new());
        let context = Arc::new(RelayContext::new(registry.clone(), settings, store.clone()));
        tokio::spawn(serve(listener, context));
        Self {
            addr,
            registry,
            store,
        }
    }

    async fn connect(&self, room: &str, peer: &str) -> Client {
        let url = format!("ws://{}/ws/{}/{}", self.addr, room, peer);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn snapshot(&self, room: &str) -> RoomSnapshot {
        let room = self.registry.get_or_create(RoomId::from(room)).await.unwrap();
        room.snapshot().await.unwrap()
    }

    /// Wait until `check` holds for the room
    async fn wait_for(&self, room: &str, check: impl Fn(&RoomSnapshot) -> bool) -> RoomSnapshot {
        for _ in 0..200 {
            let snapshot = self.snapshot(room).await;
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {} never reached the expected state", room);
    }

    async fn wait_active(&self, room: &str, peer: &str) {
        let peer = PeerId::from(peer);
        self.wait_for(room, |s| s.participants.contains(&peer)).await;
    }

    async fn wait_pending(&self, room: &str, peer: &str) {
        let peer = PeerId::from(peer);
        self.wait_for(room, |s| s.pending.contains(&peer)).await;
    }

    async fn wait_for_records(&self, count: usize) -> Vec<ChatRecord> {
        for _ in 0..200 {
            let records = self.store.records().await;
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.store.records().await
    }
}

async fn recv_text(client: &mut Client) -> String {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection ended")
            .unwrap();
        match frame {
            Message::Text(text) => return text,
            Message::Close(close) => panic!("unexpected close: {:?}", close),
            _ => continue,
        }
    }
}

async fn recv_json(client: &mut Client) -> Value {
    serde_json::from_str(&recv_text(client).await).unwrap()
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

/// Close code the relay closed `client` with
async fn recv_close_code(client: &mut Client) -> u16 {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("connection ended without close frame")
            .unwrap();
        match frame {
            Message::Close(Some(close)) => return u16::from(close.code),
            Message::Close(None) => panic!("close frame without code"),
            _ => continue,
        }
    }
}

async fn assert_silent(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(150), client.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("unexpected message: {}", text);
    }
}

/// Admin "alice" and approved "bob" in `room`, admission traffic consumed
async fn alice_and_bob(relay: &Relay, room: &str) -> (Client, Client) {
    let mut alice = relay.connect(room, "alice").await;
    relay.wait_active(room, "alice").await;

    let mut bob = relay.connect(room, "bob").await;
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "approval-request", "peerId": "bob"})
    );
    send_json(&mut alice, json!({"type": "approved", "peerId": "bob"})).await;

    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "approved", "peerId": "bob"})
    );
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "user-joined", "peerId": "bob"})
    );
    relay.wait_active(room, "bob").await;
    (alice, bob)
}

#[tokio::test]
async fn test_first_peer_is_admin_without_approval() {
    let relay = Relay::start(RelaySettings::default()).await;

    let mut alice = relay.connect("r1", "alice").await;
    relay.wait_active("r1", "alice").await;

    let snapshot = relay.snapshot("r1").await;
    assert_eq!(snapshot.admin, Some(PeerId::from("alice")));
    assert!(snapshot.pending.is_empty());
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_meeting_lifecycle() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    // bob never hears about his own arrival
    assert_silent(&mut bob).await;

    send_json(
        &mut alice,
        json!({"type": "chat-message", "sender": "alice", "message": "hi"}),
    )
    .await;
    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "chat-message", "sender": "alice", "message": "hi"})
    );
    assert_silent(&mut alice).await;

    let records = relay.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].room_id, RoomId::from("r1"));
    assert_eq!(records[0].sender, "alice");
    assert_eq!(records[0].message, "hi");

    alice.close(None).await.unwrap();
    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "user-left", "peerId": "alice"})
    );

    let snapshot = relay
        .wait_for("r1", |s| s.participants == vec![PeerId::from("bob")])
        .await;
    assert_eq!(snapshot.admin, Some(PeerId::from("alice")));
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_signaling_payload_relayed_verbatim() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    let offer = r#"{"type":"offer",  "sdp":"v=0\r\no=- 1 1 IN IP4 0.0.0.0", "to":"bob"}"#;
    alice.send(Message::Text(offer.to_string())).await.unwrap();
    assert_eq!(recv_text(&mut bob).await, offer);

    bob.send(Message::Text("plain text candidate".to_string()))
        .await
        .unwrap();
    assert_eq!(recv_text(&mut alice).await, "plain text candidate");
}

#[tokio::test]
async fn test_invalid_message_keeps_connection_open() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    send_json(&mut bob, json!({"type": "teleport", "to": "mars"})).await;
    send_json(&mut bob, json!({"type": "answer", "sdp": "x"})).await;

    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "answer", "sdp": "x"})
    );
}

#[tokio::test]
async fn test_rejected_candidate_is_closed_silently() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    let mut mallory = relay.connect("r1", "mallory").await;
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "approval-request", "peerId": "mallory"})
    );
    send_json(
        &mut alice,
        json!({"type": "admission-decision", "peerId": "mallory", "approved": false}),
    )
    .await;

    assert_eq!(recv_close_code(&mut mallory).await, 4003);
    assert_silent(&mut bob).await;
    let snapshot = relay.snapshot("r1").await;
    assert!(snapshot.pending.is_empty());
    assert!(!snapshot.participants.contains(&PeerId::from("mallory")));
}

#[tokio::test]
async fn test_pending_candidate_times_out() {
    let settings = RelaySettings {
        admission_timeout: Duration::from_millis(200),
        ..RelaySettings::default()
    };
    let relay = Relay::start(settings).await;

    let mut alice = relay.connect("r1", "alice").await;
    relay.wait_active("r1", "alice").await;
    let mut bob = relay.connect("r1", "bob").await;
    recv_json(&mut alice).await; // approval-request

    assert_eq!(recv_close_code(&mut bob).await, 4008);
    relay.wait_for("r1", |s| s.pending.is_empty()).await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_non_admin_cannot_approve() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    let _carol = relay.connect("r1", "carol").await;
    recv_json(&mut alice).await; // approval-request
    send_json(&mut bob, json!({"type": "approved", "peerId": "carol"})).await;

    // still waiting after bob's attempt
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = relay.snapshot("r1").await;
    assert_eq!(snapshot.pending, vec![PeerId::from("carol")]);
}

#[tokio::test]
async fn test_independent_pending_candidates() {
    let relay = Relay::start(RelaySettings::default()).await;

    let mut alice = relay.connect("r1", "alice").await;
    relay.wait_active("r1", "alice").await;

    let mut bob = relay.connect("r1", "bob").await;
    relay.wait_pending("r1", "bob").await;
    let mut carol = relay.connect("r1", "carol").await;
    relay.wait_pending("r1", "carol").await;

    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "approval-request", "peerId": "bob"})
    );
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "approval-request", "peerId": "carol"})
    );

    send_json(&mut alice, json!({"type": "approved", "peerId": "carol"})).await;
    assert_eq!(
        recv_json(&mut carol).await,
        json!({"type": "approved", "peerId": "carol"})
    );
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "user-joined", "peerId": "carol"})
    );

    let snapshot = relay.snapshot("r1").await;
    assert_eq!(snapshot.pending, vec![PeerId::from("bob")]);
    assert_silent(&mut bob).await;

    send_json(&mut alice, json!({"type": "approved", "peerId": "bob"})).await;
    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "approved", "peerId": "bob"})
    );
    assert_eq!(
        recv_json(&mut carol).await,
        json!({"type": "user-joined", "peerId": "bob"})
    );
}

#[tokio::test]
async fn test_duplicate_peer_id_is_refused() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    let mut impostor = relay.connect("r1", "bob").await;
    assert_eq!(recv_close_code(&mut impostor).await, 4009);

    let snapshot = relay.snapshot("r1").await;
    assert_eq!(
        snapshot.participants,
        vec![PeerId::from("alice"), PeerId::from("bob")]
    );
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_admin_reconnect_replaces_live_connection() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    let mut carol = relay.connect("r1", "carol").await;
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "approval-request", "peerId": "carol"})
    );

    // The old socket may be half-open; the new one takes over
    let mut alice_again = relay.connect("r1", "alice").await;
    assert_eq!(recv_close_code(&mut alice).await, 4012);
    assert_eq!(
        recv_json(&mut alice_again).await,
        json!({"type": "approval-request", "peerId": "carol"})
    );

    send_json(&mut alice_again, json!({"type": "approved", "peerId": "carol"})).await;
    assert_eq!(
        recv_json(&mut carol).await,
        json!({"type": "approved", "peerId": "carol"})
    );
    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "user-joined", "peerId": "carol"})
    );
    assert_eq!(
        recv_json(&mut alice_again).await,
        json!({"type": "user-joined", "peerId": "carol"})
    );

    let snapshot = relay.snapshot("r1").await;
    assert_eq!(snapshot.admin, Some(PeerId::from("alice")));
    assert_eq!(snapshot.participants.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_joins_elect_one_admin() {
    let relay = Arc::new(Relay::start(RelaySettings::default()).await);

    let connects = (0..20).map(|i| {
        let relay = relay.clone();
        tokio::spawn(async move { relay.connect("r1", &format!("peer-{}", i)).await })
    });
    let _clients: Vec<Client> = futures_util::future::join_all(connects)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let snapshot = relay
        .wait_for("r1", |s| s.participants.len() == 1 && s.pending.len() == 19)
        .await;
    let admin = snapshot.admin.expect("room has an admin");
    assert_eq!(snapshot.participants, vec![admin.clone()]);
    assert!(!snapshot.pending.contains(&admin));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_order_survives_membership_churn() {
    let relay = Arc::new(Relay::start(RelaySettings::default()).await);
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    let mut carol = relay.connect("r1", "carol").await;
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "approval-request", "peerId": "carol"})
    );
    send_json(&mut alice, json!({"type": "approved", "peerId": "carol"})).await;
    assert_eq!(
        recv_json(&mut carol).await,
        json!({"type": "approved", "peerId": "carol"})
    );
    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "user-joined", "peerId": "carol"})
    );
    relay.wait_active("r1", "carol").await;

    let churn = {
        let relay = relay.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let mut guest = relay.connect("r1", &format!("guest-{}", i)).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
                guest.close(None).await.unwrap();
            }
        })
    };

    for seq in 0..100 {
        send_json(&mut alice, json!({"seq": seq})).await;
    }

    for client in [&mut bob, &mut carol] {
        let mut expected = 0;
        while expected < 100 {
            let value = recv_json(client).await;
            if let Some(seq) = value.get("seq") {
                assert_eq!(seq, &json!(expected));
                expected += 1;
            }
        }
    }
    churn.await.unwrap();
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let relay = Relay::start(RelaySettings {
        idle_timeout: Some(Duration::from_millis(400)),
        ..RelaySettings::default()
    })
    .await;
    let (mut alice, mut bob) = alice_and_bob(&relay, "r1").await;

    // alice stays busy, bob says nothing
    let keep_alive = tokio::spawn(async move {
        for _ in 0..8 {
            send_json(&mut alice, json!({"type": "candidate", "c": 1})).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        alice
    });

    assert_eq!(recv_close_code(&mut bob).await, 4011);
    let mut alice = keep_alive.await.unwrap();
    assert_eq!(
        recv_json(&mut alice).await,
        json!({"type": "user-left", "peerId": "bob"})
    );
    relay.wait_for("r1", |s| s.participants == vec![PeerId::from("alice")]).await;
}

#[tokio::test]
async fn test_rooms_do_not_share_traffic() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut alice, _bob) = alice_and_bob(&relay, "r1").await;

    let mut dave = relay.connect("r2", "dave").await;
    relay.wait_active("r2", "dave").await;

    send_json(&mut alice, json!({"type": "offer", "sdp": "x"})).await;
    assert_silent(&mut dave).await;
}

#[tokio::test]
async fn test_bad_path_is_rejected() {
    let relay = Relay::start(RelaySettings::default()).await;

    let url = format!("ws://{}/lobby", relay.addr);
    assert!(connect_async(url).await.is_err());
    assert_eq!(relay.registry.room_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_room_is_reaped() {
    let relay = Relay::start(RelaySettings::default()).await;

    let mut alice = relay.connect("r1", "alice").await;
    relay.wait_active("r1", "alice").await;
    assert_eq!(relay.registry.room_count().await.unwrap(), 1);

    alice.close(None).await.unwrap();
    let mut reaped = false;
    for _ in 0..200 {
        if relay.registry.room_count().await.unwrap() == 0 {
            reaped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reaped);

    // next connection starts a fresh room with a fresh admin
    let _bob = relay.connect("r1", "bob").await;
    relay.wait_active("r1", "bob").await;
    let snapshot = relay.snapshot("r1").await;
    assert_eq!(snapshot.admin, Some(PeerId::from("bob")));
}

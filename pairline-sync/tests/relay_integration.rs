//! Integration tests against a real WebSocket relay on a free port.

use std::sync::Arc;

use pairline_sync::config::{SyncConfig, TransportConfig};
use pairline_sync::media::{SyntheticBackend, SyntheticSfu};
use pairline_sync::protocol::{ChannelEvent, ChatMessage, ParticipantRecord};
use pairline_sync::server::{RelayConfig, RelayServer};
use pairline_sync::session::{self, JoinRequest, SessionHandle, SessionServices, SessionSnapshot};
use pairline_sync::store::MemoryStore;
use pairline_sync::transport::{ChannelTransport, ConnectionState, TransportEvent, WsConnector};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Start a relay on a free port, return its URL.
async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(RelayConfig {
        bind_addr: addr.to_string(),
        ..RelayConfig::default()
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

async fn transport(url: &str, session: Uuid) -> ChannelTransport {
    let mut t = ChannelTransport::new(Arc::new(WsConnector::new(url)), TransportConfig::default(), session);
    t.subscribe_all();
    t.connect().await.unwrap();
    t
}

/// Next event that is not a presence snapshot.
async fn next_message(t: &mut ChannelTransport) -> ChannelEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match t.recv().await {
                TransportEvent::Message(envelope) => return envelope.event,
                TransportEvent::Presence(_) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    })
    .await
    .expect("no message")
}

async fn next_presence(t: &mut ChannelTransport, len: usize) -> Vec<ParticipantRecord> {
    timeout(Duration::from_secs(2), async {
        loop {
            if let TransportEvent::Presence(roster) = t.recv().await {
                if roster.len() == len {
                    return roster;
                }
            }
        }
    })
    .await
    .expect("roster never reached the expected size")
}

#[tokio::test]
async fn test_events_fan_out_to_others_only() {
    let url = start_relay().await;
    let session = Uuid::new_v4();
    let mut a = transport(&url, session).await;
    let mut b = transport(&url, session).await;
    assert_eq!(a.state(), ConnectionState::Connected);

    let sender = Uuid::new_v4();
    let message = ChatMessage {
        id: Uuid::new_v4(),
        sender_id: sender,
        text: "over the wire".into(),
        ts: 1,
    };
    a.publish(ChannelEvent::ChatMessage(message.clone())).await.unwrap();
    assert_eq!(next_message(&mut b).await, ChannelEvent::ChatMessage(message));

    // Nothing comes back to the publisher.
    assert!(timeout(Duration::from_millis(200), next_message(&mut a)).await.is_err());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let url = start_relay().await;
    let mut a = transport(&url, Uuid::new_v4()).await;
    let mut b = transport(&url, Uuid::new_v4()).await;

    a.publish(ChannelEvent::Typing { is_typing: true, sender_id: Uuid::new_v4() })
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(200), next_message(&mut b)).await.is_err());
}

#[tokio::test]
async fn test_presence_join_and_disconnect() {
    let url = start_relay().await;
    let session = Uuid::new_v4();
    let mut a = transport(&url, session).await;
    let mut b = transport(&url, session).await;

    let ada = ParticipantRecord::new(Uuid::new_v4(), Some("ada".into()));
    let bob = ParticipantRecord::new(Uuid::new_v4(), Some("bob".into()));
    a.publish(ChannelEvent::Join(ada.clone())).await.unwrap();
    b.publish(ChannelEvent::Join(bob)).await.unwrap();
    next_presence(&mut a, 2).await;

    // Dropping B's link removes its record.
    b.disconnect();
    let roster = next_presence(&mut a, 1).await;
    assert_eq!(roster[0].participant_id, ada.participant_id);
}

async fn open_ws_session(url: &str, session_id: Uuid, name: &str) -> SessionHandle {
    let store = Arc::new(MemoryStore::new());
    let services = SessionServices {
        connector: Arc::new(WsConnector::new(url)),
        store: store.clone(),
        grants: store.clone(),
        profiles: store,
        media: Arc::new(SyntheticBackend::new(SyntheticSfu::new())),
    };
    let config = SyncConfig {
        channel_url: url.to_string(),
        ..SyncConfig::default()
    };
    session::open(
        &config,
        services,
        JoinRequest {
            session_id,
            participant_id: Uuid::new_v4(),
            display_name: Some(name.into()),
        },
    )
    .await
}

async fn eventually(handle: &SessionHandle, check: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    for _ in 0..100 {
        let snapshot = handle.snapshot().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn test_sessions_sync_over_websocket() {
    let url = start_relay().await;
    let session_id = Uuid::new_v4();
    let a = open_ws_session(&url, session_id, "ada").await;
    let b = open_ws_session(&url, session_id, "bob").await;

    eventually(&a, |s| s.roster.len() == 2).await;
    a.edit("fn main() { println!(\"hi\"); }").unwrap();
    eventually(&b, |s| s.document.text.contains("println")).await;

    b.send_chat("looks good").unwrap();
    eventually(&a, |s| s.chat.iter().any(|m| m.text == "looks good")).await;

    b.leave().await.unwrap();
    eventually(&a, |s| s.roster.len() == 1).await;
}

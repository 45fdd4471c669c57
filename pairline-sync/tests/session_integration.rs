//! End-to-end session tests over the in-process hub.
//!
//! Every test runs with a paused clock, so debounce windows, retry delays and
//! heartbeats elapse instantly once all tasks are idle.

use std::sync::Arc;

use pairline_sync::document::Language;
use pairline_sync::media::{CallState, SourceKind, SyntheticSfu, TileKind};
use pairline_sync::protocol::CursorPosition;
use pairline_sync::session::{self, JoinRequest, SessionEvent, SessionHandle, SessionServices, SessionSnapshot};
use pairline_sync::store::{MemoryStore, Profile, RosterEntry, SessionRow, SessionStatus, StoredDocument};
use pairline_sync::transport::{ConnectionState, LocalHub};
use pairline_sync::{ErrorClass, SyncConfig};
use tokio::time::{sleep, timeout, Duration, Instant};
use uuid::Uuid;

struct World {
    hub: Arc<LocalHub>,
    store: Arc<MemoryStore>,
    sfu: Arc<SyntheticSfu>,
    session_id: Uuid,
    config: SyncConfig,
}

impl World {
    fn new() -> Self {
        Self {
            hub: LocalHub::new(),
            store: Arc::new(MemoryStore::new()),
            sfu: SyntheticSfu::new(),
            session_id: Uuid::new_v4(),
            config: SyncConfig::default(),
        }
    }

    async fn join(&self, name: &str) -> SessionHandle {
        self.join_with(&self.config, name).await
    }

    async fn join_with(&self, config: &SyncConfig, name: &str) -> SessionHandle {
        let services = SessionServices::local(&self.hub, self.store.clone(), &self.sfu);
        session::open(
            config,
            services,
            JoinRequest {
                session_id: self.session_id,
                participant_id: Uuid::new_v4(),
                display_name: Some(name.to_string()),
            },
        )
        .await
    }
}

/// Poll snapshots until `check` holds.
async fn eventually(handle: &SessionHandle, check: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    for _ in 0..500 {
        let snapshot = handle.snapshot().await.expect("session closed");
        if check(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held");
}

/// Wait for the first event `pick` accepts.
async fn next_matching<T>(handle: &mut SessionHandle, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
    timeout(Duration::from_secs(60), async {
        loop {
            let event = handle.next_event().await.expect("session closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("event never arrived")
}

fn drain(handle: &mut SessionHandle) -> Vec<SessionEvent> {
    std::iter::from_fn(|| handle.try_next_event()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_roster_converges() {
    let world = World::new();
    let a = world.join("ada").await;
    let b = world.join("brian").await;

    let snapshot = eventually(&a, |s| s.roster.len() == 2).await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    let names: Vec<_> = snapshot.roster.iter().filter_map(|r| r.name.clone()).collect();
    assert!(names.contains(&"ada".to_string()));
    assert!(names.contains(&"brian".to_string()));
    eventually(&b, |s| s.roster.len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_last_edit_wins() {
    let world = World::new();
    let a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;

    a.edit("print('a')").unwrap();
    eventually(&b, |s| s.document.text == "print('a')").await;

    b.edit("print('b')").unwrap();
    eventually(&a, |s| s.document.text == "print('b')").await;
    let a_doc = a.snapshot().await.unwrap().document;
    let b_doc = b.snapshot().await.unwrap().document;
    assert_eq!(a_doc.text, b_doc.text);
    // Remote replacements do not count as local revisions.
    assert_eq!(a_doc.revision, 1);
}

#[tokio::test(start_paused = true)]
async fn test_own_edit_is_not_echoed() {
    let world = World::new();
    let mut a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&a, |s| s.roster.len() == 2).await;
    drain(&mut a);

    a.edit("x = 1").unwrap();
    eventually(&b, |s| s.document.text == "x = 1").await;
    // Re-emitting the same text is not a new edit.
    a.edit("x = 1").unwrap();
    let snapshot = a.snapshot().await.unwrap();
    assert_eq!(snapshot.document.revision, 1);
    assert!(!drain(&mut a).iter().any(|e| matches!(e, SessionEvent::DocumentReplaced(_))));
}

#[tokio::test(start_paused = true)]
async fn test_language_change_replaces_document() {
    let world = World::new();
    let mut a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;

    a.change_language(Language::Rust).unwrap();
    let replaced = next_matching(&mut a, |e| match e {
        SessionEvent::DocumentReplaced(state) => Some(state),
        _ => None,
    })
    .await;
    assert_eq!(replaced.language, Language::Rust);
    assert_eq!(replaced.text, Language::Rust.template());

    let snapshot = eventually(&b, |s| s.document.language == Language::Rust).await;
    assert_eq!(snapshot.document.text, Language::Rust.template());
}

#[tokio::test(start_paused = true)]
async fn test_debounced_save() {
    let world = World::new();
    let a = world.join("ada").await;

    a.edit("draft 1").unwrap();
    a.edit("draft 2").unwrap();
    sleep(Duration::from_millis(500)).await;
    a.edit("draft 3").unwrap();
    sleep(Duration::from_millis(1000)).await;
    assert!(world.store.document(&world.session_id).is_none());

    sleep(Duration::from_millis(1500)).await;
    eventually(&a, |_| world.store.document(&world.session_id).is_some()).await;
    assert_eq!(world.store.document(&world.session_id).map(|d| d.code), Some("draft 3".into()));
    assert_eq!(world.store.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_is_reported() {
    let world = World::new();
    world.store.set_fail_saves(true);
    let mut a = world.join("ada").await;

    a.edit("doomed").unwrap();
    let class = next_matching(&mut a, |e| match e {
        SessionEvent::Error { class, .. } => Some(class),
        _ => None,
    })
    .await;
    assert_eq!(class, ErrorClass::Persistence);

    // The final flush retries the latest text.
    world.store.set_fail_saves(false);
    a.leave().await.unwrap();
    assert_eq!(world.store.document(&world.session_id).map(|d| d.code), Some("doomed".into()));
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_loads_stored_document() {
    let world = World::new();
    world.store.insert_document(
        world.session_id,
        StoredDocument {
            code: "fn main() {}".into(),
            language: Language::Rust,
        },
    );
    world.store.insert_session(SessionRow {
        id: world.session_id,
        host_id: Uuid::new_v4(),
        status: SessionStatus::Live,
        scheduled_start: Some(0),
        duration_minutes: 30,
    });

    let a = world.join("ada").await;
    let snapshot = a.snapshot().await.unwrap();
    assert_eq!(snapshot.document.text, "fn main() {}");
    assert_eq!(snapshot.document.language, Language::Rust);
    // Scheduled at the epoch: long over.
    assert_eq!(snapshot.status, Some(SessionStatus::Ended));
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_clears() {
    let world = World::new();
    let a = world.join("ada").await;
    let mut b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;
    drain(&mut b);

    // Keep typing well past the remote TTL; B must keep showing A.
    for i in 0..10 {
        a.edit(format!("line {i}")).unwrap();
        sleep(Duration::from_millis(500)).await;
        let snapshot = b.snapshot().await.unwrap();
        assert_eq!(snapshot.typing, vec![a.participant_id()], "dropped after {}ms", (i + 1) * 500);
    }
    drain(&mut b);

    a.edit("done").unwrap();
    let last_keystroke = Instant::now();
    next_matching(&mut b, |e| match e {
        SessionEvent::TypingChanged(ids) if ids.is_empty() => Some(()),
        _ => None,
    })
    .await;
    let idle = last_keystroke.elapsed();
    assert!(idle >= Duration::from_millis(1000), "cleared early: {idle:?}");
    assert!(idle < Duration::from_millis(1500), "cleared by expiry instead of idle: {idle:?}");
}

#[tokio::test(start_paused = true)]
async fn test_cursor_reaches_peer() {
    let world = World::new();
    let a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;

    a.move_cursor(CursorPosition { line: 1, column: 1 }).unwrap();
    a.move_cursor(CursorPosition { line: 3, column: 7 }).unwrap();
    let snapshot = eventually(&b, |s| {
        s.cursors
            .get(&a.participant_id())
            .is_some_and(|c| c.position == CursorPosition { line: 3, column: 7 })
    })
    .await;
    assert_eq!(snapshot.cursors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_chat_delivered_once() {
    let world = World::new();
    let mut a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;

    a.send_chat("hello").unwrap();
    let local = next_matching(&mut a, |e| match e {
        SessionEvent::Chat(message) => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(local.text, "hello");

    let snapshot = eventually(&b, |s| s.chat.len() == 1).await;
    assert_eq!(snapshot.chat[0].id, local.id);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(a.snapshot().await.unwrap().chat.len(), 1);
    assert_eq!(b.snapshot().await.unwrap().chat.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reannounces_after_reconnect() {
    let world = World::new();
    let a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&a, |s| s.roster.len() == 2).await;

    world.hub.sever_all();
    eventually(&a, |s| s.connection == ConnectionState::Disconnected).await;
    let snapshot = eventually(&a, |s| s.connection == ConnectionState::Connected && s.roster.len() == 2).await;
    assert!(snapshot.roster.iter().any(|r| r.participant_id == b.participant_id()));
    eventually(&b, |s| s.roster.len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_offline_edit_reaches_peers_after_reconnect() {
    let world = World::new();
    // A comes back after B, so B is subscribed when A catches it up.
    let mut slow = world.config.clone();
    slow.transport.reconnect_delay_ms = 4_000;
    let a = world.join_with(&slow, "ada").await;
    let b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;

    world.hub.set_offline(true);
    world.hub.sever_all();
    eventually(&a, |s| s.connection == ConnectionState::Disconnected).await;
    a.edit("written offline").unwrap();

    world.hub.set_offline(false);
    eventually(&b, |s| s.document.text == "written offline").await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_then_manual_retry() {
    let world = World::new();
    world.hub.set_offline(true);
    let mut a = world.join("ada").await;

    let message = next_matching(&mut a, |e| match e {
        SessionEvent::Error { class: ErrorClass::Connectivity, message } if message.contains("attempts") => {
            Some(message)
        }
        _ => None,
    })
    .await;
    assert!(message.contains('5'));

    world.hub.set_offline(false);
    a.retry_connection().unwrap();
    eventually(&a, |s| s.connection == ConnectionState::Connected && s.roster.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_profile_enrichment() {
    let world = World::new();
    let host = Uuid::new_v4();
    world.store.insert_profile(Profile {
        participant_id: host,
        name: Some("Host".into()),
        avatar_url: Some("https://img/host.png".into()),
    });
    world.store.insert_roster(
        world.session_id,
        vec![RosterEntry {
            participant_id: host,
            name: Some("Host".into()),
            avatar_url: None,
        }],
    );

    let services = SessionServices::local(&world.hub, world.store.clone(), &world.sfu);
    let h = session::open(
        &world.config,
        services,
        JoinRequest {
            session_id: world.session_id,
            participant_id: host,
            display_name: None,
        },
    )
    .await;
    let b = world.join("brian").await;

    let snapshot = eventually(&b, |s| {
        s.roster
            .iter()
            .any(|r| r.participant_id == host && r.avatar_url.is_some())
    })
    .await;
    let record = snapshot.roster.iter().find(|r| r.participant_id == host).unwrap();
    assert_eq!(record.name.as_deref(), Some("Host"));
    drop(h);
}

#[tokio::test(start_paused = true)]
async fn test_call_between_two_participants() {
    let world = World::new();
    let a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&a, |s| s.roster.len() == 2).await;
    eventually(&b, |s| s.roster.len() == 2).await;

    a.join_call().unwrap();
    eventually(&a, |s| s.call == CallState::Active).await;
    b.join_call().unwrap();

    let snapshot = eventually(&b, |s| s.tiles.len() == 2).await;
    let remote = snapshot.tiles.iter().find(|t| !t.local).unwrap();
    assert_eq!(remote.participant, a.participant_id());
    assert_eq!(remote.kind, TileKind::Media);
    assert!(remote.video.is_some() && remote.audio.is_some());
    eventually(&a, |s| s.tiles.len() == 2).await;
    eventually(&b, |s| s.roster.iter().all(|r| r.in_call)).await;

    b.share_screen(true).unwrap();
    eventually(&a, |s| s.tiles.iter().any(|t| t.kind == TileKind::Screen)).await;
    b.toggle_mute(SourceKind::Microphone).unwrap();
    eventually(&b, |s| s.tiles.iter().any(|t| t.local && t.audio_muted)).await;

    a.leave_call().unwrap();
    let snapshot = eventually(&b, |s| s.tiles.iter().all(|t| t.local)).await;
    assert_eq!(snapshot.call, CallState::Active);
    let a_view = eventually(&a, |s| s.call == CallState::Idle).await;
    assert!(a_view.tiles.is_empty());
    eventually(&b, |s| {
        s.roster
            .iter()
            .any(|r| r.participant_id == a.participant_id() && !r.in_call)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_call_join_requires_grant() {
    let world = World::new();
    world.store.set_fail_grants(true);
    let mut a = world.join("ada").await;

    a.join_call().unwrap();
    let class = next_matching(&mut a, |e| match e {
        SessionEvent::Error { class, .. } => Some(class),
        _ => None,
    })
    .await;
    assert_eq!(class, ErrorClass::Media);
    eventually(&a, |s| s.call == CallState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_flushes_and_departs() {
    let world = World::new();
    let a = world.join("ada").await;
    let b = world.join("brian").await;
    eventually(&b, |s| s.roster.len() == 2).await;

    a.join_call().unwrap();
    eventually(&a, |s| s.call == CallState::Active).await;
    a.edit("last words").unwrap();
    a.leave().await.unwrap();

    // Saved well before the debounce would have fired.
    assert_eq!(world.store.document(&world.session_id).map(|d| d.code), Some("last words".into()));
    assert!(world.sfu.participants().is_empty());
    eventually(&b, |s| s.roster.len() == 1).await;
}

//! Relay-side session rooms: fan-out plus the authoritative presence map.
//!
//! Uses tokio broadcast channels for O(1) send to all connections of a room.
//! Frames are encoded once and shared as `Arc<Vec<u8>>`; each connection
//! skips the frames it originated.
//!
//! ```text
//! conn A ──Publish──► RelayRoom ──Frame{skip: A}──► conn B, conn C
//! conn B ──Join─────► RelayRoom ──PresenceSync────► conn A, B, C
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{
    now_millis, ConnectionId, Envelope, ParticipantRecord, ProtocolError, ServerFrame, SessionId,
};

/// Message pushed to every connection of a room.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded `ServerFrame`, not delivered to `skip`.
    Frame {
        skip: Option<ConnectionId>,
        bytes: Arc<Vec<u8>>,
    },
    /// Close the given connection (heartbeat eviction).
    Evict(ConnectionId),
}

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub connections: usize,
    pub present: usize,
}

struct Member {
    record: Option<ParticipantRecord>,
    last_heard: Instant,
}

/// One session's relay room.
pub struct RelayRoom {
    sender: broadcast::Sender<Arc<Outbound>>,
    members: RwLock<HashMap<ConnectionId, Member>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl RelayRoom {
    /// `capacity` is how many frames a slow connection may lag before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection. It is not part of the roster until it announces.
    pub async fn attach(&self, connection: ConnectionId) -> broadcast::Receiver<Arc<Outbound>> {
        let mut members = self.members.write().await;
        members.insert(
            connection,
            Member {
                record: None,
                last_heard: Instant::now(),
            },
        );
        self.sender.subscribe()
    }

    /// Remove a connection; announces the new roster if it was present.
    pub async fn detach(&self, connection: &ConnectionId) -> Result<bool, ProtocolError> {
        let was_present = {
            let mut members = self.members.write().await;
            members
                .remove(connection)
                .map(|m| m.record.is_some())
                .unwrap_or(false)
        };
        if was_present {
            self.broadcast_presence().await?;
        }
        Ok(was_present)
    }

    /// Record (or replace) the presence announced by a connection.
    pub async fn track(
        &self,
        connection: ConnectionId,
        mut record: ParticipantRecord,
    ) -> Result<(), ProtocolError> {
        record.last_seen = now_millis();
        {
            let mut members = self.members.write().await;
            let member = members.entry(connection).or_insert_with(|| Member {
                record: None,
                last_heard: Instant::now(),
            });
            member.record = Some(record);
            member.last_heard = Instant::now();
        }
        self.broadcast_presence().await
    }

    /// Drop a connection's presence while keeping it attached.
    pub async fn untrack(&self, connection: &ConnectionId) -> Result<(), ProtocolError> {
        let changed = {
            let mut members = self.members.write().await;
            members
                .get_mut(connection)
                .and_then(|m| m.record.take())
                .is_some()
        };
        if changed {
            self.broadcast_presence().await?;
        }
        Ok(())
    }

    /// Note that a connection is alive.
    pub async fn touch(&self, connection: &ConnectionId) {
        if let Some(member) = self.members.write().await.get_mut(connection) {
            member.last_heard = Instant::now();
        }
    }

    /// Fan an envelope out to every other connection.
    pub fn forward(&self, origin: ConnectionId, envelope: Envelope) -> Result<usize, ProtocolError> {
        let bytes = ServerFrame::Event(envelope).encode()?;
        Ok(self.send(Outbound::Frame {
            skip: Some(origin),
            bytes: Arc::new(bytes),
        }))
    }

    /// Current roster, ordered by participant id. A participant connected
    /// more than once is listed once, with its most recent record.
    pub async fn snapshot(&self) -> Vec<ParticipantRecord> {
        let members = self.members.read().await;
        let mut by_participant: HashMap<_, ParticipantRecord> = HashMap::new();
        for record in members.values().filter_map(|m| m.record.as_ref()) {
            let keep = by_participant
                .get(&record.participant_id)
                .map_or(true, |existing| record.last_seen >= existing.last_seen);
            if keep {
                by_participant.insert(record.participant_id, record.clone());
            }
        }
        let mut roster: Vec<_> = by_participant.into_values().collect();
        roster.sort_by_key(|r| r.participant_id);
        roster
    }

    /// Evict connections silent for longer than `timeout`.
    pub async fn evict_silent(&self, timeout: Duration) -> Result<Vec<ConnectionId>, ProtocolError> {
        let (stale, had_presence) = {
            let mut members = self.members.write().await;
            let stale: Vec<ConnectionId> = members
                .iter()
                .filter(|(_, m)| m.last_heard.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            let mut had_presence = false;
            for id in &stale {
                if let Some(member) = members.remove(id) {
                    had_presence |= member.record.is_some();
                }
            }
            (stale, had_presence)
        };
        for id in &stale {
            self.send(Outbound::Evict(*id));
        }
        if had_presence {
            self.broadcast_presence().await?;
        }
        Ok(stale)
    }

    pub async fn connection_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        let members = self.members.read().await;
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            connections: members.len(),
            present: members.values().filter(|m| m.record.is_some()).count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn broadcast_presence(&self) -> Result<(), ProtocolError> {
        let bytes = ServerFrame::PresenceSync(self.snapshot().await).encode()?;
        self.send(Outbound::Frame {
            skip: None,
            bytes: Arc::new(bytes),
        });
        Ok(())
    }

    fn send(&self, outbound: Outbound) -> usize {
        let count = self.sender.send(Arc::new(outbound)).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }
}

/// Maps session ids to relay rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<SessionId, Arc<RelayRoom>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a session.
    pub async fn get_or_create(&self, session_id: SessionId) -> Arc<RelayRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&session_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&session_id) {
            return room.clone();
        }
        let room = Arc::new(RelayRoom::new(self.default_capacity));
        rooms.insert(session_id, room.clone());
        room
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<RelayRoom>> {
        self.rooms.read().await.get(session_id).cloned()
    }

    /// Remove a room with no connections left.
    pub async fn remove_if_empty(&self, session_id: &SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_id) {
            if room.connection_count().await == 0 {
                rooms.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn rooms(&self) -> Vec<(SessionId, Arc<RelayRoom>)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (*id, room.clone()))
            .collect()
    }
}

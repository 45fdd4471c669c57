//! Ephemeral signals: typing indicators, cursors and chat.
//!
//! None of these are persisted. Typing and cursor state is superseded by the
//! next message from the same sender; chat is append-only, deduplicated by
//! the id the sender generated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SignalConfig;
use crate::debounce::{earliest, DebouncedAction};
use crate::protocol::{ChannelEvent, ChatMessage, CursorPosition, ParticipantColor, ParticipantId};

/// Minimum spacing of outgoing cursor broadcasts (30 fps).
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCursor {
    pub position: CursorPosition,
    pub color: ParticipantColor,
}

/// Chat history ordered by `(ts, id)`.
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    seen: HashSet<Uuid>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in display order. Returns false for a duplicate id.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        let key = (message.ts, message.id);
        let at = self.messages.partition_point(|m| (m.ts, m.id) <= key);
        self.messages.insert(at, message);
        true
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Trailing-edge throttle: the first move goes out at once, later moves
/// inside the interval collapse into one send at the interval's end.
#[derive(Debug)]
struct CursorThrottle {
    last_sent: Option<Instant>,
    pending: Option<CursorPosition>,
}

impl CursorThrottle {
    fn due(&self) -> Option<Instant> {
        match (self.pending, self.last_sent) {
            (Some(_), Some(at)) => Some(at + CURSOR_INTERVAL),
            (Some(_), None) => Some(Instant::now()),
            _ => None,
        }
    }
}

pub struct EphemeralSignals {
    local_id: ParticipantId,
    color: ParticipantColor,

    typing_idle: DebouncedAction,
    local_typing: bool,
    typing_refresh: Duration,
    /// When `typing=true` last went out.
    typing_sent: Option<Instant>,
    remote_typing: HashMap<ParticipantId, Instant>,
    remote_ttl: Duration,

    cursor: CursorThrottle,
    cursors: BTreeMap<ParticipantId, RemoteCursor>,

    chat: ChatLog,
    stopped: bool,
}

impl EphemeralSignals {
    pub fn new(local_id: ParticipantId, config: &SignalConfig) -> Self {
        Self {
            local_id,
            color: ParticipantColor::from_id(local_id),
            typing_idle: DebouncedAction::new(config.typing_idle()),
            local_typing: false,
            typing_refresh: config.typing_refresh(),
            typing_sent: None,
            remote_typing: HashMap::new(),
            remote_ttl: config.remote_typing_ttl(),
            cursor: CursorThrottle {
                last_sent: None,
                pending: None,
            },
            cursors: BTreeMap::new(),
            chat: ChatLog::new(),
            stopped: false,
        }
    }

    // ── typing ─────────────────────────────────────────────────────

    /// A local keystroke. Returns `typing=true` on the idle→typing edge, and
    /// again once per refresh interval while typing continues so receivers'
    /// flags do not expire.
    pub fn on_local_edit(&mut self, now: Instant) -> Option<ChannelEvent> {
        if self.stopped {
            return None;
        }
        self.typing_idle.trigger(now);
        let refresh_due = self
            .typing_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.typing_refresh);
        if self.local_typing && !refresh_due {
            return None;
        }
        self.local_typing = true;
        self.typing_sent = Some(now);
        Some(ChannelEvent::Typing {
            is_typing: true,
            sender_id: self.local_id,
        })
    }

    /// Returns `typing=false` once the idle window has passed.
    pub fn poll_typing(&mut self, now: Instant) -> Option<ChannelEvent> {
        if !self.typing_idle.fire(now) || !self.local_typing {
            return None;
        }
        self.local_typing = false;
        self.typing_sent = None;
        Some(ChannelEvent::Typing {
            is_typing: false,
            sender_id: self.local_id,
        })
    }

    pub fn is_typing(&self) -> bool {
        self.local_typing
    }

    /// Apply a remote typing signal. Returns the sender's new state when it
    /// changed.
    pub fn apply_typing(&mut self, sender: ParticipantId, is_typing: bool, now: Instant) -> Option<bool> {
        if sender == self.local_id || self.stopped {
            return None;
        }
        if is_typing {
            let fresh = self.remote_typing.insert(sender, now + self.remote_ttl).is_none();
            fresh.then_some(true)
        } else {
            self.remote_typing.remove(&sender).map(|_| false)
        }
    }

    /// Drop remote typing flags whose refresh never came.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<ParticipantId> {
        let mut expired: Vec<_> = self
            .remote_typing
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in &expired {
            self.remote_typing.remove(id);
        }
        expired
    }

    /// Remote participants currently typing.
    pub fn typing(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.remote_typing.keys().copied().collect();
        ids.sort();
        ids
    }

    // ── cursor ─────────────────────────────────────────────────────

    pub fn move_cursor(&mut self, position: CursorPosition, now: Instant) -> Option<ChannelEvent> {
        if self.stopped {
            return None;
        }
        match self.cursor.last_sent {
            Some(at) if now < at + CURSOR_INTERVAL => {
                self.cursor.pending = Some(position);
                None
            }
            _ => {
                self.cursor.pending = None;
                self.cursor.last_sent = Some(now);
                Some(self.cursor_event(position))
            }
        }
    }

    /// Flush a throttled cursor move whose interval has elapsed.
    pub fn poll_cursor(&mut self, now: Instant) -> Option<ChannelEvent> {
        let due = self.cursor.due()?;
        if now < due {
            return None;
        }
        let position = self.cursor.pending.take()?;
        self.cursor.last_sent = Some(now);
        Some(self.cursor_event(position))
    }

    fn cursor_event(&self, position: CursorPosition) -> ChannelEvent {
        ChannelEvent::CursorMove {
            position,
            color: self.color,
            sender_id: self.local_id,
        }
    }

    pub fn apply_cursor(&mut self, sender: ParticipantId, position: CursorPosition, color: ParticipantColor) -> bool {
        if sender == self.local_id || self.stopped {
            return false;
        }
        let cursor = RemoteCursor { position, color };
        self.cursors.insert(sender, cursor) != Some(cursor)
    }

    pub fn cursors(&self) -> &BTreeMap<ParticipantId, RemoteCursor> {
        &self.cursors
    }

    // ── chat ───────────────────────────────────────────────────────

    /// Append locally and return the broadcast. Blank text is ignored.
    pub fn send_chat(&mut self, text: &str, ts: u64) -> Option<(ChatMessage, ChannelEvent)> {
        let text = text.trim();
        if self.stopped || text.is_empty() {
            return None;
        }
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: self.local_id,
            text: text.to_string(),
            ts,
        };
        self.chat.insert(message.clone());
        Some((message.clone(), ChannelEvent::ChatMessage(message)))
    }

    /// Returns true when the message is new.
    pub fn apply_chat(&mut self, message: ChatMessage) -> bool {
        if message.sender_id == self.local_id || self.stopped {
            return false;
        }
        self.chat.insert(message)
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    // ── lifecycle ──────────────────────────────────────────────────

    /// Drop everything held for a participant who left.
    pub fn forget(&mut self, participant: &ParticipantId) -> bool {
        let was_typing = self.remote_typing.remove(participant).is_some();
        self.cursors.remove(participant);
        was_typing
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        earliest([
            self.typing_idle.deadline(),
            self.cursor.due(),
            self.remote_typing.values().min().copied(),
        ])
    }

    /// Cancel every timer. Later calls are no-ops; chat history is kept.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.typing_idle.cancel();
        self.local_typing = false;
        self.typing_sent = None;
        self.cursor.pending = None;
        self.remote_typing.clear();
        self.cursors.clear();
    }
}

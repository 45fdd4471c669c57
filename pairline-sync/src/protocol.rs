//! Wire protocol for the session channel.
//!
//! Two layers travel over the channel:
//!
//! ```text
//! ClientFrame ──► relay            relay ──► ServerFrame
//!   Subscribe { session_id }         Subscribed { connection_id }
//!   Publish(Envelope)                PresenceSync(Vec<ParticipantRecord>)
//!   Ping                             Event(Envelope)
//!                                    Pong
//! ```
//!
//! An [`Envelope`] carries one [`ChannelEvent`], the tagged union of every
//! application message. `Join`/`Leave` envelopes are consumed by the relay to
//! maintain its presence map; every other event is fanned out to the other
//! members of the session.
//!
//! Frames are bincode-encoded (serde mode, standard config).

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

use crate::document::Language;

pub type SessionId = Uuid;
pub type ParticipantId = Uuid;
pub type ConnectionId = Uuid;

/// Milliseconds since the Unix epoch, used for every wire timestamp.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Participant identity
// ───────────────────────────────────────────────────────────────────

/// Display color for a participant (cursor decorations, avatars, tiles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ParticipantColor {
    /// Stable, vivid color derived from a participant id.
    pub fn from_id(id: ParticipantId) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// CSS hex notation, e.g. `#3b82f6`.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// One member of the live roster.
///
/// `name` and `avatar_url` are enrichment data: a record may be announced
/// before the profile lookup has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub participant_id: ParticipantId,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub color: ParticipantColor,
    pub in_call: bool,
    pub typing: bool,
    /// Last time anything was heard from this participant (ms since epoch).
    pub last_seen: u64,
}

impl ParticipantRecord {
    pub fn new(participant_id: ParticipantId, name: Option<String>) -> Self {
        Self {
            participant_id,
            name,
            avatar_url: None,
            color: ParticipantColor::from_id(participant_id),
            in_call: false,
            typing: false,
            last_seen: now_millis(),
        }
    }

    /// Whether profile enrichment is still missing.
    pub fn needs_enrichment(&self) -> bool {
        self.name.is_none() || self.avatar_url.is_none()
    }

    /// Name to show in the UI.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("Guest-{}", &self.participant_id.to_string()[..8]),
        }
    }

    /// Equality on the announced fields, ignoring `last_seen`.
    pub fn same_announcement(&self, other: &ParticipantRecord) -> bool {
        self.participant_id == other.participant_id
            && self.name == other.name
            && self.avatar_url == other.avatar_url
            && self.color == other.color
            && self.in_call == other.in_call
            && self.typing == other.typing
    }
}

// ───────────────────────────────────────────────────────────────────
// Application events
// ───────────────────────────────────────────────────────────────────

/// Caret position inside the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// A chat line. `id` is generated by the sender and is the dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: ParticipantId,
    pub text: String,
    pub ts: u64,
}

/// Media negotiation payloads relayed between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

/// Every message that travels on a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// Presence announce (also used to republish an updated record).
    Join(ParticipantRecord),
    /// Clean presence departure.
    Leave { sender_id: ParticipantId },
    CodeChange {
        text: String,
        language: Language,
        sender_id: ParticipantId,
        ts: u64,
    },
    LanguageChange {
        language: Language,
        template: String,
        sender_id: ParticipantId,
        ts: u64,
    },
    CursorMove {
        position: CursorPosition,
        color: ParticipantColor,
        sender_id: ParticipantId,
    },
    Typing {
        is_typing: bool,
        sender_id: ParticipantId,
    },
    ChatMessage(ChatMessage),
    CallJoin { sender_id: ParticipantId },
    CallLeave { sender_id: ParticipantId },
    MediaSignal {
        sender_id: ParticipantId,
        target_id: ParticipantId,
        payload: SignalPayload,
    },
}

/// Subscription topics. Every [`ChannelEvent`] belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Presence,
    Code,
    Language,
    Cursor,
    Typing,
    Chat,
    Call,
    MediaSignal,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Presence,
        Topic::Code,
        Topic::Language,
        Topic::Cursor,
        Topic::Typing,
        Topic::Chat,
        Topic::Call,
        Topic::MediaSignal,
    ];
}

impl ChannelEvent {
    /// Participant that produced this event.
    pub fn sender_id(&self) -> ParticipantId {
        match self {
            ChannelEvent::Join(record) => record.participant_id,
            ChannelEvent::Leave { sender_id }
            | ChannelEvent::CodeChange { sender_id, .. }
            | ChannelEvent::LanguageChange { sender_id, .. }
            | ChannelEvent::CursorMove { sender_id, .. }
            | ChannelEvent::Typing { sender_id, .. }
            | ChannelEvent::CallJoin { sender_id }
            | ChannelEvent::CallLeave { sender_id }
            | ChannelEvent::MediaSignal { sender_id, .. } => *sender_id,
            ChannelEvent::ChatMessage(msg) => msg.sender_id,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            ChannelEvent::Join(_) | ChannelEvent::Leave { .. } => Topic::Presence,
            ChannelEvent::CodeChange { .. } => Topic::Code,
            ChannelEvent::LanguageChange { .. } => Topic::Language,
            ChannelEvent::CursorMove { .. } => Topic::Cursor,
            ChannelEvent::Typing { .. } => Topic::Typing,
            ChannelEvent::ChatMessage(_) => Topic::Chat,
            ChannelEvent::CallJoin { .. } | ChannelEvent::CallLeave { .. } => Topic::Call,
            ChannelEvent::MediaSignal { .. } => Topic::MediaSignal,
        }
    }
}

/// An event addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    pub event: ChannelEvent,
}

impl Envelope {
    pub fn new(session_id: SessionId, event: ChannelEvent) -> Self {
        Self { session_id, event }
    }
}

// ───────────────────────────────────────────────────────────────────
// Frames
// ───────────────────────────────────────────────────────────────────

/// Frames sent by a participant to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Subscribe { session_id: SessionId },
    Publish(Envelope),
    Ping,
}

/// Frames sent by the relay to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Subscribed { connection_id: ConnectionId },
    /// Full roster of the session after any presence change.
    PresenceSync(Vec<ParticipantRecord>),
    Event(Envelope),
    Pong,
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_change_frame_roundtrip() {
        let sender = Uuid::new_v4();
        let session = Uuid::new_v4();
        let frame = ClientFrame::Publish(Envelope::new(
            session,
            ChannelEvent::CodeChange {
                text: "print('hi')\n".into(),
                language: Language::Python,
                sender_id: sender,
                ts: 42,
            },
        ));

        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_presence_sync_roundtrip() {
        let records = vec![
            ParticipantRecord::new(Uuid::new_v4(), Some("Alice".into())),
            ParticipantRecord::new(Uuid::new_v4(), None),
        ];
        let frame = ServerFrame::PresenceSync(records.clone());
        match ServerFrame::decode(&frame.encode().unwrap()).unwrap() {
            ServerFrame::PresenceSync(decoded) => assert_eq!(decoded, records),
            other => panic!("expected PresenceSync, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerFrame::decode(&garbage).is_err());
        assert!(ClientFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_cursor_frame_is_compact() {
        let frame = ClientFrame::Publish(Envelope::new(
            Uuid::new_v4(),
            ChannelEvent::CursorMove {
                position: CursorPosition { line: 120, column: 14 },
                color: ParticipantColor::from_id(Uuid::new_v4()),
                sender_id: Uuid::new_v4(),
            },
        ));
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 64, "cursor frame is {} bytes", encoded.len());
    }

    #[test]
    fn test_sender_and_topic() {
        let id = Uuid::new_v4();
        let chat = ChannelEvent::ChatMessage(ChatMessage {
            id: Uuid::new_v4(),
            sender_id: id,
            text: "hello".into(),
            ts: 1,
        });
        assert_eq!(chat.sender_id(), id);
        assert_eq!(chat.topic(), Topic::Chat);

        let join = ChannelEvent::Join(ParticipantRecord::new(id, None));
        assert_eq!(join.sender_id(), id);
        assert_eq!(join.topic(), Topic::Presence);

        let signal = ChannelEvent::MediaSignal {
            sender_id: id,
            target_id: Uuid::new_v4(),
            payload: SignalPayload::Offer { sdp: "v=0".into() },
        };
        assert_eq!(signal.topic(), Topic::MediaSignal);
        assert_eq!(signal.sender_id(), id);
    }

    #[test]
    fn test_color_is_stable_per_id() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(ParticipantColor::from_id(id), ParticipantColor::from_id(id));
        let hex = ParticipantColor::from_id(id).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_enrichment_and_display_name() {
        let id = Uuid::new_v4();
        let mut record = ParticipantRecord::new(id, None);
        assert!(record.needs_enrichment());
        assert!(record.display_name().starts_with("Guest-"));

        record.name = Some("Bob".into());
        record.avatar_url = Some("https://cdn.example/bob.png".into());
        assert!(!record.needs_enrichment());
        assert_eq!(record.display_name(), "Bob");
    }

    #[test]
    fn test_same_announcement_ignores_last_seen() {
        let mut a = ParticipantRecord::new(Uuid::new_v4(), Some("A".into()));
        let mut b = a.clone();
        b.last_seen += 5_000;
        assert!(a.same_announcement(&b));
        a.in_call = true;
        assert!(!a.same_announcement(&b));
    }
}

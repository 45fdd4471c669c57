//! # pairline-sync: live coding session sync core
//!
//! Keeps a small group of participants in one shared session: a single
//! editable document, a live roster, ephemeral signals (typing, cursors,
//! chat) and an optional audio/video call.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket / hub   ┌──────────────┐
//! │ SessionCore  │ ◄─────────────────► │ RelayServer  │
//! │ (per user)   │    bincode frames   │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ├── PresenceTracker          ┌───────┴───────┐
//!        ├── DocumentSyncEngine       │ RoomManager   │
//!        ├── EphemeralSignals         │ (fan-out +    │
//!        └── MediaSessionManager      │  presence)    │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: channel events and relay frames
//! - [`transport`]: one channel subscription with heartbeat and retry
//! - [`presence`]: roster diffing and self-announcement
//! - [`document`]: last-write-wins document with debounced saves
//! - [`signals`]: typing, cursors and chat
//! - [`media`]: call state machine and track registry
//! - [`policy`]: reconciliation rules shared by every component
//! - [`session`]: the single-task core tying it all together
//! - [`server`] / [`broadcast`]: relay side
//! - [`store`]: session API, RocksDB and in-memory adapters

pub mod broadcast;
pub mod config;
pub mod debounce;
pub mod document;
pub mod error;
pub mod media;
pub mod policy;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod signals;
pub mod store;
pub mod transport;

pub use broadcast::{RelayRoom, RoomManager, RoomStats};
pub use config::{DocumentConfig, MediaConfig, SignalConfig, SyncConfig, TransportConfig};
pub use document::{DocumentState, DocumentSyncEngine, Language, RemoteApply};
pub use error::{ConfigError, MediaError, StoreError, SyncError, TransportError};
pub use media::{CallState, MediaBackend, MediaSessionManager, SourceKind, SyntheticBackend, SyntheticSfu, Tile};
pub use policy::ErrorClass;
pub use presence::{PresencePhase, PresenceTracker, RosterChange};
pub use protocol::{
    ChannelEvent, ChatMessage, ClientFrame, CursorPosition, Envelope, ParticipantId, ParticipantRecord,
    ProtocolError, ServerFrame, SessionId,
};
pub use server::{RelayConfig, RelayServer};
pub use session::{open, JoinRequest, SessionEvent, SessionHandle, SessionServices, SessionSnapshot};
pub use signals::{ChatLog, EphemeralSignals};
pub use store::{HttpSessionApi, MemoryStore, RocksSessionStore, SessionStore};
pub use transport::{ChannelTransport, ConnectionState, HubConnector, LocalHub, WsConnector};

//! Error taxonomy for the synchronization core.
//!
//! Every error here is scoped to the component that raised it. None of them
//! is fatal to the process: transport errors are recovered by the reconnect
//! cycle, media errors abort the call attempt, persistence errors are logged
//! and superseded by the next save.

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Channel transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the channel")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Media session errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no capture device available for {0}")]
    DeviceUnavailable(String),
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
    #[error("media transport lost: {0}")]
    TransportLost(String),
    #[error("no published {kind} track for participant {participant}")]
    NotPublished { participant: Uuid, kind: String },
    #[error("could not obtain media credentials: {0}")]
    Credentials(String),
}

/// Errors from the external storage / profile / credential collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not supported by this store: {0}")]
    Unsupported(&'static str),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level error for session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session has been left")]
    SessionClosed,
}

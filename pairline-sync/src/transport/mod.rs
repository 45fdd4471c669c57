//! Channel transport: one subscription to a session channel.
//!
//! ```text
//!              connect()                 Subscribed
//! Disconnected ─────────► Connecting ───────────────► Connected
//!      ▲                                                  │
//!      │        link closed / heartbeat timeout           │
//!      └──────────────────────────────────────────────────┘
//!      │
//!      └─ after reconnect_delay: RetryDue → resubscribe()
//!         (gives up after max_reconnect_attempts failures)
//! ```
//!
//! The transport is owned by the session task and driven through
//! [`ChannelTransport::recv`], which multiplexes inbound frames with the
//! heartbeat and retry timers.

pub mod hub;
pub mod ws;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::TransportConfig;
use crate::debounce::{earliest, sleep_until_opt};
use crate::error::TransportError;
use crate::protocol::{
    ChannelEvent, ClientFrame, ConnectionId, Envelope, ParticipantRecord, ServerFrame, SessionId,
    Topic,
};

pub use hub::{HubConnector, LocalHub};
pub use ws::WsConnector;

pub(crate) const LINK_BUFFER: usize = 256;

/// A bidirectional frame pipe to the relay.
pub struct Link {
    pub outgoing: mpsc::Sender<ClientFrame>,
    pub incoming: mpsc::Receiver<ServerFrame>,
}

/// Opens links to a relay.
pub trait Connector: Send + Sync {
    fn open(&self, session_id: SessionId) -> BoxFuture<'_, Result<Link, TransportError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Full roster from the relay.
    Presence(Vec<ParticipantRecord>),
    Message(Envelope),
    /// The link went away. A retry has been scheduled unless the transport
    /// already gave up.
    Dropped(TransportError),
    /// The retry delay elapsed; call [`ChannelTransport::resubscribe`].
    RetryDue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectOutcome {
    Resumed,
    Retrying { attempt: u32, error: TransportError },
    GaveUp { attempts: u32 },
}

pub struct ChannelTransport {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    session_id: SessionId,
    link: Option<Link>,
    connection_id: Option<ConnectionId>,
    topics: HashSet<Topic>,
    state: watch::Sender<ConnectionState>,
    failures: u32,
    retry_due: Option<Instant>,
    gave_up: bool,
    last_heard: Instant,
    next_ping: Instant,
}

impl ChannelTransport {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig, session_id: SessionId) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let now = Instant::now();
        Self {
            connector,
            config,
            session_id,
            link: None,
            connection_id: None,
            topics: HashSet::new(),
            state,
            failures: 0,
            retry_due: None,
            gave_up: false,
            last_heard: now,
            next_ping: now,
        }
    }

    /// Open the link and subscribe to the session.
    ///
    /// On failure the first retry is already scheduled; the returned error is
    /// informational.
    pub async fn connect(&mut self) -> Result<watch::Receiver<ConnectionState>, TransportError> {
        self.failures = 0;
        self.gave_up = false;
        self.retry_due = None;
        if let Err(e) = self.establish().await {
            log::warn!("Initial connect to session {} failed: {e}", self.session_id);
            self.record_failure(e.clone());
            return Err(e);
        }
        Ok(self.watch())
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn subscribe(&mut self, topic: Topic) {
        self.topics.insert(topic);
    }

    pub fn subscribe_all(&mut self) {
        self.topics.extend(Topic::ALL);
    }

    pub fn unsubscribe_all(&mut self) {
        self.topics.clear();
    }

    pub async fn publish(&mut self, event: ChannelEvent) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        log::trace!("Publishing {:?} to {}", event.topic(), self.session_id);
        link.outgoing
            .send(ClientFrame::Publish(Envelope::new(self.session_id, event)))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Drop the link and stop retrying.
    pub fn disconnect(&mut self) {
        self.link = None;
        self.connection_id = None;
        self.retry_due = None;
        self.set_state(ConnectionState::Disconnected);
        log::info!("Disconnected from session {}", self.session_id);
    }

    /// User-requested retry, also after giving up.
    pub fn retry_now(&mut self) {
        if self.link.is_some() {
            return;
        }
        self.failures = 0;
        self.gave_up = false;
        self.retry_due = Some(Instant::now());
    }

    /// One full re-subscribe cycle: drop the old link, open a new one,
    /// subscribe again.
    pub async fn resubscribe(&mut self) -> ReconnectOutcome {
        self.retry_due = None;
        match self.establish().await {
            Ok(()) => {
                log::info!("Re-subscribed to session {}", self.session_id);
                ReconnectOutcome::Resumed
            }
            Err(e) => self.record_failure(e),
        }
    }

    /// Next inbound event. Cancel-safe.
    pub async fn recv(&mut self) -> TransportEvent {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                frame = recv_link(self.link.as_mut()) => {
                    match frame {
                        Some(frame) => {
                            self.last_heard = Instant::now();
                            if let Some(event) = self.on_frame(frame) {
                                return event;
                            }
                        }
                        None => return self.drop_link(TransportError::ConnectionClosed),
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if let Some(event) = self.on_timer(Instant::now()) {
                        return event;
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let heartbeat = self.link.as_ref().map(|_| {
            self.next_ping
                .min(self.last_heard + self.config.heartbeat_timeout())
        });
        earliest([self.retry_due, heartbeat])
    }

    fn on_frame(&mut self, frame: ServerFrame) -> Option<TransportEvent> {
        match frame {
            ServerFrame::PresenceSync(roster) => self
                .topics
                .contains(&Topic::Presence)
                .then_some(TransportEvent::Presence(roster)),
            ServerFrame::Event(envelope) => {
                if envelope.session_id != self.session_id {
                    log::debug!("Dropping envelope for foreign session {}", envelope.session_id);
                    return None;
                }
                self.topics
                    .contains(&envelope.event.topic())
                    .then_some(TransportEvent::Message(envelope))
            }
            ServerFrame::Pong => None,
            ServerFrame::Subscribed { .. } => {
                log::debug!("Ignoring duplicate Subscribed");
                None
            }
        }
    }

    fn on_timer(&mut self, now: Instant) -> Option<TransportEvent> {
        if let Some(due) = self.retry_due {
            if now >= due {
                self.retry_due = None;
                return Some(TransportEvent::RetryDue);
            }
        }
        let link = self.link.as_ref()?;
        if now >= self.last_heard + self.config.heartbeat_timeout() {
            log::warn!("No traffic from relay for {:?}", self.config.heartbeat_timeout());
            return Some(self.drop_link(TransportError::Timeout));
        }
        if now >= self.next_ping {
            if link.outgoing.try_send(ClientFrame::Ping).is_err() {
                log::debug!("Heartbeat skipped, outgoing buffer full");
            }
            self.next_ping = now + self.config.heartbeat_interval();
        }
        None
    }

    fn drop_link(&mut self, error: TransportError) -> TransportEvent {
        log::warn!("Lost link to session {}: {error}", self.session_id);
        self.link = None;
        self.connection_id = None;
        self.set_state(ConnectionState::Disconnected);
        if !self.gave_up {
            self.retry_due = Some(Instant::now() + self.config.reconnect_delay());
        }
        TransportEvent::Dropped(error)
    }

    fn record_failure(&mut self, error: TransportError) -> ReconnectOutcome {
        self.failures += 1;
        if self.failures >= self.config.max_reconnect_attempts {
            self.gave_up = true;
            self.retry_due = None;
            log::error!(
                "Giving up on session {} after {} attempts: {error}",
                self.session_id,
                self.failures
            );
            ReconnectOutcome::GaveUp {
                attempts: self.failures,
            }
        } else {
            self.retry_due = Some(Instant::now() + self.config.reconnect_delay());
            ReconnectOutcome::Retrying {
                attempt: self.failures,
                error,
            }
        }
    }

    async fn establish(&mut self) -> Result<(), TransportError> {
        self.link = None;
        self.connection_id = None;
        self.set_state(ConnectionState::Connecting);

        let handshake = tokio::time::timeout(self.config.connect_timeout(), self.handshake()).await;
        match handshake {
            Ok(Ok((link, connection_id))) => {
                let now = Instant::now();
                self.link = Some(link);
                self.connection_id = Some(connection_id);
                self.failures = 0;
                self.last_heard = now;
                self.next_ping = now + self.config.heartbeat_interval();
                self.set_state(ConnectionState::Connected);
                log::info!("Subscribed to session {} as {connection_id}", self.session_id);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn handshake(&self) -> Result<(Link, ConnectionId), TransportError> {
        let mut link = self.connector.open(self.session_id).await?;
        link.outgoing
            .send(ClientFrame::Subscribe {
                session_id: self.session_id,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        loop {
            match link.incoming.recv().await {
                Some(ServerFrame::Subscribed { connection_id }) => return Ok((link, connection_id)),
                Some(other) => log::trace!("Ignoring {other:?} before Subscribed"),
                None => return Err(TransportError::Handshake("relay closed before Subscribed".into())),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn recv_link(link: Option<&mut Link>) -> Option<ServerFrame> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

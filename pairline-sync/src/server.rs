//! WebSocket relay server backing the channel transport.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RelayRoom (session_id) ── presence map ── PresenceSync
//! Client B ──┘         │
//!                      └── broadcast ──► every other connection
//! ```
//!
//! The relay performs no conflict resolution. It keeps one room per session,
//! an authoritative presence map keyed by connection, and evicts connections
//! that stop sending heartbeats.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Outbound, RelayRoom, RoomManager};
use crate::protocol::{
    ChannelEvent, ClientFrame, ConnectionId, ProtocolError, ServerFrame, SessionId,
};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How often silent connections are swept
    pub sweep_interval_secs: u64,
    /// Silence after which a connection is evicted
    pub heartbeat_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            sweep_interval_secs: 15,
            heartbeat_timeout_secs: 45,
        }
    }
}

/// Per-connection relay state machine, shared by the WebSocket server and
/// the in-process hub.
pub struct RelayConnection {
    connection_id: ConnectionId,
    rooms: Arc<RoomManager>,
    session: Option<(SessionId, Arc<RelayRoom>)>,
}

impl RelayConnection {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            rooms,
            session: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    /// Handle one client frame.
    ///
    /// Returns the frames to send straight back to this connection and, on
    /// `Subscribe`, the room receiver the caller must start draining.
    pub async fn handle(
        &mut self,
        frame: ClientFrame,
    ) -> Result<(Vec<ServerFrame>, Option<broadcast::Receiver<Arc<Outbound>>>), ProtocolError> {
        match frame {
            ClientFrame::Subscribe { session_id } => {
                if self.session.is_some() {
                    return Err(ProtocolError::UnexpectedFrame("second Subscribe on one connection"));
                }
                let room = self.rooms.get_or_create(session_id).await;
                let rx = room.attach(self.connection_id).await;
                let roster = room.snapshot().await;
                self.session = Some((session_id, room));
                log::info!("Connection {} subscribed to session {session_id}", self.connection_id);
                Ok((
                    vec![
                        ServerFrame::Subscribed {
                            connection_id: self.connection_id,
                        },
                        ServerFrame::PresenceSync(roster),
                    ],
                    Some(rx),
                ))
            }

            ClientFrame::Publish(envelope) => {
                let Some((session_id, room)) = &self.session else {
                    return Err(ProtocolError::UnexpectedFrame("Publish before Subscribe"));
                };
                if envelope.session_id != *session_id {
                    log::warn!(
                        "Connection {} published to foreign session {}",
                        self.connection_id,
                        envelope.session_id
                    );
                    return Ok((Vec::new(), None));
                }
                room.touch(&self.connection_id).await;
                match envelope.event {
                    ChannelEvent::Join(record) => {
                        log::debug!("Presence: {} announced in {session_id}", record.display_name());
                        room.track(self.connection_id, record).await?;
                    }
                    ChannelEvent::Leave { sender_id } => {
                        log::debug!("Presence: {sender_id} left {session_id}");
                        room.untrack(&self.connection_id).await?;
                    }
                    _ => {
                        room.forward(self.connection_id, envelope)?;
                    }
                }
                Ok((Vec::new(), None))
            }

            ClientFrame::Ping => {
                if let Some((_, room)) = &self.session {
                    room.touch(&self.connection_id).await;
                }
                Ok((vec![ServerFrame::Pong], None))
            }
        }
    }

    /// Decide whether a room broadcast goes out on this connection.
    ///
    /// `Some(Ok(bytes))` to deliver, `Some(Err(()))` when this connection was
    /// evicted, `None` to skip.
    pub fn filter(&self, outbound: &Outbound) -> Option<Result<Arc<Vec<u8>>, ()>> {
        match outbound {
            Outbound::Frame { skip, bytes } => {
                if *skip == Some(self.connection_id) {
                    None
                } else {
                    Some(Ok(bytes.clone()))
                }
            }
            Outbound::Evict(id) if *id == self.connection_id => Some(Err(())),
            Outbound::Evict(_) => None,
        }
    }

    /// Leave the room (if any) and drop it once empty.
    pub async fn close(&mut self) {
        if let Some((session_id, room)) = self.session.take() {
            if let Err(e) = room.detach(&self.connection_id).await {
                log::warn!("Failed to announce departure of {}: {e}", self.connection_id);
            }
            if self.rooms.remove_if_empty(&session_id).await {
                log::info!("Room {session_id} removed (empty)");
            }
        }
    }
}

/// Wait on an optional room receiver.
pub(crate) async fn recv_room(
    rx: &mut Option<broadcast::Receiver<Arc<Outbound>>>,
) -> Result<Arc<Outbound>, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self { config, rooms }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start listening for WebSocket connections. Runs until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sweeper = tokio::spawn(Self::sweep_loop(
            self.rooms.clone(),
            Duration::from_secs(self.config.sweep_interval_secs),
            Duration::from_secs(self.config.heartbeat_timeout_secs),
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    async fn sweep_loop(rooms: Arc<RoomManager>, interval: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (session_id, room) in rooms.rooms().await {
                match room.evict_silent(timeout).await {
                    Ok(evicted) if !evicted.is_empty() => {
                        log::info!("Evicted {} silent connections from {session_id}", evicted.len());
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Sweep of {session_id} failed: {e}"),
                }
                rooms.remove_if_empty(&session_id).await;
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let mut conn = RelayConnection::new(rooms);
        let mut room_rx = None;

        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let frame = match ClientFrame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let (replies, rx) = conn.handle(frame).await?;
                                if rx.is_some() {
                                    room_rx = rx;
                                }
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                return Ok(());
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                return Ok(());
                            }
                            _ => {}
                        }
                    }

                    outbound = recv_room(&mut room_rx) => {
                        match outbound {
                            Ok(outbound) => match conn.filter(&outbound) {
                                Some(Ok(bytes)) => {
                                    ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                                }
                                Some(Err(())) => {
                                    log::info!("Evicting silent connection from {addr}");
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    return Ok(());
                                }
                                None => {}
                            },
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {} lagged by {n} frames", conn.connection_id());
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            }
        }
        .await;

        conn.close().await;
        outcome
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

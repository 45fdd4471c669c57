//! In-process relay.
//!
//! `LocalHub` runs the same [`RelayConnection`] logic as the WebSocket relay
//! server, but over channels. Frames are still pushed through the bincode
//! codec. Used by the test-suite and by the single-process demo.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};

use super::{Connector, Link, LINK_BUFFER};
use crate::broadcast::RoomManager;
use crate::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame, SessionId};
use crate::server::{recv_room, RelayConnection};

pub struct LocalHub {
    rooms: Arc<RoomManager>,
    offline: AtomicBool,
    generation: watch::Sender<u64>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            rooms: Arc::new(RoomManager::new(LINK_BUFFER)),
            offline: AtomicBool::new(false),
            generation,
        })
    }

    pub fn connector(self: &Arc<Self>) -> HubConnector {
        HubConnector { hub: self.clone() }
    }

    /// While offline, new links are refused.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Close every open link, as if the network dropped.
    pub fn sever_all(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[derive(Clone)]
pub struct HubConnector {
    hub: Arc<LocalHub>,
}

impl Connector for HubConnector {
    fn open(&self, _session_id: SessionId) -> BoxFuture<'_, Result<Link, TransportError>> {
        Box::pin(async move {
            if self.hub.offline.load(Ordering::SeqCst) {
                return Err(TransportError::Unreachable("local hub is offline".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
            let severed = self.hub.generation.subscribe();
            tokio::spawn(run_link(self.hub.rooms.clone(), out_rx, in_tx, severed));
            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

async fn run_link(
    rooms: Arc<RoomManager>,
    mut out_rx: mpsc::Receiver<ClientFrame>,
    in_tx: mpsc::Sender<ServerFrame>,
    mut severed: watch::Receiver<u64>,
) {
    let mut conn = RelayConnection::new(rooms);
    let mut room_rx = None;

    'link: loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let frame = match frame.encode().and_then(|bytes| ClientFrame::decode(&bytes)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Hub dropped frame: {e}");
                        continue;
                    }
                };
                match conn.handle(frame).await {
                    Ok((replies, rx)) => {
                        if rx.is_some() {
                            room_rx = rx;
                        }
                        for reply in replies {
                            if in_tx.send(reply).await.is_err() {
                                break 'link;
                            }
                        }
                    }
                    Err(e) => log::warn!("Hub rejected frame from {}: {e}", conn.connection_id()),
                }
            }

            outbound = recv_room(&mut room_rx) => {
                match outbound {
                    Ok(outbound) => match conn.filter(&outbound) {
                        Some(Ok(bytes)) => match ServerFrame::decode(&bytes) {
                            Ok(frame) => {
                                if in_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Hub produced undecodable frame: {e}"),
                        },
                        Some(Err(())) => break,
                        None => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Hub link {} lagged by {n} frames", conn.connection_id());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = severed.changed() => {
                log::debug!("Hub link {} severed", conn.connection_id());
                break;
            }
        }
    }

    conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChannelEvent, Envelope, ParticipantRecord};
    use uuid::Uuid;

    async fn subscribed(connector: &HubConnector, session: SessionId) -> Link {
        let mut link = connector.open(session).await.unwrap();
        link.outgoing
            .send(ClientFrame::Subscribe { session_id: session })
            .await
            .unwrap();
        assert!(matches!(
            link.incoming.recv().await,
            Some(ServerFrame::Subscribed { .. })
        ));
        assert_eq!(
            link.incoming.recv().await,
            Some(ServerFrame::PresenceSync(Vec::new()))
        );
        link
    }

    #[tokio::test]
    async fn test_hub_relays_between_links() {
        let hub = LocalHub::new();
        let connector = hub.connector();
        let session = Uuid::new_v4();
        let a = subscribed(&connector, session).await;
        let mut b = subscribed(&connector, session).await;

        let event = Envelope::new(session, ChannelEvent::CallJoin { sender_id: Uuid::new_v4() });
        a.outgoing.send(ClientFrame::Publish(event.clone())).await.unwrap();
        assert_eq!(b.incoming.recv().await, Some(ServerFrame::Event(event)));
    }

    #[tokio::test]
    async fn test_hub_presence_snapshot() {
        let hub = LocalHub::new();
        let connector = hub.connector();
        let session = Uuid::new_v4();
        let mut a = subscribed(&connector, session).await;

        let record = ParticipantRecord::new(Uuid::new_v4(), Some("A".into()));
        a.outgoing
            .send(ClientFrame::Publish(Envelope::new(session, ChannelEvent::Join(record.clone()))))
            .await
            .unwrap();
        match a.incoming.recv().await {
            Some(ServerFrame::PresenceSync(roster)) => {
                assert_eq!(roster.len(), 1);
                assert!(roster[0].same_announcement(&record));
            }
            other => panic!("expected PresenceSync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_refuses_links() {
        let hub = LocalHub::new();
        hub.set_offline(true);
        assert!(hub.connector().open(Uuid::new_v4()).await.is_err());
        hub.set_offline(false);
        assert!(hub.connector().open(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_closes_links() {
        let hub = LocalHub::new();
        let session = Uuid::new_v4();
        let mut link = subscribed(&hub.connector(), session).await;

        hub.sever_all();
        assert_eq!(link.incoming.recv().await, None);
        // Link task cleanup is asynchronous.
        for _ in 0..100 {
            if hub.rooms().room_count().await == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("room was not removed after sever");
    }
}

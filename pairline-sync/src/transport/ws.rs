//! WebSocket connector to a [`RelayServer`](crate::server::RelayServer).
//!
//! Each link spawns a writer task (outgoing channel → socket) and a reader
//! task (socket → incoming channel). Dropping the `Link` closes the outgoing
//! channel, which ends the writer and closes the socket.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, Link, LINK_BUFFER};
use crate::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame, SessionId};

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `url` is the relay base URL; the session id is appended as a path segment.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn session_url(&self, session_id: SessionId) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), session_id)
    }
}

impl Connector for WsConnector {
    fn open(&self, session_id: SessionId) -> BoxFuture<'_, Result<Link, TransportError>> {
        Box::pin(async move {
            let url = self.session_url(session_id);
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(LINK_BUFFER);

            // Writer task
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                            Ok(frame) => {
                                if in_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                log::debug!("Relay socket for session {session_id} closed");
            });

            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

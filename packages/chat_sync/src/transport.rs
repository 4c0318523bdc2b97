//! WebSocket transport over tokio-tungstenite.

use futures::{SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use crate::connection::{Transport, TransportEvent, TransportLink};
use crate::error::SyncError;

const CHANNEL_CAPACITY: usize = 256;

/// Opens a real WebSocket and bridges it onto a pair of channels: a writer
/// task drains outbound text, a reader task forwards inbound text and
/// reports the close.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(&self, url: &str) -> impl Future<Output = Result<TransportLink, SyncError>> + Send {
        let url = url.to_string();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(SyncError::from_tungstenite)?;
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

            // Writer: ends when every sender is dropped, then closes the socket.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                        warn!(error = %e, "websocket write failed");
                        break;
                    }
                }
                let _ = ws_write.close().await;
            });

            tokio::spawn(async move {
                let reason = loop {
                    match ws_read.next().await {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            if in_tx
                                .send(TransportEvent::Text(text.as_str().to_owned()))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            break frame.map(|f| f.reason.as_str().to_owned());
                        }
                        // tungstenite answers pings; binary is not part of the protocol.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    }
                };
                debug!(reason = ?reason, "websocket closed");
                let _ = in_tx.send(TransportEvent::Closed { reason }).await;
            });

            Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

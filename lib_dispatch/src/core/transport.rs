//! # Transport Seam
//!
//! The connection manager never touches a socket directly. A [`Connector`]
//! opens a [`TransportHandle`]: a pair of text channels plus a shared `open`
//! flag that the transport clears as soon as it notices the peer is gone.
//! The manager reads the flag in its health check to catch disconnects that
//! never surfaced as a closed channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::models::identity::Identity;

/// One open bidirectional channel to the backend.
pub struct TransportHandle {
    /// Text frames to send.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Text frames received. Closes when the transport goes away.
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Transport-level liveness as seen by the socket pumps.
    pub open: Arc<AtomicBool>,
    /// Cancelling this tears the transport down.
    pub close: CancellationToken,
}

impl TransportHandle {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Opens transports. Implemented by the WebSocket client and by test doubles.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, identity: &Identity) -> Result<TransportHandle, TransportError>;
}

#[cfg(feature = "ws")]
pub use ws::WsConnector;

#[cfg(feature = "ws")]
mod ws {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

    /// JSON-over-WebSocket transport.
    pub struct WsConnector {
        url: String,
    }

    impl WsConnector {
        pub fn new(url: impl Into<String>) -> Self {
            Self { url: url.into() }
        }
    }

    #[async_trait]
    impl Connector for WsConnector {
        async fn open(&self, identity: &Identity) -> Result<TransportHandle, TransportError> {
            tracing::info!(url = %self.url, %identity, "opening dispatch socket");
            let (ws_stream, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut write, mut read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
            let open = Arc::new(AtomicBool::new(true));
            let close = CancellationToken::new();

            let writer_open = open.clone();
            let writer_close = close.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_close.cancelled() => {
                            let _ = write.close().await;
                            break;
                        }
                        frame = out_rx.recv() => match frame {
                            Some(text) => {
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    tracing::error!(error = %e, "socket write failed");
                                    break;
                                }
                            }
                            None => {
                                let _ = write.close().await;
                                break;
                            }
                        }
                    }
                }
                writer_open.store(false, Ordering::SeqCst);
            });

            let reader_open = open.clone();
            let reader_close = close.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = reader_close.cancelled() => break,
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(text.to_string()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::warn!(?frame, "socket closed by remote host");
                                break;
                            }
                            // Protocol-level ping/pong is answered by tungstenite.
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::error!(error = %e, "socket read failed");
                                break;
                            }
                            None => {
                                tracing::warn!("socket stream ended");
                                break;
                            }
                        }
                    }
                }
                reader_open.store(false, Ordering::SeqCst);
            });

            Ok(TransportHandle {
                outbound: out_tx,
                inbound: in_rx,
                open,
                close,
            })
        }
    }
}

//! Vendor socket transport.
//!
//! A dialed vendor socket is exposed as a pair of channels: frames pushed
//! into `outgoing` are written to the socket in order by a writer task, and
//! text frames read from the socket arrive on `incoming`. When the socket
//! ends, `incoming` yields `None`.

use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};

/// Depth of the per-connection write queue.
pub const OUTGOING_QUEUE_DEPTH: usize = 256;

/// Depth of the per-connection read queue.
pub const INCOMING_QUEUE_DEPTH: usize = 256;

/// A frame queued for a vendor socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Send a close frame and stop writing.
    Close,
}

/// The two halves of an open vendor socket.
#[derive(Debug)]
pub struct VendorChannel {
    pub outgoing: mpsc::Sender<VendorMessage>,
    pub incoming: mpsc::Receiver<String>,
}

/// The far side of an in-memory [`VendorChannel`], used to stand in for a
/// vendor.
#[derive(Debug)]
pub struct RemoteEnd {
    /// Everything the local side sent, in order.
    pub sent: mpsc::Receiver<VendorMessage>,
    /// Push vendor messages to the local side. Dropping it ends the stream.
    pub reply: mpsc::Sender<String>,
}

impl VendorChannel {
    /// Creates a connected in-memory channel pair.
    pub fn in_memory() -> (VendorChannel, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
        (
            VendorChannel {
                outgoing: out_tx,
                incoming: in_rx,
            },
            RemoteEnd {
                sent: out_rx,
                reply: in_tx,
            },
        )
    }
}

/// Opens vendor sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `url`, failing if the open handshake does not complete
    /// within `handshake_timeout`.
    async fn dial(&self, url: &str, handshake_timeout: Duration)
        -> Result<VendorChannel, VoiceError>;
}

/// Dials real vendor sockets with `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsDialer;

fn map_handshake_error(err: tungstenite::Error) -> VoiceError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                VoiceError::Auth(format!("vendor rejected signature: HTTP {}", status))
            } else {
                VoiceError::Connect(format!("vendor handshake failed: HTTP {}", status))
            }
        }
        other => VoiceError::Connect(other.to_string()),
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        url: &str,
        handshake_timeout: Duration,
    ) -> Result<VendorChannel, VoiceError> {
        let (stream, _response) =
            tokio::time::timeout(handshake_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    VoiceError::Connect(format!(
                        "handshake timed out after {}ms",
                        handshake_timeout.as_millis()
                    ))
                })?
                .map_err(map_handshake_error)?;

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<VendorMessage>(OUTGOING_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<String>(INCOMING_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let frame = match message {
                    VendorMessage::Text(text) => Message::Text(text.into()),
                    VendorMessage::Binary(bytes) => Message::Binary(bytes.into()),
                    VendorMessage::Close => break,
                };
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!("vendor socket write failed: {}", e);
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(reason)) => {
                        tracing::debug!(?reason, "vendor closed socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("vendor socket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(VendorChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pair_routes_both_directions() {
        let (mut local, mut remote) = VendorChannel::in_memory();

        local
            .outgoing
            .send(VendorMessage::Text("hello".to_string()))
            .await
            .unwrap();
        assert_eq!(
            remote.sent.recv().await,
            Some(VendorMessage::Text("hello".to_string()))
        );

        remote.reply.send("world".to_string()).await.unwrap();
        assert_eq!(local.incoming.recv().await.as_deref(), Some("world"));

        drop(remote);
        assert_eq!(local.incoming.recv().await, None);
    }

    #[tokio::test]
    async fn dial_to_closed_port_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsDialer
            .dial(&format!("ws://{}/", addr), Duration::from_secs(2))
            .await;
        match result {
            Err(VoiceError::Connect(_)) => {}
            other => panic!("Expected Connect error, got {:?}", other.map(|_| ())),
        }
    }
}

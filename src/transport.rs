//! Transport contracts
//!
//! Sessions only see batches of envelopes. Duplex transports are split into
//! a [`BatchReader`] and a [`BatchWriter`] so the ingestion and delivery loops
//! can own one half each. Poll transports hand the session one [`Responder`]
//! per inbound HTTP request.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;

use crate::bayeux::Message;
use crate::protocol::{self, Envelope, ProtocolError};

/// Receiving half of a duplex transport
#[async_trait]
pub trait BatchReader: Send {
    /// Wait for the next frame and decode it
    async fn receive_batch(&mut self) -> Result<Vec<Envelope>, TransportError>;
}

/// Sending half of a duplex transport
#[async_trait]
pub trait BatchWriter: Send {
    /// Write messages as a single frame
    async fn send_batch(&mut self, batch: &[Message]) -> Result<(), TransportError>;

    /// Release the transport
    async fn close(&mut self) {}
}

/// One-shot reply slot for a single poll request
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Vec<u8>>,
}

impl Responder {
    /// Create a responder and the receiver the HTTP request waits on
    pub fn new() -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Answer the request with a frame
    pub fn respond(self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Abandoned)
    }

    /// Whether the request has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the request has gone away
    pub async fn closed(&mut self) {
        self.tx.closed().await
    }
}

/// WebSocket receiving half
pub struct WebSocketReader {
    inner: SplitStream<WebSocket>,
}

/// WebSocket sending half
pub struct WebSocketWriter {
    inner: SplitSink<WebSocket, WsMessage>,
}

/// Split an upgraded socket into session transport halves
pub fn split_websocket(socket: WebSocket) -> (WebSocketReader, WebSocketWriter) {
    let (sink, stream) = socket.split();
    (
        WebSocketReader { inner: stream },
        WebSocketWriter { inner: sink },
    )
}

#[async_trait]
impl BatchReader for WebSocketReader {
    async fn receive_batch(&mut self) -> Result<Vec<Envelope>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(protocol::decode_batch(text.as_str().as_bytes())?);
                }
                Some(Ok(WsMessage::Binary(data))) => return Ok(protocol::decode_batch(&data)?),
                Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
                // Ping/pong are answered by the socket itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Socket(e)),
            }
        }
    }
}

#[async_trait]
impl BatchWriter for WebSocketWriter {
    async fn send_batch(&mut self, batch: &[Message]) -> Result<(), TransportError> {
        let frame = protocol::encode_batch(batch)?;
        self.inner
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(TransportError::Socket)
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("poll request abandoned")]
    Abandoned,
    #[error("socket error: {0}")]
    Socket(axum::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

//! WebSocket Transport Layer
//!
//! Single responsibility: open a connection and exchange text frames.
//! No knowledge of envelopes, queueing, or reconnection.
//!
//! The traits form the seam between the connection manager and the wire:
//! production code uses [`WsConnector`] over tokio-tungstenite, tests supply
//! channel-backed fakes.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::ChannelError;

type WsSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens transport connections. The manager holds exactly one connector and
/// calls it once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, ChannelError>;
}

/// An established full-duplex connection, split once into its two halves for
/// concurrent send/receive.
pub trait Transport: Send {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}

/// Send half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), ChannelError>;
    async fn close(&mut self);
}

/// Receive half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound text frame. `None` when the connection is closed.
    async fn next(&mut self) -> Option<Result<String, ChannelError>>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, ChannelError> {
        debug!(url = %url, "Connecting to WebSocket");

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Connection(format!("WebSocket connect failed: {}", e)))?;

        debug!(url = %url, "WebSocket connected");
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WsSocket,
}

impl Transport for WsTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.ws.split();
        (Box::new(WsFrameSink { sink }), Box::new(WsFrameStream { stream }))
    }
}

struct WsFrameSink {
    sink: SplitSink<WsSocket, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| ChannelError::Transmission(format!("Failed to send: {}", e)))
    }

    async fn close(&mut self) {
        // Initiates the close handshake; errors here mean the peer is
        // already gone, which is fine.
        let _ = self.sink.close().await;
    }
}

struct WsFrameStream {
    stream: SplitStream<WsSocket>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Server closed connection");
                    return None;
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is handled automatically by tungstenite
                    continue;
                }
                Some(Ok(_)) => continue, // Skip binary, pong, frame messages
                Some(Err(e)) => {
                    return Some(Err(ChannelError::Connection(format!(
                        "WebSocket error: {}",
                        e
                    ))))
                }
                None => return None, // Stream ended
            }
        }
    }
}

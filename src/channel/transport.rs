//! Socket transport abstraction.
//!
//! The channel only talks to these traits so it can be driven by a real
//! WebSocket (`WsConnector`) or by the scripted `MockConnector` in tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::error::TransportError;

/// Close code for a clean, caller-initiated close
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code used when the connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Inbound socket event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame
    Text(String),
    /// A transport error; a close follows
    Error(String),
    /// The peer closed the connection, with its close code if it sent one
    Closed { code: Option<u16> },
}

/// One open, message-oriented connection
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound event; `None` once the stream has ended
    async fn recv(&mut self) -> Option<SocketEvent>;

    /// Close with the given code. Best effort.
    async fn close(&mut self, code: u16);
}

/// Opens sockets
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError>;
}

/// Connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(status = %response.status(), "websocket handshake complete");

        Ok(Box::new(WsSocket {
            stream,
            failed: false,
        }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    failed: bool,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<SocketEvent> {
        if self.failed {
            return None;
        }

        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(SocketEvent::Text(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(SocketEvent::Text(text)),
                    Err(_) => debug!("dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    return Some(SocketEvent::Closed {
                        code: frame.map(|f| u16::from(f.code)),
                    })
                }
                // Pings are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(SocketEvent::Error(err.to_string()));
                }
            }
        }
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(err) = self.stream.close(Some(frame)).await {
            debug!(error = %err, "websocket close failed");
        }
    }
}

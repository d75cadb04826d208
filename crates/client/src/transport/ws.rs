//! WebSocket transport over tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use protocol::error::{ProtocolError, Result};

use super::{Transport, TransportEvent, TransportPair, TransportSink, TransportStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport: one WebSocket per connection attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<TransportPair> {
        let parsed = Url::parse(url)
            .map_err(|e| ProtocolError::ConnectionClosed(format!("invalid gateway url: {e}")))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ProtocolError::ConnectionClosed(format!(
                "invalid gateway url scheme: {}",
                parsed.scheme()
            )));
        }
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| ProtocolError::ConnectionClosed(format!("websocket connect: {e}")))?;
        let (sink, stream) = socket.split();
        Ok(TransportPair {
            sink: Box::new(WsSink { sink }),
            stream: Box::new(WsEventStream {
                stream,
                done: false,
            }),
        })
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ProtocolError::ConnectionClosed(format!("websocket send: {e}")))
    }

    async fn close(&mut self, code: Option<u16>, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: code.map(CloseCode::from).unwrap_or(CloseCode::Normal),
            reason: reason.to_string().into(),
        };
        // A close failure usually means the peer already went away.
        if let Err(err) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(%err, "websocket close failed");
        }
        Ok(())
    }
}

struct WsEventStream {
    stream: SplitStream<WsStream>,
    done: bool,
}

#[async_trait]
impl TransportStream for WsEventStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(TransportEvent::Text(text)),
                Some(Ok(Message::Close(frame))) => {
                    self.done = true;
                    let (code, reason) = match frame {
                        Some(frame) => (Some(frame.code.into()), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(TransportEvent::Closed { code, reason });
                }
                // Binary and control frames are not part of the protocol.
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(TransportEvent::Closed {
                        code: None,
                        reason: err.to_string(),
                    });
                }
                None => {
                    self.done = true;
                    return Some(TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                }
            }
        }
    }
}

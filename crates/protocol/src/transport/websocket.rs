//! WebSocket transport over tokio-tungstenite
//!
//! Single WebSocket per browser connection. The write half sits behind a
//! mutex held for exactly one frame; the read half goes to the dispatch loop.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Frame, Transport, TransportReceiver, TransportSender};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Connect to a `ws://` or `wss://` endpoint, e.g.
    /// `ws://localhost:9222/devtools/browser/<id>`.
    pub async fn connect(endpoint: &str) -> Result<Transport, TransportError> {
        let url = validate_endpoint(endpoint)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (sink, stream) = ws_stream.split();
        tracing::info!("WebSocket connected: {}", url);

        Ok(Transport::new(
            WsSender {
                sink: Mutex::new(sink),
            },
            WsReceiver { stream },
        ))
    }
}

fn validate_endpoint(endpoint: &str) -> Result<Url, TransportError> {
    let url = Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme `{scheme}`"),
        }),
    }
}

struct WsSender {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl TransportSender for WsSender {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        let mut sink = self.sink.lock().await;
        sink.send(message).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

struct WsReceiver {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReceiver for WsReceiver {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text))),
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes))),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(e.into())),
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
            }
        }
    }
}

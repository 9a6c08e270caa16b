use super::{Connection, Connector};
use crate::error::HarnessError;
use crate::protocol::{frame, Operation, Reply};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to a `ws://host:port[/path]` endpoint
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self> {
        if url.starts_with("wss://") {
            bail!("TLS WebSocket endpoints are not supported: {}", url);
        }
        if !url.starts_with("ws://") {
            bail!("WebSocket target must be a ws:// URL, got {:?}", url);
        }
        Ok(Self {
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, HarnessError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| HarnessError::Connect(e.to_string()))?;

        if let MaybeTlsStream::Plain(tcp) = stream.get_ref() {
            let _ = tcp.set_nodelay(true);
        }

        debug!(
            "WebSocket client connected to: {} (status {})",
            self.url,
            response.status()
        );
        Ok(Box::new(WebSocketConnection {
            stream: Some(stream),
        }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// WebSocket connection sending one text frame per operation
pub struct WebSocketConnection {
    stream: Option<WsStream>,
}

fn map_ws_error(e: tungstenite::Error) -> HarnessError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            HarnessError::ConnectionClosed
        }
        tungstenite::Error::Io(io) => HarnessError::Io(io),
        other => HarnessError::protocol(other.to_string(), true),
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, op: &Operation) -> Result<usize, HarnessError> {
        let stream = self.stream.as_mut().ok_or(HarnessError::ConnectionClosed)?;

        let body = frame::encode(op);
        let len = body.len();
        let message = match String::from_utf8(body) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        stream.send(message).await.map_err(map_ws_error)?;
        Ok(len)
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Reply, HarnessError> {
        let stream = self.stream.as_mut().ok_or(HarnessError::ConnectionClosed)?;

        let next_data_frame = async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text)),
                    Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                    Some(Ok(Message::Close(_))) | None => return Err(HarnessError::ConnectionClosed),
                    // Control frames are answered by tungstenite itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(map_ws_error(e)),
                }
            }
        };

        match timeout(deadline, next_data_frame).await {
            Ok(result) => result.map(|payload| Reply::Bulk(Some(payload))),
            Err(_) => Err(HarnessError::OperationTimeout(deadline)),
        }
    }

    async fn close(&mut self) -> Result<(), HarnessError> {
        if let Some(mut stream) = self.stream.take() {
            match stream.close(None).await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
                Err(e) => return Err(map_ws_error(e)),
            }
        }
        debug!("WebSocket connection closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}

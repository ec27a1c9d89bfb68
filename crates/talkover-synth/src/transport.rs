use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::TransportError;

/// One inbound frame from the duplex connection.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

/// Bidirectional message connection. Both dialects are written against this
/// so tests can substitute a scripted transport.
#[async_trait]
pub trait DuplexTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Next data frame. `None` means the remote closed the stream; control
    /// frames are absorbed internally.
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>>;

    /// Best-effort graceful close.
    async fn close(&mut self);
}

/// Opens duplex connections. The bearer credential is attached at connect
/// time and never stored on the connection itself.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        bearer: Option<&str>,
    ) -> Result<Box<dyn DuplexTransport>, TransportError>;
}

/// WebSocket-backed transport.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl DuplexTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.inner.send(Message::Binary(data)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(WireMessage::Text(text.to_string())))
                }
                Some(Ok(Message::Binary(data))) => return Some(Ok(WireMessage::Binary(data))),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Keepalives are answered by the library.
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by remote: {:?}", frame);
                    return None;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Connector for `wss://` / `ws://` synthesis endpoints.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        bearer: Option<&str>,
    ) -> Result<Box<dyn DuplexTransport>, TransportError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Connect(format!("Invalid bearer credential: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request).await?;
        debug!(status = ?response.status(), "WebSocket connected");
        Ok(Box::new(WsTransport { inner: stream }))
    }
}

//! Connection establishment for the chat socket
//!
//! The main loop only sees the `Connector`/`Transport` pair, so tests can
//! drive it with in-memory sockets.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TransportError;

/// An open, text-framed socket.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame, or `None` once the peer has closed the socket.
    /// Must be cancel-safe: the main loop polls it under a short timeout.
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;
}

/// Opens a fresh `Transport` on every call.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects to the portal's chat WebSocket, forwarding the session cookie.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: Url,
    cookie: Option<String>,
}

impl WsConnector {
    pub fn new(url: Url, cookie: Option<String>) -> Result<Self, TransportError> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url, cookie }),
            other => Err(TransportError::InvalidUrl(format!(
                "{} (scheme {} is not ws or wss)",
                url, other
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| TransportError::InvalidUrl(format!("unusable session cookie: {}", e)))?;
            request.headers_mut().insert("Cookie", value);
        }

        let (stream, response) = connect_async(request).await?;
        tracing::debug!(url = %self.url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.to_string())),
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(?frame, "server closed the socket");
                    return None;
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

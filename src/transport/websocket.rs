//! WebSocket transport over `tokio-tungstenite`

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Transport, TransportConnection, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code for a close frame without a status
const CLOSE_NO_STATUS: u16 = 1005;

/// Dials `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TransportConnection>, TransportError> {
        tracing::debug!(url = %url, "Dialing WebSocket endpoint");

        match connect_async(url.as_str()).await {
            Ok((stream, response)) => {
                tracing::debug!(status = response.status().as_u16(), "WebSocket upgrade accepted");
                Ok(Box::new(WebSocketConnection { stream }))
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                let message = response
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .filter(|body| !body.is_empty())
                    .unwrap_or_else(|| {
                        response
                            .status()
                            .canonical_reason()
                            .unwrap_or("upgrade rejected")
                            .to_string()
                    });
                Err(TransportError::Rejected { status, message })
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

struct WebSocketConnection {
    stream: WsStream,
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        loop {
            // tungstenite answers protocol-level pings itself while reading
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(TransportEvent::Text(text))),
                Ok(Message::Binary(bytes)) => {
                    return Some(match String::from_utf8(bytes) {
                        Ok(text) => Ok(TransportEvent::Text(text)),
                        Err(_) => Err(TransportError::Protocol(
                            "binary frame is not valid UTF-8".to_string(),
                        )),
                    });
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                    return Some(Ok(TransportEvent::Closed { code, reason }));
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}

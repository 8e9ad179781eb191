//! Streaming transport seam.
//!
//! [`FeedTransport`] opens sessions; [`FeedSession`] is one live session that
//! yields text frames. The WebSocket implementation answers pings itself so
//! callers only ever see data frames.

use crate::error::FeedError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

/// One live feed session.
#[async_trait]
pub trait FeedSession: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    /// Next text frame. Any error means the session is unusable.
    async fn receive(&mut self) -> Result<String, FeedError>;

    /// Send a normal-closure frame. Best effort.
    async fn close(&mut self, reason: &str);
}

/// Opens feed sessions.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn FeedSession>, FeedError>;
}

// =============================================================================
// WebSocket
// =============================================================================

pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn FeedSession>, FeedError> {
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(endpoint)).await;
        let (stream, response) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(FeedError::Connect {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(FeedError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    timeout: self.connect_timeout,
                })
            }
        };
        debug!(status = %response.status(), endpoint, "websocket handshake complete");
        Ok(Box::new(WsSession { stream }))
    }
}

struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Send(e.to_string()))
    }

    async fn receive(&mut self) -> Result<String, FeedError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(text),
                    Err(_) => warn!("dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    trace!("ping");
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| FeedError::Send(e.to_string()))?;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    return Err(FeedError::Closed(detail));
                }
                Some(Err(e)) => return Err(FeedError::Read(e.to_string())),
                None => return Err(FeedError::Closed("stream ended".to_string())),
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!(error = %e, "close frame not delivered");
        }
    }
}

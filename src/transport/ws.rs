//! WebSocket transport built on tokio-tungstenite

use super::{Connection, Connector, Frame, TransportError, CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Connector that opens `ws://` and `wss://` connections
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, response) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsConnection { stream, open: true }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    open: bool,
}

#[async_trait::async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, payload: &str) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| {
                self.open = false;
                TransportError::Send(e.to_string())
            })
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text))),
                Some(Ok(Message::Binary(bytes))) => {
                    warn!(len = bytes.len(), "Binary frame received on text connection");
                    return Some(Ok(Frame::Text(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    )));
                }
                Some(Ok(Message::Close(frame))) => {
                    self.open = false;
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    return Some(Ok(Frame::Closed { code, reason }));
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open = false;
                    return Some(Err(TransportError::Receive(e.to_string())));
                }
                None => {
                    self.open = false;
                    debug!(code = CLOSE_ABNORMAL, "WebSocket stream ended");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.open = false;
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_string()),
            }))
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{Handshake, Link, LinkReceiver, LinkSender, Transport};
use crate::error::{SyncError, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket link: the handshake goes in the query string, the token in an
/// `Authorization: Bearer` header. Payloads travel as text frames.
#[derive(Clone, Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, handshake: &Handshake) -> Result<Link, SyncError> {
        let url = handshake.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Config(format!("invalid endpoint {}: {e}", handshake.endpoint)))?;

        if let Some(token) = &handshake.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| SyncError::Auth("auth token contains invalid characters".into()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        debug!(endpoint = %handshake.endpoint, conversation = %handshake.conversation_id, "opening websocket");
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(from_tungstenite)?;
        info!(endpoint = %handshake.endpoint, "websocket connected");

        let (write, read) = ws_stream.split();
        Ok(Link {
            sender: Box::new(WsSender { write }),
            receiver: Box::new(WsReceiver { read }),
        })
    }
}

/// HTTP 401/403 during the upgrade means the credentials are bad; everything
/// else is a retryable transport failure.
fn from_tungstenite(err: tungstenite::Error) -> SyncError {
    match &err {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            SyncError::Auth(format!("server answered {}", response.status()))
        }
        _ => TransportError::ConnectFailed(err.to_string()).into(),
    }
}

struct WsSender {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl LinkSender for WsSender {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let msg = match String::from_utf8(payload) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        };
        self.write
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}

struct WsReceiver {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl LinkReceiver for WsReceiver {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().as_bytes().to_vec())),
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Closed(e.to_string()))),
            }
        }
    }
}

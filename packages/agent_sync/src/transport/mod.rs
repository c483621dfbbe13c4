//! The bidirectional link to the backend session.
//!
//! A [`Transport`] turns a [`Handshake`] into a [`Link`]: an owned sender half
//! and receiver half. The controller moves each half into its own task, so
//! neither half is shared.

mod memory;
mod websocket;

pub use memory::{MemoryServer, MemoryTransport};
pub use websocket::WebSocketTransport;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::{SyncError, TransportError};
use crate::event::EventId;
use crate::session::Session;

/// Query component set: everything but the RFC 3986 unreserved characters.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, Debug, PartialEq)]
pub struct TransportConfig {
    /// Upper bound on one handshake.
    pub connect_timeout: Duration,
    /// Outbound frames buffered per link.
    pub send_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_buffer: 64,
        }
    }
}

/// Parameters of one connection attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub endpoint: String,
    pub conversation_id: String,
    /// Resume cursor; the server replays events after it.
    pub latest_event_id: Option<EventId>,
    pub auth_token: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl Handshake {
    pub fn from_session(session: &Session) -> Self {
        Self {
            endpoint: session.server_endpoint.clone(),
            conversation_id: session.conversation_id.clone(),
            latest_event_id: session.last_event_id,
            auth_token: session.auth_token.clone(),
            params: session.extra_params.clone(),
        }
    }

    /// `conversation_id`, `latest_event_id` and the extra params, in that order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("conversation_id".to_string(), self.conversation_id.clone())];
        if let Some(id) = self.latest_event_id {
            pairs.push(("latest_event_id".to_string(), id.to_string()));
        }
        for (k, v) in &self.params {
            pairs.push((k.clone(), v.clone()));
        }
        pairs
    }

    /// Endpoint with the handshake query string appended.
    pub fn url(&self) -> String {
        let query = self
            .query_pairs()
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, QUERY),
                    utf8_percent_encode(v, QUERY)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.endpoint, sep, query)
    }
}

#[async_trait]
pub trait LinkSender: Send {
    /// Resolves once the frame has been written to the link.
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait LinkReceiver: Send {
    /// Next inbound frame. `None` once the peer closed the link cleanly.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

pub struct Link {
    pub sender: Box<dyn LinkSender>,
    pub receiver: Box<dyn LinkReceiver>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link. Rejected credentials must surface as
    /// [`SyncError::Auth`] so the controller stops retrying.
    async fn connect(&self, handshake: &Handshake) -> Result<Link, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_cursor_and_params() {
        let session = Session {
            last_event_id: Some(42),
            ..Session::new("wss://agent.example/socket", "c 1")
        }
        .with_param("mode", "read/only");

        let url = Handshake::from_session(&session).url();
        assert_eq!(
            url,
            "wss://agent.example/socket?conversation_id=c%201&latest_event_id=42&mode=read%2Fonly"
        );
    }

    #[test]
    fn url_appends_to_existing_query() {
        let session = Session::new("ws://localhost:3000/ws?v=2", "c1");
        let url = Handshake::from_session(&session).url();
        assert_eq!(url, "ws://localhost:3000/ws?v=2&conversation_id=c1");
    }

    #[test]
    fn url_keeps_unreserved_characters_literal() {
        let session = Session::new("wss://agent.example/socket", "conv-1_a.b~c")
            .with_param("client_version", "1.2.3");
        let url = Handshake::from_session(&session).url();
        assert_eq!(
            url,
            "wss://agent.example/socket?conversation_id=conv-1_a.b~c&client_version=1.2.3"
        );
    }
}

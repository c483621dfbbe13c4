//! Session identity and its durable persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::event::EventId;
use crate::store::KeyValueStore;

const LAST_SESSION_KEY: &str = "session:last";

/// Everything needed to (re)establish a link to one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub server_endpoint: String,
    pub conversation_id: String,
    /// Resume cursor: highest event id processed so far.
    #[serde(default)]
    pub last_event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(server_endpoint: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            server_endpoint: server_endpoint.into(),
            conversation_id: conversation_id.into(),
            last_event_id: None,
            auth_token: None,
            extra_params: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }

    /// Move the resume cursor forward. Returns false (and leaves the cursor)
    /// when `id` is not newer.
    pub fn advance_cursor(&mut self, id: EventId) -> bool {
        if self.last_event_id.is_some_and(|current| current >= id) {
            return false;
        }
        self.last_event_id = Some(id);
        self.updated_at = Utc::now();
        true
    }
}

fn session_key(conversation_id: &str) -> String {
    format!("session:{conversation_id}")
}

/// Reads and writes `Session` records in a [`KeyValueStore`].
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, conversation_id: &str) -> Result<Option<Session>, SyncError> {
        let Some(raw) = self.store.get(&session_key(conversation_id)).await? else {
            return Ok(None);
        };
        let session = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Store(format!("corrupt session record: {e}")))?;
        Ok(Some(session))
    }

    /// Persist the session and mark it as the most recent one.
    pub async fn save(&self, session: &Session) -> Result<(), SyncError> {
        let raw = serde_json::to_string(session)
            .map_err(|e| SyncError::Store(format!("failed to serialize session: {e}")))?;
        self.store
            .put(&session_key(&session.conversation_id), &raw)
            .await?;
        self.store
            .put(LAST_SESSION_KEY, &session.conversation_id)
            .await?;
        debug!(
            conversation = %session.conversation_id,
            cursor = ?session.last_event_id,
            "session saved"
        );
        Ok(())
    }

    pub async fn clear(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.store.delete(&session_key(conversation_id)).await?;
        if self.store.get(LAST_SESSION_KEY).await?.as_deref() == Some(conversation_id) {
            self.store.delete(LAST_SESSION_KEY).await?;
        }
        Ok(())
    }

    pub async fn last(&self) -> Result<Option<Session>, SyncError> {
        match self.store.get(LAST_SESSION_KEY).await? {
            Some(conversation_id) => self.load(&conversation_id).await,
            None => Ok(None),
        }
    }

    /// Stored session for `session.conversation_id`, if any, with its cursor
    /// carried over onto the caller's endpoint/token/params.
    pub async fn resume(&self, mut session: Session) -> Result<Session, SyncError> {
        if session.last_event_id.is_some() {
            return Ok(session);
        }
        if let Some(stored) = self.load(&session.conversation_id).await? {
            session.last_event_id = stored.last_event_id;
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn cursor_only_advances() {
        let mut session = Session::new("ws://localhost:3000", "c1");
        assert!(session.advance_cursor(5));
        assert!(!session.advance_cursor(5));
        assert!(!session.advance_cursor(3));
        assert!(session.advance_cursor(6));
        assert_eq!(session.last_event_id, Some(6));
    }

    #[tokio::test]
    async fn save_load_and_last() {
        let sessions = store();
        let mut session = Session::new("ws://localhost:3000", "c1")
            .with_auth_token("tok")
            .with_param("mode", "agent");
        session.advance_cursor(41);
        sessions.save(&session).await.unwrap();

        let loaded = sessions.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(sessions.last().await.unwrap().unwrap().conversation_id, "c1");
    }

    #[tokio::test]
    async fn clear_forgets_session_and_last_pointer() {
        let sessions = store();
        sessions.save(&Session::new("ws://h", "c1")).await.unwrap();
        sessions.clear("c1").await.unwrap();

        assert!(sessions.load("c1").await.unwrap().is_none());
        assert!(sessions.last().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_keeps_other_last_pointer() {
        let sessions = store();
        sessions.save(&Session::new("ws://h", "c1")).await.unwrap();
        sessions.save(&Session::new("ws://h", "c2")).await.unwrap();
        sessions.clear("c1").await.unwrap();
        assert_eq!(sessions.last().await.unwrap().unwrap().conversation_id, "c2");
    }

    #[tokio::test]
    async fn resume_picks_up_stored_cursor() {
        let sessions = store();
        let mut stored = Session::new("ws://old", "c1");
        stored.advance_cursor(17);
        sessions.save(&stored).await.unwrap();

        let resumed = sessions.resume(Session::new("ws://new", "c1")).await.unwrap();
        assert_eq!(resumed.last_event_id, Some(17));
        assert_eq!(resumed.server_endpoint, "ws://new");
    }
}

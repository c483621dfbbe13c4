//! Durable key-value storage for sessions and queue snapshots.
//!
//! Keys used by this crate:
//! - `session:<conversation_id>`: serialized [`Session`](crate::session::Session)
//! - `session:last`: conversation id of the most recent session
//! - `queue:<conversation_id>`: outgoing queue snapshot

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::SyncError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), SyncError>;
    async fn delete(&self, key: &str) -> Result<(), SyncError>;
}

/// Process-local store. Clones share contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("session:last").await.unwrap().is_none());

        store.put("session:last", "conv-1").await.unwrap();
        store.put("session:last", "conv-2").await.unwrap();
        assert_eq!(
            store.get("session:last").await.unwrap().as_deref(),
            Some("conv-2")
        );
        assert_eq!(store.len(), 1);

        store.delete("session:last").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clones_share_contents() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.put("queue:c1", "{}").await.unwrap();
        assert_eq!(other.get("queue:c1").await.unwrap().as_deref(), Some("{}"));
    }
}

//! Durable form of the outgoing queue, stored under `queue:<conversation_id>`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{DeliveryState, QueuedAction};
use crate::error::SyncError;
use crate::event::wire;
use crate::store::KeyValueStore;

#[derive(Debug, Serialize, Deserialize)]
struct StoredAction {
    sequence: u64,
    enqueued_at: DateTime<Utc>,
    /// Wire-encoded action event.
    payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredQueue {
    next_sequence: u64,
    entries: Vec<StoredAction>,
}

pub(crate) struct LoadedQueue {
    pub next_sequence: u64,
    pub entries: Vec<QueuedAction>,
    /// Entries discarded for exceeding the TTL.
    pub expired: usize,
}

pub(crate) fn key(conversation_id: &str) -> String {
    format!("queue:{conversation_id}")
}

pub(crate) async fn save(
    store: &dyn KeyValueStore,
    conversation_id: &str,
    next_sequence: u64,
    entries: impl Iterator<Item = &QueuedAction>,
) -> Result<(), SyncError> {
    let mut stored = Vec::new();
    for entry in entries {
        let bytes = wire::encode(&entry.action)?;
        stored.push(StoredAction {
            sequence: entry.sequence,
            enqueued_at: entry.enqueued_at,
            payload: serde_json::from_slice(&bytes)?,
        });
    }
    let raw = serde_json::to_string(&StoredQueue {
        next_sequence,
        entries: stored,
    })?;
    store.put(&key(conversation_id), &raw).await
}

/// Load a snapshot, dropping entries older than `ttl` (relative to `now`).
pub(crate) async fn load(
    store: &dyn KeyValueStore,
    conversation_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<LoadedQueue>, SyncError> {
    let Some(raw) = store.get(&key(conversation_id)).await? else {
        return Ok(None);
    };
    let stored: StoredQueue = serde_json::from_str(&raw)
        .map_err(|e| SyncError::Store(format!("corrupt queue snapshot: {e}")))?;

    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut entries = Vec::new();
    let mut expired = 0;
    let mut max_sequence = 0;
    for entry in stored.entries {
        max_sequence = max_sequence.max(entry.sequence);
        if entry.enqueued_at < cutoff {
            expired += 1;
            continue;
        }
        let bytes = serde_json::to_vec(&entry.payload)?;
        match wire::try_decode(&bytes) {
            Ok(action) => entries.push(QueuedAction {
                sequence: entry.sequence,
                action,
                enqueued_at: entry.enqueued_at,
                delivery: DeliveryState::Pending,
            }),
            Err(e) => warn!(sequence = entry.sequence, error = %e, "skipping undecodable queued action"),
        }
    }
    entries.sort_by_key(|e| e.sequence);

    if expired > 0 {
        info!(conversation = conversation_id, expired, "discarded expired queued actions");
    }

    Ok(Some(LoadedQueue {
        next_sequence: stored.next_sequence.max(max_sequence + 1),
        entries,
        expired,
    }))
}

pub(crate) async fn delete(store: &dyn KeyValueStore, conversation_id: &str) -> Result<(), SyncError> {
    store.delete(&key(conversation_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, DomainEvent};
    use crate::store::MemoryStore;

    fn queued(sequence: u64, text: &str, enqueued_at: DateTime<Utc>) -> QueuedAction {
        QueuedAction {
            sequence,
            action: DomainEvent::user_action(Action::message(text)),
            enqueued_at,
            delivery: DeliveryState::Sent,
        }
    }

    #[tokio::test]
    async fn roundtrip_resets_delivery_to_pending() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let entries = vec![queued(3, "three", now), queued(4, "four", now)];
        save(&store, "c1", 5, entries.iter()).await.unwrap();

        let loaded = load(&store, "c1", Duration::from_secs(3600), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.next_sequence, 5);
        assert_eq!(loaded.expired, 0);
        let seqs: Vec<_> = loaded.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert!(loaded.entries.iter().all(|e| e.delivery == DeliveryState::Pending));
        assert_eq!(loaded.entries[0].action.kind, entries[0].action.kind);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_but_sequence_is_kept() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(25);
        let entries = vec![queued(1, "stale", old), queued(2, "fresh", now)];
        save(&store, "c1", 3, entries.iter()).await.unwrap();

        let loaded = load(&store, "c1", Duration::from_secs(24 * 3600), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.expired, 1);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].sequence, 2);
        assert_eq!(loaded.next_sequence, 3);
    }

    #[tokio::test]
    async fn missing_snapshot() {
        let store = MemoryStore::new();
        assert!(
            load(&store, "nope", Duration::from_secs(1), Utc::now())
                .await
                .unwrap()
                .is_none()
        );
    }
}

//! Ordered, durable buffering of user-issued actions.
//!
//! Actions get a per-conversation sequence number on enqueue. While the
//! connection is up they are sent immediately; otherwise they wait. Each time
//! the connection becomes `Connected` the queue replays pending entries in
//! ascending sequence, one send in flight at a time, and removes an entry
//! only once the transport reports it written.

mod actor;
mod snapshot;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::controller::ConnectionState;
use crate::error::SyncError;
use crate::event::{Action, DomainEvent};
use crate::metrics::SyncMetrics;
use crate::router::EventRouter;
use crate::store::KeyValueStore;

use actor::QueueActor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    DropOldest,
    RejectNew,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Never drops; emits a `queue_warning` once the backlog passes the threshold.
    Unbounded { warn_threshold: usize },
    Bounded {
        capacity: usize,
        strategy: OverflowStrategy,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    pub overflow: OverflowPolicy,
    /// Entries older than this are discarded when a snapshot is loaded.
    pub ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::Unbounded {
                warn_threshold: 500,
            },
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    /// Handed to the transport, not yet confirmed written.
    Sent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueuedAction {
    pub sequence: u64,
    pub action: DomainEvent,
    pub enqueued_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

/// Where queued actions go. Implemented by the connection controller's handle.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Resolves once the transport reports the payload written.
    async fn transmit(&self, payload: Vec<u8>) -> Result<(), SyncError>;

    /// Changes every time the underlying link is replaced.
    fn link_epoch(&self) -> u64;
}

pub(crate) enum QueueCommand {
    Enqueue {
        action: DomainEvent,
        respond_to: oneshot::Sender<Result<u64, SyncError>>,
    },
    Attach {
        conversation_id: String,
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    Detach {
        forget: bool,
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    List {
        respond_to: oneshot::Sender<Vec<QueuedAction>>,
    },
}

/// Delete the stored backlog of a conversation this queue is not attached to.
pub async fn discard_snapshot(
    store: &dyn KeyValueStore,
    conversation_id: &str,
) -> Result<(), SyncError> {
    snapshot::delete(store, conversation_id).await
}

/// Handle to the queue actor. The actor stops when every handle is dropped.
#[derive(Clone)]
pub struct OutgoingActionQueue {
    sender: mpsc::Sender<QueueCommand>,
}

impl OutgoingActionQueue {
    pub fn spawn(
        config: QueueConfig,
        outbound: Arc<dyn Outbound>,
        state: watch::Receiver<ConnectionState>,
        router: EventRouter,
        store: Option<Arc<dyn KeyValueStore>>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let (sender, commands) = mpsc::channel(256);
        let actor = QueueActor::new(config, outbound, state, router, store, metrics, commands);
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Queue a user action. Returns its sequence number.
    pub async fn enqueue(&self, action: Action) -> Result<u64, SyncError> {
        self.enqueue_event(DomainEvent::user_action(action)).await
    }

    pub async fn enqueue_event(&self, action: DomainEvent) -> Result<u64, SyncError> {
        if action.as_action().is_none() {
            return Err(SyncError::Protocol(format!(
                "only actions can be queued, got '{}' observation",
                action.type_tag()
            )));
        }
        self.request(|respond_to| QueueCommand::Enqueue { action, respond_to })
            .await?
    }

    /// Bind to a conversation: load its snapshot (dropping expired entries)
    /// ahead of anything queued so far.
    pub async fn attach(&self, conversation_id: impl Into<String>) -> Result<(), SyncError> {
        let conversation_id = conversation_id.into();
        self.request(|respond_to| QueueCommand::Attach {
            conversation_id,
            respond_to,
        })
        .await?
    }

    /// Unbind from the current conversation. With `forget` the pending
    /// entries and the stored snapshot are discarded; otherwise the snapshot
    /// is written and memory cleared.
    pub async fn detach(&self, forget: bool) -> Result<(), SyncError> {
        self.request(|respond_to| QueueCommand::Detach { forget, respond_to })
            .await?
    }

    pub async fn pending(&self) -> Result<Vec<QueuedAction>, SyncError> {
        self.request(|respond_to| QueueCommand::List { respond_to })
            .await
    }

    pub async fn len(&self) -> Result<usize, SyncError> {
        Ok(self.pending().await?.len())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }
}

//! The assembled client: one router, controller and queue wired together
//! around a transport and an optional durable store.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::SyncConfig;
use crate::controller::{ConnectionController, ConnectionState};
use crate::error::SyncError;
use crate::event::{Action, EventFilter, EventId};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::queue::{self, OutgoingActionQueue, QueuedAction};
use crate::router::{EventRouter, EventSubscription};
use crate::scheduler::{EventPriorityScheduler, ScheduledEvents};
use crate::session::{Session, SessionStore};
use crate::store::KeyValueStore;
use crate::transport::{Transport, WebSocketTransport};

pub struct SyncClientBuilder {
    config: SyncConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl SyncClientBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`WebSocketTransport`].
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Without a store, sessions and queued actions live in memory only.
    pub fn store(mut self, store: impl KeyValueStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Spawns the actors, so this must run inside a tokio runtime.
    pub fn build(self) -> SyncClient {
        let metrics = Arc::new(SyncMetrics::new());
        let router = EventRouter::new(metrics.clone());
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));
        let sessions = self.store.clone().map(SessionStore::new);

        let controller = ConnectionController::spawn(
            self.config.controller(),
            transport,
            router.clone(),
            sessions.clone(),
            metrics.clone(),
        );
        let queue = OutgoingActionQueue::spawn(
            self.config.queue.clone(),
            Arc::new(controller.clone()),
            controller.watch_state(),
            router.clone(),
            self.store.clone(),
            metrics.clone(),
        );

        SyncClient {
            config: self.config,
            controller,
            queue,
            router,
            sessions,
            store: self.store,
            metrics,
        }
    }
}

/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct SyncClient {
    config: SyncConfig,
    controller: ConnectionController,
    queue: OutgoingActionQueue,
    router: EventRouter,
    sessions: Option<SessionStore>,
    store: Option<Arc<dyn KeyValueStore>>,
    metrics: Arc<SyncMetrics>,
}

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder {
            config: SyncConfig::default(),
            transport: None,
            store: None,
        }
    }

    /// Bind the outgoing queue to the session's conversation (loading its
    /// stored backlog) and start connecting.
    pub async fn connect(&self, session: Session) -> Result<(), SyncError> {
        info!(conversation = %session.conversation_id, "sync client connecting");
        self.queue.attach(session.conversation_id.clone()).await?;
        self.controller.connect(session).await
    }

    /// Reconnect to the most recently saved session, if there is one.
    pub async fn resume_last(&self) -> Result<Option<Session>, SyncError> {
        let Some(session) = self.last_session().await? else {
            return Ok(None);
        };
        self.connect(session.clone()).await?;
        Ok(Some(session))
    }

    /// Queued actions stay queued and go out on the next connect.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.controller.disconnect().await
    }

    /// Disconnect and discard the session, its cursor and its queued actions.
    pub async fn forget(&self) -> Result<(), SyncError> {
        self.controller.forget().await?;
        self.queue.detach(true).await
    }

    /// Delete a stored session and its queued actions without connecting.
    /// The conversation must not be the one currently in use.
    pub async fn forget_stored(&self, conversation_id: &str) -> Result<(), SyncError> {
        let (Some(sessions), Some(store)) = (&self.sessions, &self.store) else {
            return Ok(());
        };
        if let Some(current) = self.controller.session().await? {
            if current.conversation_id == conversation_id {
                return Err(SyncError::Config(format!(
                    "conversation {conversation_id} is in use; disconnect first or call forget()"
                )));
            }
        }
        sessions.clear(conversation_id).await?;
        queue::discard_snapshot(store.as_ref(), conversation_id).await?;
        info!(conversation = conversation_id, "stored session forgotten");
        Ok(())
    }

    pub async fn retry(&self) -> Result<(), SyncError> {
        self.controller.retry().await
    }

    /// Queue a user action for delivery. Returns its sequence number.
    pub async fn send(&self, action: Action) -> Result<u64, SyncError> {
        self.queue.enqueue(action).await
    }

    pub async fn pending_actions(&self) -> Result<Vec<QueuedAction>, SyncError> {
        self.queue.pending().await
    }

    /// Raw routed events, in arrival order.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.router.subscribe(filter)
    }

    /// Routed events passed through the priority scheduler.
    pub fn scheduled(&self, filter: EventFilter) -> ScheduledEvents {
        let scheduler = EventPriorityScheduler::new(self.config.scheduler.clone())
            .with_metrics(self.metrics.clone());
        ScheduledEvents::new(self.router.subscribe(filter), scheduler)
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.controller.watch_state()
    }

    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, SyncError> {
        self.controller.wait_for_state(predicate).await
    }

    pub async fn session(&self) -> Result<Option<Session>, SyncError> {
        self.controller.session().await
    }

    pub async fn last_session(&self) -> Result<Option<Session>, SyncError> {
        match &self.sessions {
            Some(sessions) => sessions.last().await,
            None => Ok(None),
        }
    }

    /// Highest event id processed in the current session.
    pub fn cursor(&self) -> Option<EventId> {
        self.router.cursor()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

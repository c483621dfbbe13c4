//! agent_sync - resilient event-sync client for long-running agent sessions
//!
//! Keeps one bidirectional link to an agent backend alive across network
//! loss, decodes the inbound event stream into typed [`DomainEvent`]s,
//! delivers them by priority, and buffers user actions durably until they
//! can be sent.
//!
//! # Example
//!
//! ```no_run
//! use agent_sync::{Action, EventFilter, Session, SqliteStore, SyncClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), agent_sync::SyncError> {
//!     let store = SqliteStore::open("sqlite://agent-sync.db?mode=rwc").await?;
//!     let client = SyncClient::builder().store(store).build();
//!
//!     client
//!         .connect(Session::new("wss://agent.example/socket", "conversation-1"))
//!         .await?;
//!     client.send(Action::message("summarize the open PRs")).await?;
//!
//!     let mut events = client.scheduled(EventFilter::All);
//!     while let Some(delivery) = events.next().await {
//!         for event in delivery.events() {
//!             println!("{} {:?}", event.type_tag(), event.id);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;

pub use client::{SyncClient, SyncClientBuilder};
pub use config::{FileConfig, SyncConfig, SyncPaths};
pub use controller::{ConnectionController, ConnectionState, ControllerConfig, FailureReason};
pub use error::{ErrorReport, RecoveryAction, SyncError, TimeoutKind, TransportError};
pub use event::{
    Action, DomainEvent, EventCategory, EventFilter, EventId, EventKind, EventSource, Observation,
    ObservationKind,
};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use queue::{OutgoingActionQueue, OverflowPolicy, OverflowStrategy, QueueConfig, QueuedAction};
pub use retry::RetryPolicy;
pub use router::{EventRouter, EventSubscription};
pub use scheduler::{Delivery, EventPriorityScheduler, PriorityTier, ScheduledEvents, SchedulerConfig};
pub use session::{Session, SessionStore};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{MemoryServer, MemoryTransport, Transport, WebSocketTransport};

//! Inbound fan-out: decodes payloads and publishes them to subscribers.
//!
//! The router knows nothing about connection state. It keeps the resume
//! cursor (highest event id seen) and delivers every event, in arrival order,
//! to each subscriber whose filter matches. It never deduplicates.

use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::event::{DomainEvent, EventFilter, EventId, wire};
use crate::metrics::SyncMetrics;

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

struct RouterInner {
    subscribers: Mutex<Vec<Subscriber>>,
    cursor: watch::Sender<Option<EventId>>,
    metrics: Arc<SyncMetrics>,
}

/// Cheap to clone; clones share subscribers and cursor.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new(metrics: Arc<SyncMetrics>) -> Self {
        let (cursor, _) = watch::channel(None);
        Self {
            inner: Arc::new(RouterInner {
                subscribers: Mutex::new(Vec::new()),
                cursor,
                metrics,
            }),
        }
    }

    /// Fail-soft decode; see [`wire::decode`].
    pub fn decode(&self, raw: &[u8]) -> DomainEvent {
        wire::decode(raw)
    }

    /// Decode one inbound payload, advance the cursor and publish.
    pub fn route(&self, raw: &[u8]) -> DomainEvent {
        let (event, protocol_error) = match wire::try_decode(raw) {
            Ok(event) => (event, false),
            Err(err) => {
                warn!(error = %err, bytes = raw.len(), "undecodable payload");
                (wire::protocol_error_event(&err, raw), true)
            }
        };
        self.inner.metrics.event_routed(protocol_error);
        if let Some(id) = event.id {
            self.advance_cursor(id);
        }
        self.publish(&event);
        event
    }

    /// Publish a locally originated event. The cursor is untouched.
    pub fn inject(&self, event: DomainEvent) {
        self.publish(&event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().push(Subscriber { filter, tx });
        EventSubscription { rx }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn cursor(&self) -> Option<EventId> {
        *self.inner.cursor.borrow()
    }

    /// Set the cursor for a new session. The only way it moves backwards.
    pub fn reset_cursor(&self, to: Option<EventId>) {
        self.inner.cursor.send_replace(to);
    }

    fn advance_cursor(&self, id: EventId) {
        self.inner.cursor.send_if_modified(|cursor| {
            if cursor.is_some_and(|current| current >= id) {
                return false;
            }
            *cursor = Some(id);
            true
        });
    }

    fn publish(&self, event: &DomainEvent) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|sub| {
            if !sub.filter.matches(event) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
        debug!(
            event_type = event.type_tag(),
            id = ?event.id,
            subscribers = subscribers.len(),
            "event published"
        );
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live, single-pass view of routed events. Events published before the
/// subscription was created are not replayed.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<DomainEvent>,
}

impl EventSubscription {
    /// `None` once the router (and every clone of it) is gone.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = DomainEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    DeliveryState, OverflowPolicy, OverflowStrategy, Outbound, QueueCommand, QueueConfig,
    QueuedAction, snapshot,
};
use crate::controller::ConnectionState;
use crate::error::SyncError;
use crate::event::observation::QueueWarningExtras;
use crate::event::{DomainEvent, ObservationKind, wire};
use crate::metrics::SyncMetrics;
use crate::router::EventRouter;
use crate::store::KeyValueStore;

struct InFlight {
    sequence: u64,
    /// Link epoch when the send started.
    link: u64,
    send: BoxFuture<'static, Result<(), SyncError>>,
}

/// Backlog of a conversation we switched away from, kept when there is no store.
struct Parked {
    entries: BTreeMap<u64, QueuedAction>,
    next_sequence: u64,
}

pub(super) struct QueueActor {
    config: QueueConfig,
    outbound: Arc<dyn Outbound>,
    state: watch::Receiver<ConnectionState>,
    router: EventRouter,
    store: Option<Arc<dyn KeyValueStore>>,
    metrics: Arc<SyncMetrics>,
    commands: mpsc::Receiver<QueueCommand>,

    conversation_id: Option<String>,
    entries: BTreeMap<u64, QueuedAction>,
    next_sequence: u64,
    in_flight: Option<InFlight>,
    parked: HashMap<String, Parked>,
    connected: bool,
    /// A send failed on the current connection; wait for the next one.
    stalled: bool,
    /// Unbounded backlog warning already emitted for this excursion.
    warned: bool,
}

impl QueueActor {
    pub(super) fn new(
        config: QueueConfig,
        outbound: Arc<dyn Outbound>,
        state: watch::Receiver<ConnectionState>,
        router: EventRouter,
        store: Option<Arc<dyn KeyValueStore>>,
        metrics: Arc<SyncMetrics>,
        commands: mpsc::Receiver<QueueCommand>,
    ) -> Self {
        let connected = state.borrow().is_connected();
        Self {
            config,
            outbound,
            state,
            router,
            store,
            metrics,
            commands,
            conversation_id: None,
            entries: BTreeMap::new(),
            next_sequence: 1,
            in_flight: None,
            parked: HashMap::new(),
            connected,
            stalled: false,
            warned: false,
        }
    }

    pub(super) async fn run(mut self) {
        let mut state_open = true;
        self.pump();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                changed = self.state.changed(), if state_open => {
                    if changed.is_err() {
                        state_open = false;
                        self.connected = false;
                        continue;
                    }
                    self.on_state_change();
                }

                (sequence, link, result) = poll_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.on_send_complete(sequence, link, result).await;
                }
            }
        }
        debug!("outgoing queue stopped");
    }

    async fn handle_command(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Enqueue { action, respond_to } => {
                let result = self.enqueue(action).await;
                let _ = respond_to.send(result);
            }
            QueueCommand::Attach {
                conversation_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.attach(conversation_id).await);
            }
            QueueCommand::Detach { forget, respond_to } => {
                let _ = respond_to.send(self.detach(forget).await);
            }
            QueueCommand::List { respond_to } => {
                let _ = respond_to.send(self.entries.values().cloned().collect());
            }
        }
    }

    async fn enqueue(&mut self, action: DomainEvent) -> Result<u64, SyncError> {
        match self.config.overflow {
            OverflowPolicy::Bounded { capacity, strategy } if self.entries.len() >= capacity => {
                match strategy {
                    OverflowStrategy::RejectNew => {
                        let err = SyncError::QueueOverflow {
                            pending: self.entries.len(),
                            capacity,
                        };
                        warn!(pending = self.entries.len(), capacity, "outgoing queue full, rejecting action");
                        self.emit_warning(&err.to_string(), None);
                        return Err(err);
                    }
                    OverflowStrategy::DropOldest => {
                        let in_flight = self.in_flight.as_ref().map(|f| f.sequence);
                        let oldest = self
                            .entries
                            .keys()
                            .copied()
                            .find(|seq| Some(*seq) != in_flight);
                        let Some(dropped) = oldest else {
                            return Err(SyncError::QueueOverflow {
                                pending: self.entries.len(),
                                capacity,
                            });
                        };
                        self.entries.remove(&dropped);
                        self.metrics.actions_dropped(1);
                        warn!(sequence = dropped, capacity, "outgoing queue full, dropped oldest action");
                        self.emit_warning(
                            &format!("outgoing queue full (capacity {capacity}); dropped action {dropped}"),
                            Some(dropped),
                        );
                    }
                }
            }
            _ => {}
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            sequence,
            QueuedAction {
                sequence,
                action,
                enqueued_at: Utc::now(),
                delivery: DeliveryState::Pending,
            },
        );
        debug!(sequence, pending = self.entries.len(), connected = self.connected, "action enqueued");

        if let OverflowPolicy::Unbounded { warn_threshold } = self.config.overflow {
            if self.entries.len() > warn_threshold && !self.warned {
                self.warned = true;
                warn!(pending = self.entries.len(), warn_threshold, "outgoing queue backlog growing");
                self.emit_warning(
                    &format!("{} actions waiting to be sent", self.entries.len()),
                    None,
                );
            }
        }

        self.persist().await;
        self.pump();
        Ok(sequence)
    }

    async fn attach(&mut self, conversation_id: String) -> Result<(), SyncError> {
        if self.conversation_id.as_deref() == Some(conversation_id.as_str()) {
            return Ok(());
        }
        // Entries may be renumbered or swapped out below.
        self.settle_in_flight().await;
        if self.conversation_id.is_some() {
            self.detach(false).await?;
        }

        let restored = match &self.store {
            Some(store) => {
                snapshot::load(store.as_ref(), &conversation_id, self.config.ttl, Utc::now())
                    .await?
                    .map(|loaded| {
                        self.metrics.actions_dropped(loaded.expired as u64);
                        Parked {
                            entries: loaded.entries.into_iter().map(|e| (e.sequence, e)).collect(),
                            next_sequence: loaded.next_sequence,
                        }
                    })
            }
            None => self.parked.remove(&conversation_id),
        };

        if let Some(restored) = restored {
            // Anything queued while unbound goes after the stored backlog.
            let unbound: Vec<QueuedAction> =
                std::mem::take(&mut self.entries).into_values().collect();
            self.next_sequence = self.next_sequence.max(restored.next_sequence);
            self.entries = restored.entries;
            for mut entry in unbound {
                entry.sequence = self.next_sequence;
                entry.delivery = DeliveryState::Pending;
                self.next_sequence += 1;
                self.entries.insert(entry.sequence, entry);
            }
        }

        info!(conversation = %conversation_id, pending = self.entries.len(), "outgoing queue attached");
        self.conversation_id = Some(conversation_id);
        self.persist().await;
        self.pump();
        Ok(())
    }

    async fn detach(&mut self, forget: bool) -> Result<(), SyncError> {
        // A write already handed to the link must not be saved for replay.
        self.settle_in_flight().await;
        let Some(conversation_id) = self.conversation_id.take() else {
            if forget {
                self.metrics.actions_dropped(self.entries.len() as u64);
                self.entries.clear();
            }
            return Ok(());
        };

        match &self.store {
            Some(store) if forget => snapshot::delete(store.as_ref(), &conversation_id).await?,
            Some(store) => {
                snapshot::save(
                    store.as_ref(),
                    &conversation_id,
                    self.next_sequence,
                    self.entries.values(),
                )
                .await?
            }
            None if forget => {
                self.parked.remove(&conversation_id);
            }
            None => {}
        }

        if forget {
            self.metrics.actions_dropped(self.entries.len() as u64);
        }
        info!(conversation = %conversation_id, forget, pending = self.entries.len(), "outgoing queue detached");
        let entries = std::mem::take(&mut self.entries);
        if self.store.is_none() && !forget {
            self.parked.insert(
                conversation_id,
                Parked {
                    entries,
                    next_sequence: self.next_sequence,
                },
            );
        }
        self.next_sequence = 1;
        self.warned = false;
        Ok(())
    }

    /// Wait for the send in flight, if any, and record its outcome.
    async fn settle_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let result = in_flight.send.await;
            self.record_send_result(in_flight.sequence, in_flight.link, result);
        }
    }

    fn on_state_change(&mut self) {
        let now_connected = self.state.borrow_and_update().is_connected();
        // A stalled queue seeing Connected again means the link was replaced
        // (intermediate states may have been coalesced by the watch).
        if now_connected && (!self.connected || self.stalled) {
            self.stalled = false;
            debug!(pending = self.entries.len(), link = self.outbound.link_epoch(), "flushing outgoing queue on connect");
        }
        self.connected = now_connected;
        self.pump();
    }

    async fn on_send_complete(&mut self, sequence: u64, link: u64, result: Result<(), SyncError>) {
        if self.record_send_result(sequence, link, result) {
            self.persist().await;
        }
        self.pump();
    }

    /// Returns true when the entry was written and removed.
    fn record_send_result(&mut self, sequence: u64, link: u64, result: Result<(), SyncError>) -> bool {
        match result {
            Ok(()) => {
                if self.entries.remove(&sequence).is_some() {
                    self.metrics.action_sent();
                    debug!(sequence, "action sent");
                }
                if self.entries.len() <= self.warn_threshold() {
                    self.warned = false;
                }
                true
            }
            Err(e) => {
                if let Some(entry) = self.entries.get_mut(&sequence) {
                    entry.delivery = DeliveryState::Pending;
                }
                // Failures of a link that has since been replaced say nothing
                // about the current one.
                if link == self.outbound.link_epoch() {
                    debug!(sequence, link, error = %e, "send failed, will replay on next connect");
                    self.stalled = true;
                } else {
                    debug!(sequence, link, error = %e, "send failed on a replaced link, replaying");
                }
                false
            }
        }
    }

    /// Start the next send if connected and nothing is in flight.
    fn pump(&mut self) {
        if !self.connected || self.stalled || self.in_flight.is_some() {
            return;
        }
        let Some(entry) = self.entries.values_mut().next() else {
            return;
        };

        let sequence = entry.sequence;
        let payload = match wire::encode(&entry.action) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(sequence, error = %e, "dropping unencodable action");
                self.entries.remove(&sequence);
                self.metrics.actions_dropped(1);
                self.pump();
                return;
            }
        };
        entry.delivery = DeliveryState::Sent;

        let outbound = self.outbound.clone();
        self.in_flight = Some(InFlight {
            sequence,
            link: self.outbound.link_epoch(),
            send: Box::pin(async move { outbound.transmit(payload).await }),
        });
    }

    async fn persist(&mut self) {
        let (Some(store), Some(conversation_id)) = (&self.store, &self.conversation_id) else {
            return;
        };
        if let Err(e) = snapshot::save(
            store.as_ref(),
            conversation_id,
            self.next_sequence,
            self.entries.values(),
        )
        .await
        {
            warn!(conversation = %conversation_id, error = %e, "failed to persist outgoing queue");
        }
    }

    fn warn_threshold(&self) -> usize {
        match self.config.overflow {
            OverflowPolicy::Unbounded { warn_threshold } => warn_threshold,
            OverflowPolicy::Bounded { capacity, .. } => capacity,
        }
    }

    fn emit_warning(&self, message: &str, dropped_sequence: Option<u64>) {
        self.router.inject(DomainEvent::local_observation(
            message,
            ObservationKind::QueueWarning(QueueWarningExtras {
                pending: self.entries.len(),
                dropped_sequence,
            }),
        ));
    }
}

async fn poll_in_flight(slot: &mut Option<InFlight>) -> (u64, u64, Result<(), SyncError>) {
    match slot {
        Some(in_flight) => {
            let result = (&mut in_flight.send).await;
            (in_flight.sequence, in_flight.link, result)
        }
        None => std::future::pending().await,
    }
}

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use super::link::{ActiveLink, LinkEvent, LinkEventKind};
use super::{ConnectionState, ControllerCommand, ControllerConfig, FailureReason};
use crate::error::{SyncError, TimeoutKind};
use crate::event::wire;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatSignal};
use crate::metrics::SyncMetrics;
use crate::router::EventRouter;
use crate::session::{Session, SessionStore};
use crate::transport::{Handshake, Link, Transport};

/// Cursor advances are written at most this often while connected.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

struct PendingConnect {
    epoch: u64,
    future: BoxFuture<'static, Result<Link, SyncError>>,
}

pub(crate) struct ControllerActor {
    config: ControllerConfig,
    transport: Arc<dyn Transport>,
    router: EventRouter,
    sessions: Option<SessionStore>,
    metrics: Arc<SyncMetrics>,
    state: watch::Sender<ConnectionState>,
    link_epoch: watch::Sender<u64>,
    commands: mpsc::Receiver<ControllerCommand>,

    session: Option<Session>,
    /// Bumped for every connect attempt; tags the link it produces.
    epoch: u64,
    link: Option<ActiveLink>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    heartbeat: HeartbeatMonitor,
    heartbeat_signals: mpsc::UnboundedReceiver<HeartbeatSignal>,
    pending_connect: Option<PendingConnect>,

    /// Reconnect attempts started since the last stable connection.
    retries: u32,
    reconnect_at: Option<Instant>,
    /// When the current link counts as stable and `retries` resets.
    stable_at: Option<Instant>,
    /// Set while the in-memory cursor is ahead of the stored session.
    persist_at: Option<Instant>,
}

impl ControllerActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        router: EventRouter,
        sessions: Option<SessionStore>,
        metrics: Arc<SyncMetrics>,
        state: watch::Sender<ConnectionState>,
        link_epoch: watch::Sender<u64>,
        commands: mpsc::Receiver<ControllerCommand>,
    ) -> Self {
        let (link_events_tx, link_events) = mpsc::unbounded_channel();
        let (signals_tx, heartbeat_signals) = mpsc::unbounded_channel();
        Self {
            config,
            transport,
            router,
            sessions,
            metrics,
            state,
            link_epoch,
            commands,
            session: None,
            epoch: 0,
            link: None,
            link_events_tx,
            link_events,
            heartbeat: HeartbeatMonitor::new(signals_tx),
            heartbeat_signals,
            pending_connect: None,
            retries: 0,
            reconnect_at: None,
            stable_at: None,
            persist_at: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let reconnect_at = self.reconnect_at;
            let stable_at = self.stable_at;
            let persist_at = self.persist_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(event) = self.link_events.recv() => self.on_link_event(event).await,

                Some(signal) = self.heartbeat_signals.recv() => self.on_heartbeat(signal).await,

                (epoch, result) = poll_connect(&mut self.pending_connect), if self.pending_connect.is_some() => {
                    self.pending_connect = None;
                    self.on_connect_result(epoch, result);
                }

                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }

                _ = sleep_until(stable_at.unwrap_or_else(Instant::now)), if stable_at.is_some() => {
                    self.stable_at = None;
                    if self.retries > 0 {
                        debug!(retries = self.retries, "connection stable, attempt counter reset");
                    }
                    self.retries = 0;
                }

                _ = sleep_until(persist_at.unwrap_or_else(Instant::now)), if persist_at.is_some() => {
                    self.flush_session().await;
                }
            }
        }

        self.teardown();
        self.flush_session().await;
        debug!("connection controller stopped");
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Connect {
                session,
                respond_to,
            } => {
                let result = self.connect(session).await;
                let _ = respond_to.send(result);
            }
            ControllerCommand::Disconnect { respond_to } => {
                self.disconnect().await;
                let _ = respond_to.send(());
            }
            ControllerCommand::Forget { respond_to } => {
                let result = self.forget().await;
                let _ = respond_to.send(result);
            }
            ControllerCommand::Retry { respond_to } => {
                let _ = respond_to.send(self.retry());
            }
            ControllerCommand::Writer { respond_to } => {
                let _ = respond_to.send(self.link.as_ref().map(|link| link.writer.clone()));
            }
            ControllerCommand::Session { respond_to } => {
                let _ = respond_to.send(self.session.clone());
            }
        }
    }

    async fn connect(&mut self, session: Session) -> Result<(), SyncError> {
        if session.server_endpoint.trim().is_empty() {
            return Err(SyncError::Config("server endpoint is empty".into()));
        }
        if session.conversation_id.trim().is_empty() {
            return Err(SyncError::Config("conversation id is empty".into()));
        }

        self.teardown();
        self.flush_session().await;

        let session = match &self.sessions {
            Some(store) => match store.resume(session.clone()).await {
                Ok(resumed) => resumed,
                Err(e) => {
                    warn!(error = %e, "could not read stored session, starting without it");
                    session
                }
            },
            None => session,
        };

        info!(
            conversation = %session.conversation_id,
            endpoint = %session.server_endpoint,
            cursor = ?session.last_event_id,
            "connecting"
        );
        self.router.reset_cursor(session.last_event_id);
        self.session = Some(session);
        self.save_session().await;

        self.retries = 0;
        self.set_state(ConnectionState::Connecting);
        self.start_attempt();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.teardown();
        self.flush_session().await;
        if self.session.is_some() {
            info!("disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn forget(&mut self) -> Result<(), SyncError> {
        self.teardown();
        self.persist_at = None;
        self.router.reset_cursor(None);
        self.set_state(ConnectionState::Disconnected);

        let Some(session) = self.session.take() else {
            return Ok(());
        };
        info!(conversation = %session.conversation_id, "forgetting session");
        match &self.sessions {
            Some(store) => store.clear(&session.conversation_id).await,
            None => Ok(()),
        }
    }

    fn retry(&mut self) -> Result<(), SyncError> {
        let current = self.state.borrow().clone();
        match current {
            ConnectionState::Connected | ConnectionState::Connecting => Ok(()),
            ConnectionState::Reconnecting { .. } => {
                // An attempt already in progress is left alone.
                if self.reconnect_at.is_some() {
                    self.reconnect_at = Some(Instant::now());
                }
                Ok(())
            }
            ConnectionState::Disconnected | ConnectionState::Failed { .. } => {
                if self.session.is_none() {
                    return Err(SyncError::Config("no session to retry".into()));
                }
                info!("manual retry");
                self.retries = 0;
                self.set_state(ConnectionState::Connecting);
                self.start_attempt();
                Ok(())
            }
        }
    }

    fn start_attempt(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let mut handshake = Handshake::from_session(session);
        handshake.latest_event_id = self.router.cursor();

        self.epoch += 1;
        if matches!(*self.state.borrow(), ConnectionState::Reconnecting { .. }) {
            self.retries += 1;
            self.metrics.reconnect_attempt();
        }
        debug!(
            epoch = self.epoch,
            attempt = self.retries,
            cursor = ?handshake.latest_event_id,
            "connect attempt"
        );

        let transport = self.transport.clone();
        let timeout = self.config.transport.connect_timeout;
        let future = async move {
            match tokio::time::timeout(timeout, transport.connect(&handshake)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(TimeoutKind::Handshake)),
            }
        }
        .boxed();
        self.pending_connect = Some(PendingConnect {
            epoch: self.epoch,
            future,
        });
    }

    fn on_connect_result(&mut self, epoch: u64, result: Result<Link, SyncError>) {
        if epoch != self.epoch {
            trace!(epoch, "stale connect result");
            return;
        }
        match result {
            Ok(link) => self.on_linked(link),
            Err(SyncError::Auth(message)) => {
                warn!(%message, "authentication rejected");
                self.fail(FailureReason::AuthRejected { message });
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "connect failed permanently");
                self.fail(FailureReason::Unrecoverable {
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(attempt = self.retries, error = %e, "connect attempt failed");
                self.schedule_reconnect();
            }
        }
    }

    fn on_linked(&mut self, link: Link) {
        let interval = self.config.heartbeat.interval;
        self.link = Some(ActiveLink::spawn(
            self.epoch,
            link,
            self.config.transport.send_buffer,
            self.link_events_tx.clone(),
        ));
        self.link_epoch.send_replace(self.epoch);
        self.stable_at = Some(Instant::now() + interval);
        self.heartbeat.start(interval, self.config.heartbeat.timeout);
        self.metrics.connected();
        info!(epoch = self.epoch, cursor = ?self.router.cursor(), "connected");
        self.set_state(ConnectionState::Connected);
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        if self.link.as_ref().map(|l| l.epoch) != Some(event.epoch) {
            trace!(epoch = event.epoch, "dropping event from stale link");
            return;
        }
        match event.kind {
            LinkEventKind::Frame(bytes) => self.on_frame(&bytes),
            LinkEventKind::Closed(reason) => {
                match reason {
                    Some(e) => warn!(epoch = event.epoch, error = %e, "link lost"),
                    None => info!(epoch = event.epoch, "link closed by server"),
                }
                self.link_lost().await;
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        if let Some(nonce) = wire::parse_probe_response(bytes) {
            self.heartbeat.on_probe_response(nonce);
            return;
        }
        if let Some(nonce) = wire::parse_probe(bytes) {
            if let Some(link) = &self.link {
                link.send_control(wire::probe_response(nonce));
            }
            return;
        }

        self.router.route(bytes);

        let (Some(cursor), Some(session)) = (self.router.cursor(), self.session.as_mut()) else {
            return;
        };
        if session.advance_cursor(cursor) && self.sessions.is_some() && self.persist_at.is_none() {
            self.persist_at = Some(Instant::now() + PERSIST_DEBOUNCE);
        }
    }

    async fn on_heartbeat(&mut self, signal: HeartbeatSignal) {
        if !self.heartbeat.is_current(&signal) {
            return;
        }
        match signal {
            HeartbeatSignal::Probe { nonce, .. } => {
                let sent = self
                    .link
                    .as_ref()
                    .is_some_and(|link| link.send_control(wire::probe(nonce)));
                if !sent {
                    debug!(nonce, "probe not queued");
                }
            }
            HeartbeatSignal::Expired { .. } => {
                self.metrics.heartbeat_timeout();
                warn!(
                    timeout_secs = self.config.heartbeat.timeout.as_secs(),
                    "heartbeat timed out"
                );
                self.link_lost().await;
            }
        }
    }

    async fn link_lost(&mut self) {
        self.drop_link();
        self.flush_session().await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let policy = &self.config.retry;
        if policy.exhausted(self.retries) {
            warn!(attempts = self.retries, "giving up on reconnecting");
            self.fail(FailureReason::AttemptsExhausted {
                attempts: self.retries,
            });
            return;
        }

        let delay = policy.delay(self.retries);
        let next = ConnectionState::Reconnecting {
            attempt: self.retries + 1,
            max_attempts: policy.max_attempts,
        };
        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            attempt = self.retries + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        self.set_state(next);
    }

    fn fail(&mut self, reason: FailureReason) {
        self.teardown();
        self.set_state(ConnectionState::Failed { reason });
    }

    /// Drop the link and every timer. The session is kept.
    fn teardown(&mut self) {
        self.drop_link();
        self.pending_connect = None;
        self.reconnect_at = None;
    }

    fn drop_link(&mut self) {
        self.heartbeat.stop();
        self.stable_at = None;
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    async fn flush_session(&mut self) {
        if self.persist_at.take().is_some() {
            self.save_session().await;
        }
    }

    async fn save_session(&mut self) {
        let (Some(store), Some(session)) = (&self.sessions, &self.session) else {
            return;
        };
        if let Err(e) = store.save(session).await {
            warn!(error = %e, "failed to persist session");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.borrow().clone();
        if previous == next {
            return;
        }
        debug!(from = %previous, to = %next, "connection state");
        self.state.send_replace(next);
    }
}

async fn poll_connect(pending: &mut Option<PendingConnect>) -> (u64, Result<Link, SyncError>) {
    match pending {
        Some(pending) => {
            let result = (&mut pending.future).await;
            (pending.epoch, result)
        }
        None => std::future::pending().await,
    }
}

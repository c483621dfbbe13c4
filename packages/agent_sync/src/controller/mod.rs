//! The connection state machine.
//!
//! [`ConnectionController`] is a handle to an actor task that owns the
//! session, the live link and every timer around it: the handshake timeout,
//! the reconnect backoff, the heartbeat, and the stability window after
//! which the attempt counter resets. Callers observe the state through a
//! `watch` channel and never see individual transport errors.

mod actor;
mod link;
mod state;

pub use state::{ConnectionState, FailureReason};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{SyncError, TransportError};
use crate::heartbeat::HeartbeatConfig;
use crate::metrics::SyncMetrics;
use crate::queue::Outbound;
use crate::retry::RetryPolicy;
use crate::router::EventRouter;
use crate::session::{Session, SessionStore};
use crate::transport::{Transport, TransportConfig};

use actor::ControllerActor;
use link::WriteRequest;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    pub heartbeat: HeartbeatConfig,
    pub transport: TransportConfig,
}

pub(crate) enum ControllerCommand {
    Connect {
        session: Session,
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    Forget {
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    Retry {
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    /// Writer half of the live link, if any.
    Writer {
        respond_to: oneshot::Sender<Option<mpsc::Sender<WriteRequest>>>,
    },
    Session {
        respond_to: oneshot::Sender<Option<Session>>,
    },
}

/// Handle to the controller actor. Clones share one actor, which stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct ConnectionController {
    sender: mpsc::Sender<ControllerCommand>,
    state: watch::Receiver<ConnectionState>,
    link_epoch: watch::Receiver<u64>,
}

impl ConnectionController {
    pub fn spawn(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        router: EventRouter,
        sessions: Option<SessionStore>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let (sender, commands) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (epoch_tx, link_epoch) = watch::channel(0);
        let actor = ControllerActor::new(
            config, transport, router, sessions, metrics, state_tx, epoch_tx, commands,
        );
        tokio::spawn(actor.run());
        Self {
            sender,
            state,
            link_epoch,
        }
    }

    /// Start connecting to `session`, replacing any current link. Returns
    /// once the attempt is under way; watch the state for the outcome.
    ///
    /// With a session store attached, a session without a cursor resumes
    /// from the stored one for the same conversation.
    pub async fn connect(&self, session: Session) -> Result<(), SyncError> {
        self.request(|respond_to| ControllerCommand::Connect {
            session,
            respond_to,
        })
        .await?
    }

    /// Close the link and cancel any pending reconnection.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.request(|respond_to| ControllerCommand::Disconnect { respond_to })
            .await
    }

    /// Disconnect and delete the persisted session.
    pub async fn forget(&self) -> Result<(), SyncError> {
        self.request(|respond_to| ControllerCommand::Forget { respond_to })
            .await?
    }

    /// Manual retry. From `Failed` or `Disconnected` this starts over with a
    /// fresh attempt budget; while `Reconnecting` it skips the remaining
    /// backoff.
    pub async fn retry(&self) -> Result<(), SyncError> {
        self.request(|respond_to| ControllerCommand::Retry { respond_to })
            .await?
    }

    pub async fn session(&self) -> Result<Option<Session>, SyncError> {
        self.request(|respond_to| ControllerCommand::Session { respond_to })
            .await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves with the first state (current or future) matching `predicate`.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, SyncError> {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(predicate)
            .await
            .map_err(|_| SyncError::Shutdown)?;
        Ok(matched.clone())
    }

    /// Epoch of the most recently established link; 0 before the first one.
    pub fn link_epoch(&self) -> u64 {
        *self.link_epoch.borrow()
    }

    /// Write one frame on the live link. Resolves once the transport reports
    /// it written; fails with `NotConnected` when there is no link.
    pub async fn transmit(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        let writer = self
            .request(|respond_to| ControllerCommand::Writer { respond_to })
            .await?
            .ok_or(TransportError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        writer
            .send(WriteRequest {
                payload,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| TransportError::Abandoned)?;
        rx.await.map_err(|_| TransportError::Abandoned)?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }
}

#[async_trait]
impl Outbound for ConnectionController {
    async fn transmit(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        ConnectionController::transmit(self, payload).await
    }

    fn link_epoch(&self) -> u64 {
        ConnectionController::link_epoch(self)
    }
}

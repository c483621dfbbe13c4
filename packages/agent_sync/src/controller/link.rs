//! Per-link reader and writer tasks.
//!
//! Every established link gets an epoch. Its two halves run in their own
//! tasks and report back to the controller tagged with that epoch, so the
//! controller can drop anything a torn-down link still had in flight.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{SyncError, TransportError};
use crate::transport::{Link, LinkReceiver, LinkSender};

pub(crate) struct WriteRequest {
    pub payload: Vec<u8>,
    pub respond_to: Option<oneshot::Sender<Result<(), SyncError>>>,
}

#[derive(Debug)]
pub(crate) enum LinkEventKind {
    Frame(Vec<u8>),
    /// The link is gone. `None` means the peer closed it cleanly.
    Closed(Option<TransportError>),
}

#[derive(Debug)]
pub(crate) struct LinkEvent {
    pub epoch: u64,
    pub kind: LinkEventKind,
}

/// The controller's view of the live link.
pub(crate) struct ActiveLink {
    pub epoch: u64,
    pub writer: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
}

impl ActiveLink {
    pub fn spawn(
        epoch: u64,
        link: Link,
        send_buffer: usize,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (writer, requests) = mpsc::channel(send_buffer.max(1));
        tokio::spawn(run_writer(
            epoch,
            link.sender,
            requests,
            events.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(epoch, link.receiver, events, cancel.clone()));
        Self {
            epoch,
            writer,
            cancel,
        }
    }

    /// Queue a frame without waiting for it to be written. Control frames
    /// are best-effort, so a full buffer just drops them.
    pub fn send_control(&self, payload: Vec<u8>) -> bool {
        self.writer
            .try_send(WriteRequest {
                payload,
                respond_to: None,
            })
            .is_ok()
    }

    /// Stop both tasks. Unwritten requests are dropped, which their callers
    /// observe as an abandoned send.
    pub fn close(self) {
        self.cancel.cancel();
    }
}

async fn run_writer(
    epoch: u64,
    mut sender: Box<dyn LinkSender>,
    mut requests: mpsc::Receiver<WriteRequest>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            request = requests.recv() => {
                let Some(request) = request else { break };
                match sender.send(request.payload).await {
                    Ok(()) => {
                        if let Some(tx) = request.respond_to {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        debug!(epoch, error = %err, "link write failed");
                        if let Some(tx) = request.respond_to {
                            let _ = tx.send(Err(err.clone().into()));
                        }
                        let _ = events.send(LinkEvent {
                            epoch,
                            kind: LinkEventKind::Closed(Some(err)),
                        });
                        return;
                    }
                }
            }
        }
    }
    sender.close().await;
    trace!(epoch, "writer stopped");
}

async fn run_reader(
    epoch: u64,
    mut receiver: Box<dyn LinkReceiver>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            frame = receiver.recv() => {
                let kind = match frame {
                    Some(Ok(bytes)) => LinkEventKind::Frame(bytes),
                    Some(Err(err)) => LinkEventKind::Closed(Some(err)),
                    None => LinkEventKind::Closed(None),
                };
                let closed = matches!(kind, LinkEventKind::Closed(_));
                if events.send(LinkEvent { epoch, kind }).is_err() || closed {
                    break;
                }
            }
        }
    }
    trace!(epoch, "reader stopped");
}

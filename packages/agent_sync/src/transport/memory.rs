use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{Handshake, Link, LinkReceiver, LinkSender, Transport};
use crate::error::{SyncError, TransportError};
use crate::event::{DomainEvent, wire};

type Inbound = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

struct Shared {
    handshakes: Vec<Handshake>,
    fail_connects: u32,
    reject_auth: Option<String>,
    hang_connects: bool,
    fail_sends: bool,
    auto_pong: bool,
    send_delay: Duration,
    link_id: u64,
    inbound: Option<Inbound>,
    sent: Vec<Vec<u8>>,
    probes: u64,
}

/// In-process transport driven by a [`MemoryServer`] handle. Used by the
/// test suites and the CLI's `--demo` mode.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    changes: Arc<watch::Sender<u64>>,
}

/// The scripted "backend" side of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Mutex::new(Shared {
                handshakes: Vec::new(),
                fail_connects: 0,
                reject_auth: None,
                hang_connects: false,
                fail_sends: false,
                auto_pong: true,
                send_delay: Duration::ZERO,
                link_id: 0,
                inbound: None,
                sent: Vec::new(),
                probes: 0,
            })),
            changes: Arc::new(changes),
        }
    }

    pub fn server(&self) -> MemoryServer {
        MemoryServer {
            shared: self.shared.clone(),
            changes: self.changes.clone(),
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bump(changes: &watch::Sender<u64>) {
    changes.send_modify(|v| *v += 1);
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, handshake: &Handshake) -> Result<Link, SyncError> {
        let hang = {
            let mut shared = lock(&self.shared);
            shared.handshakes.push(handshake.clone());
            shared.hang_connects
        };
        bump(&self.changes);
        if hang {
            std::future::pending::<()>().await;
        }

        let mut shared = lock(&self.shared);
        if let Some(message) = shared.reject_auth.clone() {
            return Err(SyncError::Auth(message));
        }
        if shared.fail_connects > 0 {
            shared.fail_connects -= 1;
            return Err(TransportError::ConnectFailed("scripted connect failure".into()).into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        shared.link_id += 1;
        shared.inbound = Some(tx);
        let link_id = shared.link_id;
        drop(shared);
        bump(&self.changes);

        Ok(Link {
            sender: Box::new(MemorySender {
                shared: self.shared.clone(),
                changes: self.changes.clone(),
                link_id,
            }),
            receiver: Box::new(MemoryReceiver { rx }),
        })
    }
}

struct MemorySender {
    shared: Arc<Mutex<Shared>>,
    changes: Arc<watch::Sender<u64>>,
    link_id: u64,
}

#[async_trait]
impl LinkSender for MemorySender {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let delay = lock(&self.shared).send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut shared = lock(&self.shared);
            if shared.link_id != self.link_id || shared.inbound.is_none() {
                return Err(TransportError::Closed("link replaced".into()));
            }
            if shared.fail_sends {
                return Err(TransportError::SendFailed("scripted send failure".into()));
            }
            if let Some(nonce) = wire::parse_probe(&payload) {
                shared.probes += 1;
                if shared.auto_pong {
                    if let Some(inbound) = &shared.inbound {
                        let _ = inbound.send(Ok(wire::probe_response(nonce)));
                    }
                }
            } else {
                shared.sent.push(payload);
            }
        }
        bump(&self.changes);
        Ok(())
    }

    async fn close(&mut self) {
        let mut shared = lock(&self.shared);
        if shared.link_id == self.link_id {
            shared.inbound = None;
        }
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>,
}

#[async_trait]
impl LinkReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await
    }
}

impl MemoryServer {
    /// The next `n` connects fail with a retryable transport error.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.shared).fail_connects = n;
    }

    /// Every connect is rejected as unauthorized until cleared with `None`.
    pub fn reject_auth(&self, message: Option<&str>) {
        lock(&self.shared).reject_auth = message.map(str::to_string);
    }

    /// Connects never complete (exercises the handshake timeout).
    pub fn hang_connects(&self, hang: bool) {
        lock(&self.shared).hang_connects = hang;
    }

    pub fn fail_sends(&self, fail: bool) {
        lock(&self.shared).fail_sends = fail;
    }

    /// Answer heartbeat probes automatically (default on).
    pub fn auto_pong(&self, enabled: bool) {
        lock(&self.shared).auto_pong = enabled;
    }

    pub fn send_delay(&self, delay: Duration) {
        lock(&self.shared).send_delay = delay;
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.shared).inbound.is_some()
    }

    /// Deliver a raw frame on the current link. Returns false when no link is up.
    pub fn push(&self, frame: impl Into<Vec<u8>>) -> bool {
        let shared = lock(&self.shared);
        match &shared.inbound {
            Some(inbound) => inbound.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    pub fn push_json(&self, value: serde_json::Value) -> bool {
        self.push(value.to_string())
    }

    /// Fail the current link as if the network went away.
    pub fn drop_link(&self) {
        let mut shared = lock(&self.shared);
        if let Some(inbound) = shared.inbound.take() {
            let _ = inbound.send(Err(TransportError::Closed("connection reset".into())));
        }
    }

    /// Close the current link cleanly from the server side.
    pub fn close_link(&self) {
        lock(&self.shared).inbound = None;
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        lock(&self.shared).handshakes.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.shared).handshakes.len()
    }

    /// Non-probe frames the client wrote, in write order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).sent.clone()
    }

    pub fn sent_events(&self) -> Vec<DomainEvent> {
        self.sent_frames().iter().map(|f| wire::decode(f)).collect()
    }

    pub fn probes_received(&self) -> u64 {
        lock(&self.shared).probes
    }

    pub async fn wait_for_connect_attempts(&self, n: usize) {
        self.wait_until(|s| s.handshakes.len() >= n).await;
    }

    pub async fn wait_for_link(&self) {
        self.wait_until(|s| s.inbound.is_some()).await;
    }

    pub async fn wait_for_sent(&self, n: usize) {
        self.wait_until(|s| s.sent.len() >= n).await;
    }

    async fn wait_until(&self, cond: impl Fn(&Shared) -> bool) {
        let mut rx = self.changes.subscribe();
        loop {
            if cond(&lock(&self.shared)) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

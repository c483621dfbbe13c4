//! Liveness probing for a connected link.
//!
//! While running, the monitor asks its owner to send a probe every
//! `interval`. The first unanswered probe arms a deadline `interval + timeout`
//! after it; any probe response disarms it. Other inbound traffic does not
//! count as a response. When the deadline passes the monitor signals
//! [`HeartbeatSignal::Expired`] and stops.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSignal {
    /// Send a probe carrying this nonce.
    Probe { generation: u64, nonce: u64 },
    /// The armed deadline elapsed without a response.
    Expired { generation: u64 },
}

impl HeartbeatSignal {
    pub fn generation(&self) -> u64 {
        match self {
            HeartbeatSignal::Probe { generation, .. } | HeartbeatSignal::Expired { generation } => {
                *generation
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    responses: mpsc::UnboundedSender<u64>,
}

/// Each `start` begins a new generation; signals from an older generation
/// may still be queued and should be ignored (see [`HeartbeatMonitor::is_current`]).
pub struct HeartbeatMonitor {
    signals: mpsc::UnboundedSender<HeartbeatSignal>,
    running: Option<Running>,
    generation: u64,
}

impl HeartbeatMonitor {
    pub fn new(signals: mpsc::UnboundedSender<HeartbeatSignal>) -> Self {
        Self {
            signals,
            running: None,
            generation: 0,
        }
    }

    pub fn start(&mut self, interval: Duration, timeout: Duration) {
        self.stop();
        self.generation += 1;

        let cancel = CancellationToken::new();
        let (responses, responses_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_monitor(
            self.generation,
            interval,
            timeout,
            self.signals.clone(),
            responses_rx,
            cancel.clone(),
        ));
        self.running = Some(Running { cancel, responses });
        debug!(generation = self.generation, ?interval, ?timeout, "heartbeat started");
    }

    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            debug!(generation = self.generation, "heartbeat stopped");
        }
    }

    pub fn on_probe_response(&self, nonce: u64) {
        if let Some(running) = &self.running {
            let _ = running.responses.send(nonce);
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.responses.is_closed())
    }

    pub fn is_current(&self, signal: &HeartbeatSignal) -> bool {
        self.running.is_some() && signal.generation() == self.generation
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_monitor(
    generation: u64,
    interval: Duration,
    timeout: Duration,
    signals: mpsc::UnboundedSender<HeartbeatSignal>,
    mut responses: mpsc::UnboundedReceiver<u64>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_nonce = 0u64;
    let mut deadline: Option<Instant> = None;

    loop {
        let armed = deadline;
        let expiry = async move {
            match armed {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(nonce) = responses.recv() => {
                if nonce > 0 && nonce <= last_nonce {
                    deadline = None;
                }
            }

            _ = expiry => {
                warn!(generation, nonce = last_nonce, "heartbeat deadline elapsed");
                let _ = signals.send(HeartbeatSignal::Expired { generation });
                break;
            }

            _ = ticker.tick() => {
                last_nonce += 1;
                if signals.send(HeartbeatSignal::Probe { generation, nonce: last_nonce }).is_err() {
                    break;
                }
                if deadline.is_none() {
                    deadline = Some(Instant::now() + interval + timeout);
                }
            }
        }
    }
}

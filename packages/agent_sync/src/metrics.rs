//! Client metrics for observability
//!
//! Counters are shared by every component of one `SyncClient`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Connection metrics
    /// Links established (initial and resumed)
    pub connects: AtomicU64,
    /// Reconnection attempts started
    pub reconnect_attempts: AtomicU64,
    /// Links torn down because a probe went unanswered
    pub heartbeat_timeouts: AtomicU64,

    // Inbound metrics
    /// Payloads decoded and published by the router
    pub events_routed: AtomicU64,
    /// Payloads that became error observations
    pub protocol_errors: AtomicU64,
    /// Throttled values replaced by a newer one before delivery
    pub events_superseded: AtomicU64,
    pub batches_emitted: AtomicU64,

    // Outbound metrics
    /// Queued actions the transport reported written
    pub actions_sent: AtomicU64,
    /// Queued actions discarded by overflow policy or TTL
    pub actions_dropped: AtomicU64,

    start_time: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_routed(&self, protocol_error: bool) {
        self.events_routed.fetch_add(1, Ordering::Relaxed);
        if protocol_error {
            self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn event_superseded(&self) {
        self.events_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_emitted(&self) {
        self.batches_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn action_sent(&self) {
        self.actions_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn actions_dropped(&self, count: u64) {
        self.actions_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connection: ConnectionMetrics {
                connects: self.connects.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            },
            inbound: InboundMetrics {
                routed: self.events_routed.load(Ordering::Relaxed),
                protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
                superseded: self.events_superseded.load(Ordering::Relaxed),
                batches: self.batches_emitted.load(Ordering::Relaxed),
            },
            outbound: OutboundMetrics {
                sent: self.actions_sent.load(Ordering::Relaxed),
                dropped: self.actions_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connection: ConnectionMetrics,
    pub inbound: InboundMetrics,
    pub outbound: OutboundMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub connects: u64,
    pub reconnect_attempts: u64,
    pub heartbeat_timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMetrics {
    pub routed: u64,
    pub protocol_errors: u64,
    pub superseded: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMetrics {
    pub sent: u64,
    pub dropped: u64,
}

//! Overload-safe dispatch of inbound events to one sequential consumer.
//!
//! Events are sorted into four priority tiers (FIFO within a tier). Types
//! with a batch rule coalesce by `(type, subject)` into one delivery of up to
//! `max_events` members, flushed when full or `window` after the first member
//! arrived. Types with a throttle interval deliver at most one value per
//! subject per interval, always the newest; final/complete events bypass both
//! and are never dropped.
//!
//! The core is synchronous and clock-injected; [`ScheduledEvents`] adapts it
//! to an async pull loop over a router subscription.

mod stream;

pub use stream::ScheduledEvents;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use crate::event::DomainEvent;
use crate::metrics::SyncMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    /// Connection, auth and agent state changes; errors.
    Critical,
    /// Agent responses and user-visible messages.
    High,
    /// Bookkeeping and file metadata.
    Normal,
    /// Telemetry and activity pings.
    Low,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Critical,
        PriorityTier::High,
        PriorityTier::Normal,
        PriorityTier::Low,
    ];

    /// Built-in tier for a type tag.
    pub fn for_type(event_type: &str) -> Self {
        match event_type {
            "error" | "agent_state_changed" | "change_agent_state" | "queue_warning" => {
                PriorityTier::Critical
            }
            "message" | "finish" | "think" | "run" | "browse" | "progress" => PriorityTier::High,
            "activity" => PriorityTier::Low,
            _ => PriorityTier::Normal,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchRule {
    pub max_events: usize,
    pub window: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Tier overrides by type tag.
    pub priorities: BTreeMap<String, PriorityTier>,
    pub batching: BTreeMap<String, BatchRule>,
    pub throttling: BTreeMap<String, Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priorities: BTreeMap::new(),
            batching: BTreeMap::from([(
                "file_changed".to_string(),
                BatchRule {
                    max_events: 20,
                    window: Duration::from_millis(500),
                },
            )]),
            throttling: BTreeMap::from([("progress".to_string(), Duration::from_millis(250))]),
        }
    }
}

impl SchedulerConfig {
    pub fn tier_of(&self, event: &DomainEvent) -> PriorityTier {
        let tag = event.type_tag();
        if event.is_error() {
            return PriorityTier::Critical;
        }
        self.priorities
            .get(tag)
            .copied()
            .unwrap_or_else(|| PriorityTier::for_type(tag))
    }
}

/// One unit handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Single(DomainEvent),
    Batch {
        event_type: String,
        subject: Option<String>,
        events: Vec<DomainEvent>,
    },
}

impl Delivery {
    pub fn events(&self) -> &[DomainEvent] {
        match self {
            Delivery::Single(event) => std::slice::from_ref(event),
            Delivery::Batch { events, .. } => events,
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    fn is_final(&self) -> bool {
        matches!(self, Delivery::Single(event) if event.is_final())
    }
}

type GroupKey = (String, Option<String>);

fn group_key(event: &DomainEvent) -> GroupKey {
    (event.type_tag().to_string(), event.subject().map(str::to_string))
}

struct Ready {
    seq: u64,
    delivery: Delivery,
}

struct OpenBatch {
    tier: PriorityTier,
    deadline: Instant,
    max_events: usize,
    events: Vec<DomainEvent>,
}

#[derive(Default)]
struct ThrottleSlot {
    last_emit: Option<Instant>,
    /// Ready-queue entry holding this subject's not yet drained value.
    queued: Option<(PriorityTier, u64)>,
    held: Option<DomainEvent>,
}

pub struct EventPriorityScheduler {
    config: SchedulerConfig,
    ready: [VecDeque<Ready>; 4],
    batches: HashMap<GroupKey, OpenBatch>,
    throttles: HashMap<GroupKey, ThrottleSlot>,
    next_seq: u64,
    metrics: Option<Arc<SyncMetrics>>,
}

impl EventPriorityScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            ready: Default::default(),
            batches: HashMap::new(),
            throttles: HashMap::new(),
            next_seq: 0,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn submit(&mut self, event: DomainEvent, now: Instant) {
        let tier = self.config.tier_of(&event);
        let tag = event.type_tag();

        if let Some(rule) = self.config.batching.get(tag).cloned() {
            self.submit_batched(event, tier, rule, now);
        } else if let Some(interval) = self.config.throttling.get(tag).copied() {
            self.submit_throttled(event, tier, interval, now);
        } else {
            self.push_ready(tier, Delivery::Single(event));
        }
    }

    /// Next delivery due at `now`, highest tier first.
    pub fn drain(&mut self, now: Instant) -> Option<Delivery> {
        self.advance(now);
        for queue in &mut self.ready {
            if let Some(ready) = queue.pop_front() {
                self.clear_queued_marker(ready.seq);
                return Some(ready.delivery);
            }
        }
        None
    }

    /// Earliest instant at which a batch flushes or a held value is released.
    pub fn next_deadline(&self) -> Option<Instant> {
        let batch = self.batches.values().map(|b| b.deadline).min();
        let throttle = self
            .throttles
            .iter()
            .filter(|(_, slot)| slot.held.is_some())
            .filter_map(|((tag, _), slot)| {
                let interval = self.config.throttling.get(tag)?;
                slot.last_emit.map(|at| at + *interval)
            })
            .min();
        match (batch, throttle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Move every open batch and held value into the ready queues.
    pub fn flush_all(&mut self) {
        let mut keys: Vec<_> = self
            .batches
            .iter()
            .map(|(k, b)| (b.deadline, k.clone()))
            .collect();
        keys.sort();
        for (_, key) in keys {
            self.flush_batch(&key);
        }

        let held: Vec<_> = self
            .throttles
            .iter_mut()
            .filter_map(|(key, slot)| slot.held.take().map(|e| (key.clone(), e)))
            .collect();
        for (key, event) in held {
            let tier = self.config.tier_of(&event);
            let seq = self.push_ready(tier, Delivery::Single(event));
            if let Some(slot) = self.throttles.get_mut(&key) {
                slot.queued = Some((tier, seq));
            }
        }
    }

    /// Events waiting in ready queues, open batches and throttle slots.
    pub fn pending(&self) -> usize {
        let ready: usize = self
            .ready
            .iter()
            .flat_map(|q| q.iter())
            .map(|r| r.delivery.len())
            .sum();
        let batched: usize = self.batches.values().map(|b| b.events.len()).sum();
        let held = self.throttles.values().filter(|s| s.held.is_some()).count();
        ready + batched + held
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    fn submit_batched(
        &mut self,
        event: DomainEvent,
        tier: PriorityTier,
        rule: BatchRule,
        now: Instant,
    ) {
        let key = group_key(&event);
        if event.is_final() {
            // Finals are never coalesced; flush what came before to keep order.
            self.flush_batch(&key);
            self.push_ready(tier, Delivery::Single(event));
            return;
        }

        let batch = self.batches.entry(key.clone()).or_insert_with(|| OpenBatch {
            tier,
            deadline: now + rule.window,
            max_events: rule.max_events.max(1),
            events: Vec::new(),
        });
        batch.events.push(event);
        if batch.events.len() >= batch.max_events {
            self.flush_batch(&key);
        }
    }

    fn submit_throttled(
        &mut self,
        event: DomainEvent,
        tier: PriorityTier,
        interval: Duration,
        now: Instant,
    ) {
        let key = group_key(&event);
        let slot = self.throttles.entry(key.clone()).or_default();
        let queued = slot.queued.take();
        let held = slot.held.take();
        let last_emit = slot.last_emit;

        if event.is_final() {
            let mut superseded = u64::from(held.is_some());
            if let Some((queued_tier, seq)) = queued {
                superseded += u64::from(self.remove_ready(queued_tier, seq));
            }
            self.count_superseded(superseded);
            // A final is never superseded, so it is not tracked as queued.
            self.push_ready(tier, Delivery::Single(event));
            if let Some(slot) = self.throttles.get_mut(&key) {
                slot.last_emit = Some(now);
            }
            return;
        }

        // Newer value for a subject that is still waiting in the ready queue.
        if let Some((queued_tier, seq)) = queued {
            if self.replace_ready(queued_tier, seq, &event) {
                self.count_superseded(1);
                if let Some(slot) = self.throttles.get_mut(&key) {
                    slot.queued = Some((queued_tier, seq));
                }
                return;
            }
        }

        let open = last_emit.is_none_or(|at| now >= at + interval);
        if open && held.is_none() {
            let seq = self.push_ready(tier, Delivery::Single(event));
            if let Some(slot) = self.throttles.get_mut(&key) {
                slot.last_emit = Some(now);
                slot.queued = Some((tier, seq));
            }
        } else {
            self.count_superseded(u64::from(held.is_some()));
            if let Some(slot) = self.throttles.get_mut(&key) {
                slot.held = Some(event);
            }
        }
    }

    fn advance(&mut self, now: Instant) {
        let mut due: Vec<_> = self
            .batches
            .iter()
            .filter(|(_, b)| b.deadline <= now)
            .map(|(k, b)| (b.deadline, k.clone()))
            .collect();
        due.sort();
        for (_, key) in due {
            self.flush_batch(&key);
        }

        let mut released = Vec::new();
        for ((tag, subject), slot) in &mut self.throttles {
            let Some(interval) = self.config.throttling.get(tag).copied() else {
                continue;
            };
            let Some(last) = slot.last_emit else {
                continue;
            };
            if slot.held.is_some() && now >= last + interval {
                if let Some(event) = slot.held.take() {
                    slot.last_emit = Some(last + interval);
                    released.push(((tag.clone(), subject.clone()), event));
                }
            }
        }
        for (key, event) in released {
            let tier = self.config.tier_of(&event);
            let seq = self.push_ready(tier, Delivery::Single(event));
            if let Some(slot) = self.throttles.get_mut(&key) {
                slot.queued = Some((tier, seq));
            }
        }

        let throttling = &self.config.throttling;
        self.throttles.retain(|(tag, _), slot| {
            let idle_after = throttling.get(tag).copied().unwrap_or_default();
            slot.held.is_some()
                || slot.queued.is_some()
                || slot.last_emit.is_some_and(|at| now < at + idle_after)
        });
    }

    fn flush_batch(&mut self, key: &GroupKey) {
        let Some(batch) = self.batches.remove(key) else {
            return;
        };
        let mut events = batch.events;
        let delivery = if events.len() == 1 {
            match events.pop() {
                Some(event) => Delivery::Single(event),
                None => return,
            }
        } else if events.is_empty() {
            return;
        } else {
            if let Some(metrics) = &self.metrics {
                metrics.batch_emitted();
            }
            trace!(event_type = %key.0, size = events.len(), "batch flushed");
            Delivery::Batch {
                event_type: key.0.clone(),
                subject: key.1.clone(),
                events,
            }
        };
        self.push_ready(batch.tier, delivery);
    }

    fn push_ready(&mut self, tier: PriorityTier, delivery: Delivery) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.ready[tier.index()].push_back(Ready { seq, delivery });
        seq
    }

    fn replace_ready(&mut self, tier: PriorityTier, seq: u64, event: &DomainEvent) -> bool {
        match self.ready[tier.index()]
            .iter_mut()
            .find(|r| r.seq == seq && !r.delivery.is_final())
        {
            Some(ready) => {
                ready.delivery = Delivery::Single(event.clone());
                true
            }
            None => false,
        }
    }

    fn remove_ready(&mut self, tier: PriorityTier, seq: u64) -> bool {
        let queue = &mut self.ready[tier.index()];
        let before = queue.len();
        queue.retain(|r| r.seq != seq || r.delivery.is_final());
        queue.len() != before
    }

    fn clear_queued_marker(&mut self, seq: u64) {
        for slot in self.throttles.values_mut() {
            if slot.queued.is_some_and(|(_, s)| s == seq) {
                slot.queued = None;
                return;
            }
        }
    }

    fn count_superseded(&self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(metrics) = &self.metrics {
            for _ in 0..n {
                metrics.event_superseded();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::observation::{
        ActivityExtras, FileChange, FileChangedExtras, ProgressExtras,
    };
    use crate::event::{Action, AgentState, ObservationKind};
    use crate::event::observation::AgentStateExtras;

    fn file_changed(path: &str) -> DomainEvent {
        DomainEvent::local_observation(
            "",
            ObservationKind::FileChanged(FileChangedExtras {
                path: path.into(),
                change: FileChange::Modified,
            }),
        )
    }

    fn progress(text: &str, complete: bool) -> DomainEvent {
        DomainEvent::local_observation(
            text,
            ObservationKind::Progress(ProgressExtras {
                subject: "reply".into(),
                complete,
            }),
        )
    }

    fn activity() -> DomainEvent {
        DomainEvent::local_observation("", ObservationKind::Activity(ActivityExtras {}))
    }

    fn state_changed() -> DomainEvent {
        DomainEvent::local_observation(
            "",
            ObservationKind::AgentStateChanged(AgentStateExtras {
                agent_state: AgentState::Running,
                reason: None,
            }),
        )
    }

    fn content(delivery: Delivery) -> String {
        match delivery {
            Delivery::Single(event) => event.as_observation().unwrap().content.clone(),
            other => panic!("expected single, got {other:?}"),
        }
    }

    #[test]
    fn higher_tiers_drain_first_fifo_within_tier() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let now = Instant::now();
        let mut first_msg = DomainEvent::user_action(Action::message("one"));
        first_msg.id = Some(1);
        let mut second_msg = DomainEvent::user_action(Action::message("two"));
        second_msg.id = Some(2);

        s.submit(activity(), now);
        s.submit(first_msg, now);
        s.submit(state_changed(), now);
        s.submit(second_msg, now);

        let order: Vec<_> = std::iter::from_fn(|| s.drain(now))
            .map(|d| {
                let e = &d.events()[0];
                (e.type_tag().to_string(), e.id)
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("agent_state_changed".to_string(), None),
                ("message".to_string(), Some(1)),
                ("message".to_string(), Some(2)),
                ("activity".to_string(), None),
            ]
        );
    }

    #[test]
    fn tier_overrides_apply() {
        let mut config = SchedulerConfig::default();
        config
            .priorities
            .insert("activity".into(), PriorityTier::Critical);
        assert_eq!(config.tier_of(&activity()), PriorityTier::Critical);
    }

    #[test]
    fn five_quick_file_changes_become_one_batch() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let t0 = Instant::now();
        for i in 0..5 {
            s.submit(file_changed("src/lib.rs"), t0 + Duration::from_millis(i * 50));
        }

        assert!(s.drain(t0 + Duration::from_millis(300)).is_none());
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_millis(500)));

        match s.drain(t0 + Duration::from_millis(500)) {
            Some(Delivery::Batch {
                event_type,
                subject,
                events,
            }) => {
                assert_eq!(event_type, "file_changed");
                assert_eq!(subject.as_deref(), Some("src/lib.rs"));
                assert_eq!(events.len(), 5);
            }
            other => panic!("expected batch, got {other:?}"),
        }
        assert!(s.is_empty());
    }

    #[test]
    fn spaced_file_changes_are_delivered_individually() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let t0 = Instant::now();
        for i in 0..3 {
            let at = t0 + Duration::from_millis(i * 600);
            s.submit(file_changed("a.txt"), at);
            let delivered = s.drain(at + Duration::from_millis(500));
            assert!(matches!(delivered, Some(Delivery::Single(_))));
        }
    }

    #[test]
    fn batch_flushes_when_full() {
        let mut config = SchedulerConfig::default();
        config.batching.insert(
            "file_changed".into(),
            BatchRule {
                max_events: 3,
                window: Duration::from_secs(10),
            },
        );
        let mut s = EventPriorityScheduler::new(config);
        let now = Instant::now();
        for _ in 0..4 {
            s.submit(file_changed("a.txt"), now);
        }
        assert_eq!(s.drain(now).map(|d| d.len()), Some(3));
        assert!(s.drain(now).is_none());
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn batches_are_per_subject() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let now = Instant::now();
        s.submit(file_changed("a.txt"), now);
        s.submit(file_changed("b.txt"), now);
        s.submit(file_changed("a.txt"), now);

        let later = now + Duration::from_millis(500);
        let sizes: Vec<_> = std::iter::from_fn(|| s.drain(later))
            .map(|d| d.len())
            .collect();
        let mut sorted = sizes.clone();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2]);
    }

    #[test]
    fn throttle_keeps_only_latest_value() {
        let metrics = Arc::new(SyncMetrics::new());
        let mut s =
            EventPriorityScheduler::new(SchedulerConfig::default()).with_metrics(metrics.clone());
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        s.submit(progress("p1", false), t0);
        s.submit(progress("p2", false), t0 + ms(10));
        assert_eq!(content(s.drain(t0 + ms(10)).unwrap()), "p2");

        s.submit(progress("p3", false), t0 + ms(20));
        s.submit(progress("p4", false), t0 + ms(30));
        assert!(s.drain(t0 + ms(40)).is_none());
        assert_eq!(s.next_deadline(), Some(t0 + ms(250)));
        assert_eq!(content(s.drain(t0 + ms(250)).unwrap()), "p4");

        assert_eq!(
            metrics
                .events_superseded
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn final_value_is_never_throttled() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        s.submit(progress("p1", false), t0);
        assert_eq!(content(s.drain(t0).unwrap()), "p1");

        s.submit(progress("p2", false), t0 + ms(10));
        s.submit(progress("done", true), t0 + ms(20));

        assert_eq!(content(s.drain(t0 + ms(20)).unwrap()), "done");
        assert!(s.drain(t0 + ms(1000)).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn final_value_survives_a_later_update() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        s.submit(progress("done", true), t0);
        s.submit(progress("next", false), t0 + ms(10));

        let drained: Vec<_> = std::iter::from_fn(|| s.drain(t0 + ms(1000)))
            .map(content)
            .collect();
        assert_eq!(drained, vec!["done", "next"]);
    }

    #[test]
    fn consecutive_finals_are_all_delivered() {
        let metrics = Arc::new(SyncMetrics::new());
        let mut s =
            EventPriorityScheduler::new(SchedulerConfig::default()).with_metrics(metrics.clone());
        let t0 = Instant::now();

        s.submit(progress("first", true), t0);
        s.submit(progress("second", true), t0);

        let drained: Vec<_> = std::iter::from_fn(|| s.drain(t0)).map(content).collect();
        assert_eq!(drained, vec!["first", "second"]);
        assert_eq!(
            metrics
                .events_superseded
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn final_file_change_is_not_coalesced() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let now = Instant::now();
        let mut final_change = file_changed("a.txt");
        if let crate::event::EventKind::Observation(obs) = &mut final_change.kind {
            obs.kind = ObservationKind::Unknown {
                observation_type: "file_changed".into(),
                extras: serde_json::json!({"path": "a.txt", "final": true})
                    .as_object()
                    .cloned()
                    .unwrap(),
            };
        }

        s.submit(file_changed("a.txt"), now);
        s.submit(final_change, now);

        assert!(matches!(s.drain(now), Some(Delivery::Single(e)) if !e.is_final()));
        assert!(matches!(s.drain(now), Some(Delivery::Single(e)) if e.is_final()));
    }

    #[test]
    fn flush_all_releases_everything() {
        let mut s = EventPriorityScheduler::new(SchedulerConfig::default());
        let now = Instant::now();
        s.submit(file_changed("a.txt"), now);
        s.submit(file_changed("a.txt"), now);
        s.submit(progress("p1", false), now);
        assert_eq!(content(s.drain(now).unwrap()), "p1");
        s.submit(progress("p2", false), now);

        s.flush_all();
        assert_eq!(s.pending(), 3);
        let drained: Vec<_> = std::iter::from_fn(|| s.drain(now)).collect();
        assert_eq!(drained.len(), 2);
    }
}

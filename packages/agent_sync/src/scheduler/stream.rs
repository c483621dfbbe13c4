use futures::Stream;
use tokio::time::Instant;

use super::{Delivery, EventPriorityScheduler};
use crate::router::EventSubscription;

/// Pulls routed events through a scheduler: `next()` yields the most urgent
/// delivery, sleeping until the next batch/throttle deadline when nothing
/// is due yet.
pub struct ScheduledEvents {
    subscription: EventSubscription,
    scheduler: EventPriorityScheduler,
    closed: bool,
}

impl ScheduledEvents {
    pub fn new(subscription: EventSubscription, scheduler: EventPriorityScheduler) -> Self {
        Self {
            subscription,
            scheduler,
            closed: false,
        }
    }

    /// `None` once the router is gone and everything pending was delivered.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            while let Some(event) = self.subscription.try_recv() {
                self.scheduler.submit(event, Instant::now());
            }
            if let Some(delivery) = self.scheduler.drain(Instant::now()) {
                return Some(delivery);
            }
            if self.closed {
                self.scheduler.flush_all();
                return self.scheduler.drain(Instant::now());
            }

            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                event = self.subscription.recv() => match event {
                    Some(event) => self.scheduler.submit(event, Instant::now()),
                    None => self.closed = true,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + 'static {
        futures::stream::unfold(self, |mut scheduled| async move {
            scheduled.next().await.map(|d| (d, scheduled))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::observation::{FileChange, FileChangedExtras};
    use crate::event::{DomainEvent, EventFilter, ObservationKind};
    use crate::metrics::SyncMetrics;
    use crate::router::EventRouter;
    use crate::scheduler::SchedulerConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn file_changed(path: &str) -> DomainEvent {
        DomainEvent::local_observation(
            "",
            ObservationKind::FileChanged(FileChangedExtras {
                path: path.into(),
                change: FileChange::Created,
            }),
        )
    }

    fn scheduled() -> (EventRouter, ScheduledEvents) {
        let router = EventRouter::new(Arc::new(SyncMetrics::new()));
        let scheduled = ScheduledEvents::new(
            router.subscribe(EventFilter::All),
            EventPriorityScheduler::new(SchedulerConfig::default()),
        );
        (router, scheduled)
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_the_batch_window() {
        let (router, mut scheduled) = scheduled();
        let start = Instant::now();
        for _ in 0..5 {
            router.inject(file_changed("notes.md"));
        }

        let delivery = scheduled.next().await.unwrap();
        assert_eq!(delivery.len(), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_event_overtakes_open_batch() {
        let (router, mut scheduled) = scheduled();
        router.inject(file_changed("notes.md"));

        let router2 = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            router2.inject(DomainEvent::user_action(crate::event::Action::message("hi")));
        });

        let first = scheduled.next().await.unwrap();
        assert_eq!(first.events()[0].type_tag(), "message");
        let second = scheduled.next().await.unwrap();
        assert_eq!(second.events()[0].type_tag(), "file_changed");
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_pending_when_router_goes_away() {
        let (router, mut scheduled) = scheduled();
        router.inject(file_changed("a"));
        router.inject(file_changed("a"));
        drop(router);

        assert_eq!(scheduled.next().await.map(|d| d.len()), Some(2));
        assert!(scheduled.next().await.is_none());
    }
}

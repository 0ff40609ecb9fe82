//! Delivery worker threads
//!
//! Each worker pulls events from the shared [`DeliveryQueue`] and hands them
//! to the sink. A failed delivery is retried with bounded exponential
//! backoff; once `max_attempts` is exhausted the event goes to the
//! dead-letter sink, or is discarded with a counter when none is configured.
//!
//! Workers exit when the stop signal fires (the coordinator only fires it
//! once the queue is drained) or when the queue is abandoned. Retry sleeps
//! wake immediately on abandonment and the in-flight event is handed back
//! as undelivered.

use super::queue::DeliveryQueue;
use super::sink::EventSink;
use crate::backoff::Backoff;
use crate::config::DeliverySettings;
use crate::shutdown::ShutdownSignal;
use crate::types::PresenceEvent;
use crossbeam_channel::select;
use std::sync::Arc;
use std::thread::JoinHandle;

/// One delivery worker
pub struct DeliveryWorker {
    name: String,
    queue: DeliveryQueue,
    sink: Arc<dyn EventSink>,
    dead_letter: Option<Arc<dyn EventSink>>,
    settings: DeliverySettings,
    stop: ShutdownSignal,
}

impl DeliveryWorker {
    pub fn new(
        index: usize,
        queue: DeliveryQueue,
        sink: Arc<dyn EventSink>,
        dead_letter: Option<Arc<dyn EventSink>>,
        settings: DeliverySettings,
        stop: ShutdownSignal,
    ) -> Self {
        Self {
            name: format!("delivery-{index}"),
            queue,
            sink,
            dead_letter,
            settings,
            stop,
        }
    }

    /// Run the worker on its own thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || self.run())
    }

    pub fn run(self) {
        tracing::debug!("{} started", self.name);
        let abandoned = self.queue.abandon_signal().clone();
        loop {
            select! {
                recv(self.queue.receiver()) -> msg => match msg {
                    Ok(event) => self.process(event),
                    Err(_) => break,
                },
                recv(self.stop.receiver()) -> _ => break,
                recv(abandoned.receiver()) -> _ => break,
            }
        }
        tracing::debug!("{} stopped", self.name);
    }

    /// Deliver one event, retrying and dead-lettering as configured
    pub fn process(&self, event: PresenceEvent) {
        if self.queue.is_abandoned() {
            self.queue.return_undelivered(event);
            return;
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut backoff = Backoff::new(self.settings.initial_backoff(), self.settings.max_backoff());
        let mut attempt = 1;

        loop {
            match self.sink.deliver(&event) {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::debug!(
                            "{}: event {} delivered on attempt {}",
                            self.name,
                            event.event_id,
                            attempt
                        );
                    }
                    self.queue.mark_delivered();
                    return;
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        "{}: event {} failed after {} attempts: {}",
                        self.name,
                        event.event_id,
                        attempt,
                        e
                    );
                    self.dead_letter(event);
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "{}: delivery attempt {}/{} for event {} failed: {} (retrying in {:?})",
                        self.name,
                        attempt,
                        max_attempts,
                        event.event_id,
                        e,
                        delay
                    );
                    self.queue.record_retry();
                    if self.queue.abandon_signal().wait_timeout(delay) {
                        self.queue.return_undelivered(event);
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn dead_letter(&self, event: PresenceEvent) {
        let Some(dead_letter) = &self.dead_letter else {
            tracing::error!(
                "{}: discarding event {} ({} from {})",
                self.name,
                event.event_id,
                event.tag_id,
                event.reader_id
            );
            self.queue.mark_discarded();
            return;
        };

        match dead_letter.deliver(&event) {
            Ok(()) => {
                tracing::error!("{}: event {} dead-lettered", self.name, event.event_id);
                self.queue.mark_dead_lettered();
            }
            Err(e) => {
                tracing::error!(
                    "{}: dead-letter sink rejected event {}: {}; discarding",
                    self.name,
                    event.event_id,
                    e
                );
                self.queue.mark_discarded();
            }
        }
    }
}

/// Spawn `settings.workers` delivery workers
pub fn spawn_workers(
    queue: &DeliveryQueue,
    sink: Arc<dyn EventSink>,
    dead_letter: Option<Arc<dyn EventSink>>,
    settings: &DeliverySettings,
    stop: &ShutdownSignal,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..settings.workers.max(1))
        .map(|index| {
            DeliveryWorker::new(
                index,
                queue.clone(),
                sink.clone(),
                dead_letter.clone(),
                settings.clone(),
                stop.clone(),
            )
            .spawn()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::delivery::sink::MockEventSink;
    use crate::error::RfidError;
    use crate::shutdown::shutdown_pair;
    use crate::types::{FlushReason, TagId, Timestamp};
    use mockall::predicate::always;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn event() -> PresenceEvent {
        let ts = Timestamp::now();
        PresenceEvent {
            event_id: Uuid::new_v4(),
            tag_id: TagId::from("AB01"),
            reader_id: "r1".into(),
            antenna: 0,
            first_seen: ts,
            last_seen: ts,
            read_count: 2,
            peak_rssi: None,
            reason: FlushReason::WindowClosed,
        }
    }

    fn fast_settings(max_attempts: u32) -> DeliverySettings {
        DeliverySettings {
            workers: 1,
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        }
    }

    fn worker(
        sink: MockEventSink,
        dead_letter: Option<MockEventSink>,
        max_attempts: u32,
    ) -> (DeliveryWorker, DeliveryQueue) {
        let queue = DeliveryQueue::new(&QueueSettings::default());
        let dead_letter = dead_letter.map(|d| Arc::new(d) as Arc<dyn EventSink>);
        let worker = DeliveryWorker::new(
            0,
            queue.clone(),
            Arc::new(sink),
            dead_letter,
            fast_settings(max_attempts),
            ShutdownSignal::never(),
        );
        (worker, queue)
    }

    fn enqueue_and_take(queue: &DeliveryQueue) -> PresenceEvent {
        queue.enqueue(event()).unwrap();
        queue.receiver().recv().unwrap()
    }

    #[test]
    fn test_fails_twice_then_delivers_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut sink = MockEventSink::new();
        sink.expect_deliver().with(always()).times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RfidError::Delivery("sink offline".into()))
            } else {
                Ok(())
            }
        });

        let (worker, queue) = worker(sink, None, 5);
        let event = enqueue_and_take(&queue);
        worker.process(event);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.discarded, 0);
        assert!(queue.is_drained());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_event_is_dead_lettered() {
        let mut sink = MockEventSink::new();
        sink.expect_deliver()
            .times(3)
            .returning(|_| Err(RfidError::Delivery("rejected".into())));
        let mut dead_letter = MockEventSink::new();
        dead_letter.expect_deliver().times(1).returning(|_| Ok(()));

        let (worker, queue) = worker(sink, Some(dead_letter), 3);
        let event = enqueue_and_take(&queue);
        worker.process(event);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.delivered, 0);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_exhausted_event_discarded_without_dead_letter() {
        let mut sink = MockEventSink::new();
        sink.expect_deliver()
            .times(2)
            .returning(|_| Err(RfidError::Delivery("rejected".into())));

        let (worker, queue) = worker(sink, None, 2);
        let event = enqueue_and_take(&queue);
        worker.process(event);

        assert_eq!(queue.snapshot().discarded, 1);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_abandonment_interrupts_retry() {
        let mut sink = MockEventSink::new();
        sink.expect_deliver()
            .returning(|_| Err(RfidError::Delivery("down".into())));

        let queue = DeliveryQueue::new(&QueueSettings::default());
        let worker = DeliveryWorker::new(
            0,
            queue.clone(),
            Arc::new(sink),
            None,
            DeliverySettings {
                max_attempts: 100,
                initial_backoff_ms: 10_000,
                max_backoff_ms: 10_000,
                ..Default::default()
            },
            ShutdownSignal::never(),
        );
        let event = enqueue_and_take(&queue);
        let handle = std::thread::spawn(move || worker.process(event));

        std::thread::sleep(Duration::from_millis(50));
        queue.abandon();
        handle.join().unwrap();

        assert_eq!(queue.take_stranded().len(), 1);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_worker_thread_drains_queue_then_stops() {
        let mut sink = MockEventSink::new();
        sink.expect_deliver().times(10).returning(|_| Ok(()));

        let queue = DeliveryQueue::new(&QueueSettings::default());
        let (stop_trigger, stop) = shutdown_pair();
        let handles = spawn_workers(&queue, Arc::new(sink), None, &fast_settings(3), &stop).unwrap();

        for _ in 0..10 {
            queue.enqueue(event()).unwrap();
        }
        assert!(queue.wait_drained(Duration::from_secs(5)));
        stop_trigger.trigger();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.snapshot().delivered, 10);
    }
}

//! Bounded delivery queue
//!
//! A crossbeam bounded channel shared by every reader lane (producers) and
//! the delivery workers (consumers). The overflow policy decides what a
//! producer does when the channel is full.
//!
//! `outstanding` counts events that were accepted but have not reached a
//! terminal outcome (delivered, dead-lettered, discarded, dropped or
//! stranded). The queue is drained when it reaches zero.

use crate::config::{OverflowPolicy, QueueSettings};
use crate::dedup::PresenceEmitter;
use crate::error::{Result, RfidError};
use crate::shutdown::{shutdown_pair, ShutdownSignal, ShutdownTrigger};
use crate::types::PresenceEvent;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of a stalled producer's abandonment check
const STALL_POLL: Duration = Duration::from_millis(25);

/// Counters shared by producers and workers
#[derive(Debug, Default)]
struct QueueMetrics {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    abandoned: AtomicU64,
    stalls: AtomicU64,
    outstanding: AtomicUsize,
    sustained_full: AtomicBool,
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub retries: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub abandoned: u64,
    pub stalls: u64,
    /// A producer is currently stalled past the report interval
    pub sustained_full: bool,
}

struct QueueShared {
    sender: Sender<PresenceEvent>,
    receiver: Receiver<PresenceEvent>,
    capacity: usize,
    overflow: OverflowPolicy,
    stall_report: Duration,
    metrics: QueueMetrics,
    abandon_trigger: ShutdownTrigger,
    abandon_signal: ShutdownSignal,
    stranded: Mutex<Vec<PresenceEvent>>,
}

/// Handle to the shared delivery queue
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<QueueShared>,
}

impl DeliveryQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        let capacity = settings.capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let (abandon_trigger, abandon_signal) = shutdown_pair();
        Self {
            shared: Arc::new(QueueShared {
                sender,
                receiver,
                capacity,
                overflow: settings.overflow,
                stall_report: settings.stall_report(),
                metrics: QueueMetrics::default(),
                abandon_trigger,
                abandon_signal,
                stranded: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Producer handle for a reader lane
    pub fn producer(&self) -> QueueProducer {
        QueueProducer {
            queue: self.clone(),
        }
    }

    /// Enqueue without waiting; fails with `QueueFull` when at capacity
    pub fn try_enqueue(&self, event: PresenceEvent) -> Result<()> {
        if self.is_abandoned() {
            self.strand(event);
            return Err(self.full());
        }
        let metrics = &self.shared.metrics;
        metrics.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.shared.sender.try_send(event) {
            Ok(()) => {
                metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
                Err(self.full())
            }
        }
    }

    /// Enqueue applying the configured overflow policy
    pub fn enqueue(&self, event: PresenceEvent) -> Result<()> {
        if self.is_abandoned() {
            self.strand(event);
            return Err(self.full());
        }
        self.shared.metrics.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.shared.overflow {
            OverflowPolicy::Backpressure => self.enqueue_blocking(event),
            OverflowPolicy::DropOldest => self.enqueue_lossy(event),
        }
    }

    fn enqueue_blocking(&self, mut event: PresenceEvent) -> Result<()> {
        let metrics = &self.shared.metrics;
        let started = Instant::now();
        let mut reported = false;

        loop {
            match self.shared.sender.send_timeout(event, STALL_POLL) {
                Ok(()) => {
                    metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                    if reported {
                        metrics.sustained_full.store(false, Ordering::Relaxed);
                        tracing::info!("Delivery queue stall cleared after {:?}", started.elapsed());
                    }
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    event = returned;
                    if self.is_abandoned() {
                        // Counted as stranded rather than outstanding
                        metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
                        self.strand(event);
                        return Err(self.full());
                    }
                    if !reported && started.elapsed() >= self.shared.stall_report {
                        reported = true;
                        metrics.stalls.fetch_add(1, Ordering::Relaxed);
                        metrics.sustained_full.store(true, Ordering::Relaxed);
                        tracing::warn!(
                            "Delivery queue full ({} events), producer stalled for {:?}",
                            self.shared.capacity,
                            started.elapsed()
                        );
                    }
                }
                Err(SendTimeoutError::Disconnected(returned)) => {
                    metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
                    self.strand(returned);
                    return Err(RfidError::Channel("delivery queue disconnected".into()));
                }
            }
        }
    }

    fn enqueue_lossy(&self, mut event: PresenceEvent) -> Result<()> {
        let metrics = &self.shared.metrics;
        loop {
            match self.shared.sender.try_send(event) {
                Ok(()) => {
                    metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    if let Ok(oldest) = self.shared.receiver.try_recv() {
                        metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
                        metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "Delivery queue full, dropped oldest event {} ({} from {})",
                            oldest.event_id,
                            oldest.tag_id,
                            oldest.reader_id
                        );
                    }
                }
                Err(TrySendError::Disconnected(returned)) => {
                    metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
                    self.strand(returned);
                    return Err(RfidError::Channel("delivery queue disconnected".into()));
                }
            }
        }
    }

    /// Receiving half for delivery workers
    pub fn receiver(&self) -> &Receiver<PresenceEvent> {
        &self.shared.receiver
    }

    pub fn mark_delivered(&self) {
        self.shared.metrics.delivered.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_dead_lettered(&self) {
        self.shared.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_discarded(&self) {
        self.shared.metrics.discarded.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.shared.metrics.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand back an in-flight event that will not be delivered
    pub fn return_undelivered(&self, event: PresenceEvent) {
        self.shared.metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.strand(event);
    }

    fn strand(&self, event: PresenceEvent) {
        self.shared.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
        self.shared.stranded.lock().push(event);
    }

    /// Stop delivery: workers stop retrying and queued events are stranded
    pub fn abandon(&self) {
        if self.is_abandoned() {
            return;
        }
        self.shared.abandon_trigger.trigger();
        let count = self.strand_queued();
        tracing::error!("Delivery queue abandoned with {} queued events", count);
    }

    fn strand_queued(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.shared.receiver.try_recv() {
            self.shared.metrics.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.strand(event);
            count += 1;
        }
        count
    }

    pub fn is_abandoned(&self) -> bool {
        self.shared.abandon_trigger.is_triggered()
    }

    /// Fires when the queue is abandoned
    pub fn abandon_signal(&self) -> &ShutdownSignal {
        &self.shared.abandon_signal
    }

    /// Events that could not be delivered, emptied by this call
    pub fn take_stranded(&self) -> Vec<PresenceEvent> {
        // A stalled producer can land its event just after abandonment
        if self.is_abandoned() {
            self.strand_queued();
        }
        std::mem::take(&mut *self.shared.stranded.lock())
    }

    pub fn len(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// No queued and no in-flight events
    pub fn is_drained(&self) -> bool {
        self.shared.metrics.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Wait until drained; returns false on timeout
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_drained() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let m = &self.shared.metrics;
        let depth = self.len();
        QueueSnapshot {
            depth,
            capacity: self.shared.capacity,
            in_flight: m.outstanding.load(Ordering::SeqCst).saturating_sub(depth),
            enqueued: m.enqueued.load(Ordering::Relaxed),
            delivered: m.delivered.load(Ordering::Relaxed),
            retries: m.retries.load(Ordering::Relaxed),
            dropped: m.dropped.load(Ordering::Relaxed),
            dead_lettered: m.dead_lettered.load(Ordering::Relaxed),
            discarded: m.discarded.load(Ordering::Relaxed),
            abandoned: m.abandoned.load(Ordering::Relaxed),
            stalls: m.stalls.load(Ordering::Relaxed),
            sustained_full: m.sustained_full.load(Ordering::Relaxed),
        }
    }

    fn full(&self) -> RfidError {
        RfidError::QueueFull {
            capacity: self.shared.capacity,
        }
    }
}

/// Producer side of the queue, handed to each reader's dedup window
#[derive(Clone)]
pub struct QueueProducer {
    queue: DeliveryQueue,
}

impl PresenceEmitter for QueueProducer {
    fn emit(&self, event: PresenceEvent) -> Result<()> {
        self.queue.enqueue(event)
    }
}

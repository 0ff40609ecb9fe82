//! Windowed deduplication of tag reads
//!
//! Repeated reads of the same tag within a window are coalesced into one
//! [`PresenceEvent`]. The working set is sharded by tag hash; each shard has
//! its own lock, entry map and timer heap, so the reader lane and the flush
//! ticker never race on the same key and there is no global lock.
//!
//! # Window policies
//!
//! - [`WindowPolicy::Fixed`] - the window starts at the first read and never
//!   moves, so a continuously visible tag produces one event per window.
//! - [`WindowPolicy::Sliding`] - every read restarts the window; the event is
//!   emitted once the tag has been quiet for a full window.
//!
//! # Timers
//!
//! Each entry schedules a flush timer tagged with the entry's sequence
//! number. A timer whose sequence no longer matches (the entry was flushed
//! early or replaced) is discarded when it fires, which is how timers are
//! cancelled. A sliding entry whose deadline moved is re-armed.
//!
//! Events are emitted while the shard lock is held: a read racing a flush
//! for the same tag either lands in the old window before the flush or
//! starts a new window after the event has been emitted.

use crate::config::{DedupSettings, WindowPolicy};
use crate::error::{Result, RfidError};
use crate::types::{FlushReason, PresenceEvent, TagId, TagRead, Timestamp};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Destination for flushed presence events
pub trait PresenceEmitter: Send + Sync {
    fn emit(&self, event: PresenceEvent) -> Result<()>;
}

impl PresenceEmitter for Sender<PresenceEvent> {
    fn emit(&self, event: PresenceEvent) -> Result<()> {
        self.send(event)
            .map_err(|_| RfidError::Channel("presence receiver dropped".into()))
    }
}

/// Working-set entry for one tag
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub first_seen: Timestamp,
    /// Start of the current window (moves with each read under sliding policy)
    pub window_start: Timestamp,
    pub last_seen: Timestamp,
    pub read_count: u32,
    pub antenna: u16,
    pub peak_rssi: Option<f32>,
    seq: u64,
}

impl DedupEntry {
    fn new(read: &TagRead, seq: u64) -> Self {
        Self {
            first_seen: read.timestamp,
            window_start: read.timestamp,
            last_seen: read.timestamp,
            read_count: 1,
            antenna: read.antenna,
            peak_rssi: read.rssi,
            seq,
        }
    }

    fn absorb(&mut self, read: &TagRead, policy: WindowPolicy) {
        let ts = read.timestamp;
        if ts.monotonic > self.last_seen.monotonic {
            self.last_seen = ts;
        }
        if ts.monotonic < self.first_seen.monotonic {
            self.first_seen = ts;
        }
        if policy == WindowPolicy::Sliding && ts.monotonic > self.window_start.monotonic {
            self.window_start = ts;
        }
        self.read_count = self.read_count.saturating_add(1);
        self.peak_rssi = match (self.peak_rssi, read.rssi) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Instant at which this entry's window closes
    pub fn deadline(&self, window: Duration) -> Instant {
        self.window_start.monotonic + window
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FlushTimer {
    deadline: Instant,
    seq: u64,
    tag_id: TagId,
}

impl Ord for FlushTimer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for FlushTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct DedupShard {
    entries: HashMap<TagId, DedupEntry>,
    timers: BinaryHeap<Reverse<FlushTimer>>,
    next_seq: u64,
}

impl DedupShard {
    fn insert(&mut self, read: &TagRead, window: Duration) {
        self.next_seq += 1;
        let entry = DedupEntry::new(read, self.next_seq);
        self.timers.push(Reverse(FlushTimer {
            deadline: entry.deadline(window),
            seq: entry.seq,
            tag_id: read.tag_id.clone(),
        }));
        self.entries.insert(read.tag_id.clone(), entry);
    }

    fn least_recent(&self) -> Option<TagId> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.last_seen.monotonic)
            .map(|(tag, _)| tag.clone())
    }
}

/// Counters for one dedup window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub reads: u64,
    pub active_entries: usize,
    pub emitted: u64,
    /// Entries flushed early by the idle sweep or the capacity bound
    pub forced: u64,
    pub emit_failures: u64,
}

/// Per-reader dedup window
pub struct DedupWindow {
    reader_id: String,
    window: Duration,
    policy: WindowPolicy,
    max_idle: Duration,
    max_entries: usize,
    shards: Vec<Mutex<DedupShard>>,
    emitter: Arc<dyn PresenceEmitter>,
    occupancy: AtomicUsize,
    reads: AtomicU64,
    emitted: AtomicU64,
    forced: AtomicU64,
    emit_failures: AtomicU64,
}

impl DedupWindow {
    pub fn new(
        reader_id: impl Into<String>,
        settings: &DedupSettings,
        emitter: Arc<dyn PresenceEmitter>,
    ) -> Self {
        let shard_count = settings.shards.max(1).next_power_of_two();
        Self {
            reader_id: reader_id.into(),
            window: settings.window(),
            policy: settings.policy,
            max_idle: settings.max_idle(),
            max_entries: settings.max_entries.max(1),
            shards: (0..shard_count).map(|_| Mutex::default()).collect(),
            emitter,
            occupancy: AtomicUsize::new(0),
            reads: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            forced: AtomicU64::new(0),
            emit_failures: AtomicU64::new(0),
        }
    }

    /// Record a tag read, flushing the tag's previous window if it has closed
    pub fn observe(&self, read: &TagRead) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        {
            let mut shard = self.shards[self.shard_for(&read.tag_id)].lock();

            if let Some(entry) = shard.entries.get_mut(&read.tag_id) {
                if read.timestamp.monotonic < self.entry_deadline(entry) {
                    entry.absorb(read, self.policy);
                    return;
                }
            }

            if let Some(closed) = shard.entries.remove(&read.tag_id) {
                self.emit(read.tag_id.clone(), closed, FlushReason::WindowClosed);
            } else {
                self.occupancy.fetch_add(1, Ordering::SeqCst);
            }
            shard.insert(read, self.window);
        }

        if self.occupancy.load(Ordering::SeqCst) > self.max_entries {
            self.enforce_capacity();
        }
    }

    /// Fire every timer due at `now`; returns the number of events emitted
    pub fn flush_due(&self, now: Instant) -> usize {
        let mut flushed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            while let Some(Reverse(timer)) = shard.timers.peek() {
                if timer.deadline > now {
                    break;
                }
                let Some(Reverse(timer)) = shard.timers.pop() else {
                    break;
                };

                let deadline = match shard.entries.get(&timer.tag_id) {
                    Some(entry) if entry.seq == timer.seq => self.entry_deadline(entry),
                    // Entry flushed early or replaced: timer was cancelled
                    _ => continue,
                };

                if deadline > now {
                    shard.timers.push(Reverse(FlushTimer { deadline, ..timer }));
                    continue;
                }

                if let Some(entry) = shard.entries.remove(&timer.tag_id) {
                    self.occupancy.fetch_sub(1, Ordering::SeqCst);
                    self.emit(timer.tag_id, entry, FlushReason::WindowClosed);
                    flushed += 1;
                }
            }
        }
        flushed
    }

    /// Force-flush entries that have seen no reads for longer than the idle bound
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut flushed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let idle: Vec<TagId> = shard
                .entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_seen.monotonic) >= self.max_idle)
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in idle {
                if let Some(entry) = shard.entries.remove(&tag) {
                    self.occupancy.fetch_sub(1, Ordering::SeqCst);
                    self.forced.fetch_add(1, Ordering::Relaxed);
                    self.emit(tag, entry, FlushReason::Idle);
                    flushed += 1;
                }
            }
        }
        if flushed > 0 {
            tracing::debug!("[{}] idle sweep flushed {} entries", self.reader_id, flushed);
        }
        flushed
    }

    /// Flush every pending entry regardless of its window
    pub fn drain(&self) -> usize {
        let mut flushed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let mut entries: Vec<(TagId, DedupEntry)> = shard.entries.drain().collect();
            shard.timers.clear();
            entries.sort_by_key(|(_, e)| e.first_seen.monotonic);
            for (tag, entry) in entries {
                self.occupancy.fetch_sub(1, Ordering::SeqCst);
                self.emit(tag, entry, FlushReason::Drain);
                flushed += 1;
            }
        }
        flushed
    }

    /// Number of entries currently waiting for their window to close
    pub fn pending(&self) -> usize {
        self.occupancy.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            reads: self.reads.load(Ordering::Relaxed),
            active_entries: self.pending(),
            emitted: self.emitted.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
        }
    }

    fn entry_deadline(&self, entry: &DedupEntry) -> Instant {
        // Sliding entries advance window_start on every read
        entry.deadline(self.window)
    }

    fn shard_for(&self, tag_id: &TagId) -> usize {
        let mut hasher = DefaultHasher::new();
        tag_id.hash(&mut hasher);
        (hasher.finish() as usize) & (self.shards.len() - 1)
    }

    fn enforce_capacity(&self) {
        let mut evicted = 0;
        while self.occupancy.load(Ordering::SeqCst) > self.max_entries {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(idx, shard)| {
                    let shard = shard.lock();
                    let tag = shard.least_recent()?;
                    let seen = shard.entries.get(&tag)?.last_seen.monotonic;
                    Some((seen, idx, tag))
                })
                .min_by_key(|(seen, _, _)| *seen);

            let Some((_, idx, tag)) = oldest else {
                break;
            };
            let mut shard = self.shards[idx].lock();
            // Another thread may have flushed it between the scan and the lock
            if let Some(entry) = shard.entries.remove(&tag) {
                self.occupancy.fetch_sub(1, Ordering::SeqCst);
                self.forced.fetch_add(1, Ordering::Relaxed);
                self.emit(tag, entry, FlushReason::Capacity);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::warn!(
                "[{}] dedup working set over capacity ({}), force-flushed {} entries",
                self.reader_id,
                self.max_entries,
                evicted
            );
        }
    }

    fn emit(&self, tag_id: TagId, entry: DedupEntry, reason: FlushReason) {
        let event = PresenceEvent {
            event_id: Uuid::new_v4(),
            tag_id,
            reader_id: self.reader_id.clone(),
            antenna: entry.antenna,
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
            read_count: entry.read_count,
            peak_rssi: entry.peak_rssi,
            reason,
        };
        tracing::trace!(
            "[{}] presence {} x{} ({:?})",
            self.reader_id,
            event.tag_id,
            event.read_count,
            reason
        );
        match self.emitter.emit(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.emit_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("[{}] failed to emit presence event: {}", self.reader_id, e);
            }
        }
    }
}

//! Health and shutdown reporting types

use crate::dedup::DedupStats;
use crate::delivery::QueueSnapshot;
use crate::types::{PresenceEvent, ReaderState};
use serde::Serialize;
use std::fmt;

/// Lifecycle of one reader lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Reader gave up reconnecting, or its thread died
    Faulted,
}

impl fmt::Display for LaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaneState::Stopped => "stopped",
            LaneState::Starting => "starting",
            LaneState::Running => "running",
            LaneState::Stopping => "stopping",
            LaneState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Per-reader health
#[derive(Debug, Clone, Serialize)]
pub struct ReaderHealth {
    pub reader_id: String,
    pub lane: LaneState,
    pub connection: ReaderState,
    /// Frames decoded into tag reads
    pub frames: u64,
    pub decode_errors: u64,
    pub dedup: DedupStats,
}

/// Snapshot returned by `Coordinator::status`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub uptime_ms: u64,
    pub readers: Vec<ReaderHealth>,
    pub queue: QueueSnapshot,
}

impl PipelineStatus {
    pub fn reader(&self, reader_id: &str) -> Option<&ReaderHealth> {
        self.readers.iter().find(|r| r.reader_id == reader_id)
    }

    /// Queue has been stalled past the report interval
    pub fn queue_full(&self) -> bool {
        self.queue.sustained_full
    }
}

/// Outcome of `Coordinator::stop`
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Dedup entries flushed at shutdown
    pub flushed: usize,
    /// Every event reached a terminal outcome before the timeout
    pub drained: bool,
    pub elapsed_ms: u64,
    /// Events abandoned at the shutdown timeout
    pub undelivered: Vec<PresenceEvent>,
    pub queue: QueueSnapshot,
}

//! Reader lanes
//!
//! A lane is one reader's path through the pipeline, run on its own thread:
//! connection, decoder and dedup observation, so reads from one reader are
//! observed in arrival order.

use super::status::{LaneState, ReaderHealth};
use crate::config::ReaderConfig;
use crate::decoder::{decoder_for, FrameDecoder};
use crate::dedup::DedupWindow;
use crate::error::{DecodeError, Result};
use crate::presence::PresenceTracker;
use crate::reader::{DriverFactory, FrameHandler, ReaderCommand, ReaderConnection, ReaderEvent};
use crate::shutdown::ShutdownSignal;
use crate::types::{ReaderState, ReaderStatus, TagRead};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Default)]
pub(crate) struct LaneCounters {
    frames: AtomicU64,
    decode_errors: AtomicU64,
}

/// Decodes chunks and feeds the dedup window
pub(crate) struct LaneHandler {
    reader_id: String,
    decoder: Box<dyn FrameDecoder>,
    dedup: Arc<DedupWindow>,
    presence: Arc<PresenceTracker>,
    counters: Arc<LaneCounters>,
}

impl FrameHandler for LaneHandler {
    fn on_connected(&mut self) {
        let buffered = self.decoder.buffered();
        if buffered > 0 {
            tracing::debug!("[{}] discarding {} bytes of partial frame", self.reader_id, buffered);
        }
        self.decoder.reset();
    }

    fn on_chunk(&mut self, chunk: &[u8]) {
        for result in self.decoder.feed(chunk) {
            match result {
                Ok(frame) => {
                    self.counters.frames.fetch_add(1, Ordering::Relaxed);
                    let read = TagRead::new(frame.tag_id, self.reader_id.as_str(), frame.antenna, frame.rssi);
                    tracing::trace!("[{}] read {} on antenna {}", self.reader_id, read.tag_id, read.antenna);
                    self.presence
                        .record(&self.reader_id, &read.tag_id, read.antenna, read.timestamp.wall);
                    self.dedup.observe(&read);
                }
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[{}] dropping malformed frame: {}", self.reader_id, e);
                    // A bad scan replaces whatever tag was at the reader
                    if matches!(e, DecodeError::InvalidIdLength { .. }) {
                        self.presence.invalidate(&self.reader_id);
                    }
                }
            }
        }
    }
}

/// Shared pieces every lane thread needs
#[derive(Clone)]
pub(crate) struct LaneContext {
    pub factory: DriverFactory,
    pub events: Sender<ReaderEvent>,
    pub presence: Arc<PresenceTracker>,
    pub shutdown: ShutdownSignal,
}

pub(crate) struct Lane {
    config: ReaderConfig,
    state: Arc<RwLock<ReaderState>>,
    phase: Arc<Mutex<LaneState>>,
    dedup: Arc<DedupWindow>,
    counters: Arc<LaneCounters>,
    commands: Option<Sender<ReaderCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl Lane {
    pub fn new(config: ReaderConfig, dedup: Arc<DedupWindow>) -> Self {
        let state = Arc::new(RwLock::new(ReaderState::new(&config.id)));
        Self {
            config,
            state,
            phase: Arc::new(Mutex::new(LaneState::Stopped)),
            dedup,
            counters: Arc::new(LaneCounters::default()),
            commands: None,
            handle: None,
        }
    }

    pub fn dedup(&self) -> &Arc<DedupWindow> {
        &self.dedup
    }

    /// Start the lane thread
    pub fn spawn(&mut self, ctx: &LaneContext) -> Result<()> {
        *self.phase.lock() = LaneState::Starting;

        let (command_tx, command_rx) = unbounded();
        let driver = (ctx.factory)(&self.config);
        let connection = ReaderConnection::new(
            self.config.id.clone(),
            driver,
            self.config.reconnect.clone(),
            self.state.clone(),
            command_rx,
            ctx.shutdown.clone(),
        )
        .with_events(ctx.events.clone());

        let mut handler = LaneHandler {
            reader_id: self.config.id.clone(),
            decoder: decoder_for(&self.config),
            dedup: self.dedup.clone(),
            presence: ctx.presence.clone(),
            counters: self.counters.clone(),
        };

        let phase = self.phase.clone();
        let handle = std::thread::Builder::new()
            .name(format!("reader-{}", self.config.id))
            .spawn(move || {
                {
                    let mut phase = phase.lock();
                    if *phase == LaneState::Starting {
                        *phase = LaneState::Running;
                    }
                }
                connection.run(&mut handler);
            });

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                self.commands = Some(command_tx);
                Ok(())
            }
            Err(e) => {
                *self.phase.lock() = LaneState::Faulted;
                Err(e.into())
            }
        }
    }

    /// Ask a live connection to reset; false if the thread is gone
    pub fn send_reset(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.commands
            .as_ref()
            .is_some_and(|tx| tx.send(ReaderCommand::Reset).is_ok())
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn begin_stop(&self) {
        let mut phase = self.phase.lock();
        if *phase != LaneState::Stopped {
            *phase = LaneState::Stopping;
        }
    }

    /// Wait for the lane thread (after the shutdown signal has fired)
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("[{}] reader thread panicked", self.config.id);
            }
        }
        self.commands = None;
        *self.phase.lock() = LaneState::Stopped;
    }

    /// Reap a dead thread so the lane can be respawned
    pub fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("[{}] reader thread had panicked", self.config.id);
            }
        }
        self.commands = None;
    }

    pub fn lane_state(&self) -> LaneState {
        let phase = *self.phase.lock();
        if phase == LaneState::Running || phase == LaneState::Starting {
            let thread_died = self.handle.as_ref().is_some_and(|h| h.is_finished());
            if thread_died || self.state.read().status == ReaderStatus::Faulted {
                return LaneState::Faulted;
            }
        }
        phase
    }

    pub fn health(&self) -> ReaderHealth {
        ReaderHealth {
            reader_id: self.config.id.clone(),
            lane: self.lane_state(),
            connection: self.state.read().clone(),
            frames: self.counters.frames.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            dedup: self.dedup.stats(),
        }
    }
}

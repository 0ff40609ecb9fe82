//! Pipeline coordinator
//!
//! Owns the reader registry and every thread in the pipeline:
//!
//! - one lane thread per reader (connection, decoder, dedup)
//! - one flush ticker firing due dedup timers and the idle sweep
//! - `delivery.workers` delivery threads
//!
//! # Shutdown order
//!
//! 1. Signal and join the reader lanes (no new reads)
//! 2. Stop the ticker and drain every dedup window into the queue
//! 3. Wait for the queue to drain, up to the shutdown timeout
//! 4. On timeout abandon the queue; undelivered events go in the report
//!
//! A watchdog thread enforces the timeout over the whole sequence, so a
//! producer stalled on a full queue cannot hold up shutdown.

use super::lane::{Lane, LaneContext};
use super::status::{LaneState, PipelineStatus, ReaderHealth, ShutdownReport};
use crate::config::PipelineConfig;
use crate::dedup::{DedupStats, DedupWindow};
use crate::delivery::{build_dead_letter, build_sink, spawn_workers, DeliveryQueue, EventSink, QueueSnapshot};
use crate::error::{Result, ResultExt, RfidError};
use crate::presence::{CurrentTag, PresenceTracker};
use crate::reader::{default_factory, DriverFactory, ReaderEvent};
use crate::shutdown::{shutdown_pair, ShutdownSignal, ShutdownTrigger};
use crate::types::ReaderState;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Coordinator events are dropped rather than queued past this
const EVENT_BACKLOG: usize = 1024;

/// Threads and signals that exist only while running
struct Runtime {
    started_at: Instant,
    reader_shutdown: ShutdownTrigger,
    reader_signal: ShutdownSignal,
    ticker_shutdown: ShutdownTrigger,
    ticker: Option<JoinHandle<()>>,
    worker_stop: ShutdownTrigger,
    workers: Vec<JoinHandle<()>>,
}

/// Supervises every reader lane and the delivery stage
pub struct Coordinator {
    config: PipelineConfig,
    sink: Arc<dyn EventSink>,
    dead_letter: Option<Arc<dyn EventSink>>,
    factory: DriverFactory,
    presence: Arc<PresenceTracker>,
    events_tx: Sender<ReaderEvent>,
    events_rx: Receiver<ReaderEvent>,
    lanes: BTreeMap<String, Lane>,
    queue: Option<DeliveryQueue>,
    runtime: Option<Runtime>,
}

impl Coordinator {
    /// Coordinator delivering to `sink`; the configuration is validated here
    pub fn new(config: PipelineConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let presence = Arc::new(PresenceTracker::from_settings(&config.presence));
        let (events_tx, events_rx) = bounded(EVENT_BACKLOG);
        Ok(Self {
            config,
            sink,
            dead_letter: None,
            factory: default_factory(),
            presence,
            events_tx,
            events_rx,
            lanes: BTreeMap::new(),
            queue: None,
            runtime: None,
        })
    }

    /// Coordinator with the sink and dead-letter sink named in the configuration
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let sink = build_sink(&config.sink)?;
        let dead_letter = build_dead_letter(&config.delivery.dead_letter)?;
        let mut coordinator = Self::new(config, sink)?;
        coordinator.dead_letter = dead_letter;
        Ok(coordinator)
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Replace how drivers are built from reader configs
    pub fn with_driver_factory(mut self, factory: DriverFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Start delivery, then one lane per reader, then the flush ticker
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(RfidError::InvalidState("pipeline already running".into()));
        }
        tracing::info!("Starting pipeline with {} readers", self.config.readers.len());

        let queue = DeliveryQueue::new(&self.config.queue);
        let (worker_stop, worker_signal) = shutdown_pair();
        let workers = spawn_workers(
            &queue,
            self.sink.clone(),
            self.dead_letter.clone(),
            &self.config.delivery,
            &worker_signal,
        )
        .map_err(RfidError::from)
        .context("Failed to spawn delivery workers")?;

        let (reader_shutdown, reader_signal) = shutdown_pair();
        let ctx = LaneContext {
            factory: self.factory.clone(),
            events: self.events_tx.clone(),
            presence: self.presence.clone(),
            shutdown: reader_signal.clone(),
        };

        let mut lanes = BTreeMap::new();
        for reader in &self.config.readers {
            let window = Arc::new(DedupWindow::new(
                reader.id.clone(),
                &self.config.dedup,
                Arc::new(queue.producer()),
            ));
            let mut lane = Lane::new(reader.clone(), window);
            lane.spawn(&ctx)
                .with_context(|| format!("Failed to start reader {}", reader.id))?;
            lanes.insert(reader.id.clone(), lane);
        }

        let windows: Vec<Arc<DedupWindow>> = lanes.values().map(|l| l.dedup().clone()).collect();
        let (ticker_shutdown, ticker_signal) = shutdown_pair();
        let tick = self.config.dedup.flush_tick();
        let sweep_every = self.config.dedup.window();
        let ticker = std::thread::Builder::new()
            .name("dedup-ticker".into())
            .spawn(move || run_ticker(windows, tick, sweep_every, ticker_signal))
            .map_err(RfidError::from)
            .context("Failed to spawn flush ticker")?;

        self.lanes = lanes;
        self.queue = Some(queue);
        self.runtime = Some(Runtime {
            started_at: Instant::now(),
            reader_shutdown,
            reader_signal,
            ticker_shutdown,
            ticker: Some(ticker),
            worker_stop,
            workers,
        });
        tracing::info!("Pipeline started");
        Ok(())
    }

    /// Stop every lane, flush pending entries and drain the queue
    pub fn stop(&mut self) -> Result<ShutdownReport> {
        let Some(mut runtime) = self.runtime.take() else {
            return Err(RfidError::InvalidState("pipeline is not running".into()));
        };
        let Some(queue) = self.queue.clone() else {
            return Err(RfidError::InvalidState("pipeline has no delivery queue".into()));
        };

        let started = Instant::now();
        let timeout = self.config.shutdown_timeout();
        tracing::info!("Stopping pipeline (timeout {:?})", timeout);
        let (done, watchdog) = spawn_watchdog(queue.clone(), timeout)?;

        for lane in self.lanes.values() {
            lane.begin_stop();
        }
        runtime.reader_shutdown.trigger();
        for lane in self.lanes.values_mut() {
            lane.join();
        }

        runtime.ticker_shutdown.trigger();
        if let Some(ticker) = runtime.ticker.take() {
            if ticker.join().is_err() {
                tracing::error!("Flush ticker panicked");
            }
        }

        let flushed: usize = self.lanes.values().map(|lane| lane.dedup().drain()).sum();
        tracing::debug!("Flushed {} pending dedup entries", flushed);

        let remaining = timeout.saturating_sub(started.elapsed());
        let drained = queue.wait_drained(remaining) && !queue.is_abandoned();
        if !drained {
            queue.abandon();
        }

        done.trigger();
        let _ = watchdog.join();
        runtime.worker_stop.trigger();
        for worker in runtime.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Delivery worker panicked");
            }
        }

        let undelivered = queue.take_stranded();
        for event in &undelivered {
            tracing::error!(
                "Undelivered at shutdown: event {} tag {} reader {} ({} reads)",
                event.event_id,
                event.tag_id,
                event.reader_id,
                event.read_count
            );
        }

        let report = ShutdownReport {
            flushed,
            drained,
            elapsed_ms: started.elapsed().as_millis() as u64,
            undelivered,
            queue: queue.snapshot(),
        };
        tracing::info!(
            "Pipeline stopped in {} ms: {} delivered, {} undelivered",
            report.elapsed_ms,
            report.queue.delivered,
            report.undelivered.len()
        );
        Ok(report)
    }

    /// Health of every reader plus queue counters
    pub fn status(&self) -> PipelineStatus {
        let queue = match &self.queue {
            Some(queue) => queue.snapshot(),
            None => QueueSnapshot {
                capacity: self.config.queue.capacity,
                ..Default::default()
            },
        };
        let readers = if self.lanes.is_empty() {
            // Never started: report configured readers as stopped
            self.config
                .readers
                .iter()
                .map(|reader| ReaderHealth {
                    reader_id: reader.id.clone(),
                    lane: LaneState::Stopped,
                    connection: ReaderState::new(&reader.id),
                    frames: 0,
                    decode_errors: 0,
                    dedup: DedupStats::default(),
                })
                .collect()
        } else {
            self.lanes.values().map(Lane::health).collect()
        };

        PipelineStatus {
            running: self.is_running(),
            uptime_ms: self
                .runtime
                .as_ref()
                .map_or(0, |rt| rt.started_at.elapsed().as_millis() as u64),
            readers,
            queue,
        }
    }

    /// Re-arm a reader: clears its failure count and backoff, and restarts
    /// the lane thread if it died
    pub fn reset_reader(&mut self, reader_id: &str) -> Result<()> {
        if self.config.reader(reader_id).is_none() {
            return Err(RfidError::UnknownReader(reader_id.to_string()));
        }
        let Some(runtime) = &self.runtime else {
            return Err(RfidError::InvalidState("pipeline is not running".into()));
        };
        let Some(lane) = self.lanes.get_mut(reader_id) else {
            return Err(RfidError::UnknownReader(reader_id.to_string()));
        };

        if lane.send_reset() {
            tracing::info!("[{}] reset sent", reader_id);
            return Ok(());
        }

        tracing::warn!("[{}] reader thread is gone, restarting lane", reader_id);
        lane.reap();
        let ctx = LaneContext {
            factory: self.factory.clone(),
            events: self.events_tx.clone(),
            presence: self.presence.clone(),
            shutdown: runtime.reader_signal.clone(),
        };
        lane.spawn(&ctx)
    }

    /// Most recent unexpired tag at a reader
    pub fn current_tag(&self, reader_id: &str) -> Result<Option<CurrentTag>> {
        if self.config.reader(reader_id).is_none() {
            return Err(RfidError::UnknownReader(reader_id.to_string()));
        }
        Ok(self.presence.current(reader_id))
    }

    /// Reader status changes; lossy when nobody drains it
    pub fn events(&self) -> Receiver<ReaderEvent> {
        self.events_rx.clone()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                tracing::error!("Failed to stop pipeline on drop: {}", e);
            }
        }
    }
}

fn run_ticker(windows: Vec<Arc<DedupWindow>>, tick: Duration, sweep_every: Duration, shutdown: ShutdownSignal) {
    tracing::debug!("Flush ticker started ({:?} tick)", tick);
    let mut last_sweep = Instant::now();
    while !shutdown.wait_timeout(tick) {
        let now = Instant::now();
        for window in &windows {
            window.flush_due(now);
        }
        if now.duration_since(last_sweep) >= sweep_every {
            for window in &windows {
                window.sweep_idle(now);
            }
            last_sweep = now;
        }
    }
    tracing::debug!("Flush ticker stopped");
}

/// Abandon the queue if shutdown is still running after `timeout`
fn spawn_watchdog(queue: DeliveryQueue, timeout: Duration) -> Result<(ShutdownTrigger, JoinHandle<()>)> {
    let (done, signal) = shutdown_pair();
    let handle = std::thread::Builder::new()
        .name("shutdown-watchdog".into())
        .spawn(move || {
            if !signal.wait_timeout(timeout) {
                tracing::error!("Shutdown timeout ({:?}) reached, abandoning delivery", timeout);
                queue.abandon();
            }
        })
        .map_err(RfidError::from)
        .context("Failed to spawn shutdown watchdog")?;
    Ok((done, handle))
}

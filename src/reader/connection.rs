//! Reader connection lifecycle
//!
//! [`ReaderConnection::run`] owns one driver and loops until shutdown:
//!
//! ```text
//!   Connecting --open ok--> Connected --closed/error--> Disconnected --backoff--> Connecting
//!       |                                                                  ^
//!       +--open failed--> Disconnected --backoff-----------------------------+
//!       +--N consecutive failures--> Faulted --reset--> Connecting
//! ```
//!
//! Backoff doubles per attempt up to the cap and resets once a link stayed
//! up for the minimum uptime. Every successful open clears the
//! consecutive-failure count. All waits wake on shutdown and on commands.

use super::driver::{DriverRead, ReaderDriver};
use crate::backoff::Backoff;
use crate::config::ReconnectSettings;
use crate::shutdown::ShutdownSignal;
use crate::types::{ReaderState, ReaderStatus};
use chrono::{DateTime, Utc};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Commands accepted by a running connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderCommand {
    /// Clear the failure count and backoff, leaving Faulted if parked there
    Reset,
}

/// Status change published to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderEvent {
    pub reader_id: String,
    pub status: ReaderStatus,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Consumer of the raw byte stream
pub trait FrameHandler {
    /// A new link was opened; discard any partial frame from the previous one
    fn on_connected(&mut self);

    fn on_chunk(&mut self, chunk: &[u8]);
}

enum Wake {
    Shutdown,
    Command(ReaderCommand),
    /// Command channel closed
    Detached,
    Elapsed,
}

enum LinkEnd {
    Shutdown,
    Closed,
    Failed(String),
}

/// Reconnecting reader link
pub struct ReaderConnection {
    reader_id: String,
    driver: Box<dyn ReaderDriver>,
    settings: ReconnectSettings,
    backoff: Backoff,
    state: Arc<RwLock<ReaderState>>,
    events: Option<Sender<ReaderEvent>>,
    commands: Receiver<ReaderCommand>,
    shutdown: ShutdownSignal,
}

impl ReaderConnection {
    pub fn new(
        reader_id: impl Into<String>,
        driver: Box<dyn ReaderDriver>,
        settings: ReconnectSettings,
        state: Arc<RwLock<ReaderState>>,
        commands: Receiver<ReaderCommand>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let backoff = Backoff::new(settings.initial_backoff(), settings.max_backoff());
        Self {
            reader_id: reader_id.into(),
            driver,
            settings,
            backoff,
            state,
            events: None,
            commands,
            shutdown,
        }
    }

    /// Publish status changes on this channel (lossy)
    pub fn with_events(mut self, events: Sender<ReaderEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run until shutdown, feeding every chunk to `handler`
    pub fn run(mut self, handler: &mut dyn FrameHandler) {
        tracing::info!("[{}] starting reader on {}", self.reader_id, self.driver.describe());

        while !self.shutdown.is_triggered() {
            self.set_status(ReaderStatus::Connecting, None);

            if let Err(e) = self.driver.open() {
                let failures = self.record_failure(e.to_string());
                if failures >= self.settings.max_consecutive_failures {
                    tracing::error!(
                        "[{}] giving up after {} consecutive failures: {}",
                        self.reader_id,
                        failures,
                        e
                    );
                    self.set_status(ReaderStatus::Faulted, Some(e.to_string()));
                    if !self.park_faulted() {
                        break;
                    }
                    continue;
                }

                let delay = self.backoff.next_delay();
                tracing::warn!(
                    "[{}] connect attempt {} failed: {} (retrying in {:?})",
                    self.reader_id,
                    failures,
                    e,
                    delay
                );
                self.set_status(ReaderStatus::Disconnected, Some(e.to_string()));
                self.set_retry_delay(delay);
                if !self.wait(delay) {
                    break;
                }
                continue;
            }

            self.on_open();
            handler.on_connected();
            let opened = Instant::now();
            let end = self.pump(handler);
            self.driver.close();

            if opened.elapsed() >= self.settings.min_uptime() {
                self.backoff.reset();
            }

            let message = match end {
                LinkEnd::Shutdown => break,
                LinkEnd::Closed => "link closed by reader".to_string(),
                LinkEnd::Failed(message) => message,
            };
            let delay = self.backoff.next_delay();
            tracing::warn!(
                "[{}] disconnected after {:?}: {} (reconnecting in {:?})",
                self.reader_id,
                opened.elapsed(),
                message,
                delay
            );
            self.set_status(ReaderStatus::Disconnected, Some(message));
            self.set_retry_delay(delay);
            if !self.wait(delay) {
                break;
            }
        }

        self.driver.close();
        self.set_status(ReaderStatus::Disconnected, None);
        tracing::info!("[{}] reader stopped", self.reader_id);
    }

    fn pump(&mut self, handler: &mut dyn FrameHandler) -> LinkEnd {
        let read_timeout = self.settings.read_timeout();
        loop {
            if self.shutdown.is_triggered() {
                return LinkEnd::Shutdown;
            }
            while let Ok(command) = self.commands.try_recv() {
                tracing::debug!("[{}] ignoring {:?} while connected", self.reader_id, command);
            }

            match self.driver.read(read_timeout) {
                Ok(DriverRead::Data(chunk)) => {
                    self.state.write().last_read_at = Some(Utc::now());
                    handler.on_chunk(&chunk);
                }
                Ok(DriverRead::Idle) => {}
                Ok(DriverRead::Closed) => return LinkEnd::Closed,
                Err(e) => return LinkEnd::Failed(e.to_string()),
            }
        }
    }

    /// Sleep out a backoff; false if shutdown fired
    fn wait(&mut self, delay: Duration) -> bool {
        let wake = select! {
            recv(self.shutdown.receiver()) -> _ => Wake::Shutdown,
            recv(self.commands) -> command => command.map_or(Wake::Detached, Wake::Command),
            default(delay) => Wake::Elapsed,
        };
        match wake {
            Wake::Shutdown => false,
            Wake::Command(ReaderCommand::Reset) => {
                self.apply_reset();
                true
            }
            Wake::Detached => !self.shutdown.wait_timeout(delay),
            Wake::Elapsed => true,
        }
    }

    /// Block in Faulted until reset; false if shutdown fired
    fn park_faulted(&mut self) -> bool {
        let wake = select! {
            recv(self.shutdown.receiver()) -> _ => Wake::Shutdown,
            recv(self.commands) -> command => command.map_or(Wake::Detached, Wake::Command),
        };
        match wake {
            Wake::Command(ReaderCommand::Reset) => {
                self.apply_reset();
                true
            }
            Wake::Detached => {
                // Nobody can reset us any more; wait for shutdown
                let _ = self.shutdown.receiver().recv();
                false
            }
            Wake::Shutdown | Wake::Elapsed => false,
        }
    }

    fn apply_reset(&mut self) {
        tracing::info!("[{}] reset requested", self.reader_id);
        self.backoff.reset();
        let mut state = self.state.write();
        state.consecutive_failures = 0;
        state.last_error = None;
    }

    fn on_open(&mut self) {
        tracing::info!("[{}] connected to {}", self.reader_id, self.driver.describe());
        {
            let mut state = self.state.write();
            state.consecutive_failures = 0;
            state.connects += 1;
            state.last_error = None;
            state.retry_delay_ms = None;
        }
        self.set_status(ReaderStatus::Connected, None);
    }

    fn set_retry_delay(&self, delay: Duration) {
        self.state.write().retry_delay_ms = Some(delay.as_millis() as u64);
    }

    fn record_failure(&mut self, message: String) -> u32 {
        let mut state = self.state.write();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(message);
        state.consecutive_failures
    }

    fn set_status(&self, status: ReaderStatus, message: Option<String>) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.status != status;
            state.status = status;
            if message.is_some() {
                state.last_error = message.clone();
            }
            changed
        };

        if changed {
            if let Some(events) = &self.events {
                // Lossy: a slow front-end never stalls the reader
                let _ = events.try_send(ReaderEvent {
                    reader_id: self.reader_id.clone(),
                    status,
                    message,
                    at: Utc::now(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, RfidError};
    use crate::shutdown::shutdown_pair;
    use crossbeam_channel::{bounded, unbounded};
    use std::collections::VecDeque;

    /// Driver that fails `failures` opens, then serves `chunks` and closes
    struct FlakyDriver {
        failures: u32,
        chunks: VecDeque<Vec<u8>>,
        open: bool,
    }

    impl ReaderDriver for FlakyDriver {
        fn open(&mut self) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(RfidError::connection("flaky", "refused"));
            }
            self.open = true;
            Ok(())
        }

        fn read(&mut self, _timeout: Duration) -> Result<DriverRead> {
            match self.chunks.pop_front() {
                Some(chunk) => Ok(DriverRead::Data(chunk)),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(DriverRead::Idle)
                }
            }
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    #[derive(Default)]
    struct Collect {
        connects: u32,
        bytes: Vec<u8>,
    }

    impl FrameHandler for Collect {
        fn on_connected(&mut self) {
            self.connects += 1;
        }

        fn on_chunk(&mut self, chunk: &[u8]) {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn fast_settings(max_failures: u32) -> ReconnectSettings {
        ReconnectSettings {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            min_uptime_ms: 60_000,
            max_consecutive_failures: max_failures,
            read_timeout_ms: 5,
        }
    }

    #[test]
    fn test_recovers_after_failed_opens() {
        let driver = FlakyDriver {
            failures: 3,
            chunks: VecDeque::from(vec![b"abc".to_vec()]),
            open: false,
        };
        let state = Arc::new(RwLock::new(ReaderState::new("flaky")));
        let (_cmd_tx, cmd_rx) = unbounded();
        let (trigger, signal) = shutdown_pair();
        let (event_tx, event_rx) = bounded(64);
        let connection = ReaderConnection::new(
            "flaky",
            Box::new(driver),
            fast_settings(5),
            state.clone(),
            cmd_rx,
            signal,
        )
        .with_events(event_tx);

        let handle = std::thread::spawn(move || {
            let mut collect = Collect::default();
            connection.run(&mut collect);
            collect
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.read().status != ReaderStatus::Connected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        while state.read().last_read_at.is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        {
            let state = state.read();
            assert_eq!(state.status, ReaderStatus::Connected);
            assert_eq!(state.consecutive_failures, 0);
            assert_eq!(state.connects, 1);
        }

        trigger.trigger();
        let collect = handle.join().unwrap();
        assert_eq!(collect.connects, 1);
        assert_eq!(collect.bytes, b"abc");

        let statuses: Vec<ReaderStatus> = event_rx.try_iter().map(|e| e.status).collect();
        assert!(statuses.contains(&ReaderStatus::Connected));
        assert_eq!(statuses.last(), Some(&ReaderStatus::Disconnected));
    }

    #[test]
    fn test_faults_then_reset_recovers() {
        let driver = FlakyDriver {
            failures: 3,
            chunks: VecDeque::new(),
            open: false,
        };
        let state = Arc::new(RwLock::new(ReaderState::new("flaky")));
        let (cmd_tx, cmd_rx) = unbounded();
        let (trigger, signal) = shutdown_pair();
        let connection = ReaderConnection::new(
            "flaky",
            Box::new(driver),
            fast_settings(2),
            state.clone(),
            cmd_rx,
            signal,
        );
        let handle = std::thread::spawn(move || connection.run(&mut Collect::default()));

        let wait_for = |status: ReaderStatus| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while state.read().status != status && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
            state.read().status
        };

        assert_eq!(wait_for(ReaderStatus::Faulted), ReaderStatus::Faulted);
        assert_eq!(state.read().consecutive_failures, 2);

        // One more failure remains, then the open succeeds
        cmd_tx.send(ReaderCommand::Reset).unwrap();
        assert_eq!(wait_for(ReaderStatus::Connected), ReaderStatus::Connected);

        trigger.trigger();
        handle.join().unwrap();
        assert_eq!(state.read().status, ReaderStatus::Disconnected);
    }

    /// Driver whose links close once they have been up for `uptime`.
    /// Each open records the reconnect delay the connection waited out.
    struct TimedLinkDriver {
        uptime: Duration,
        opened_at: Option<Instant>,
        state: Arc<RwLock<ReaderState>>,
        delays: Arc<parking_lot::Mutex<Vec<Option<u64>>>>,
    }

    impl ReaderDriver for TimedLinkDriver {
        fn open(&mut self) -> Result<()> {
            self.delays.lock().push(self.state.read().retry_delay_ms);
            self.opened_at = Some(Instant::now());
            Ok(())
        }

        fn read(&mut self, _timeout: Duration) -> Result<DriverRead> {
            match self.opened_at {
                Some(at) if at.elapsed() >= self.uptime => Ok(DriverRead::Closed),
                _ => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(DriverRead::Idle)
                }
            }
        }

        fn close(&mut self) {
            self.opened_at = None;
        }

        fn is_open(&self) -> bool {
            self.opened_at.is_some()
        }

        fn describe(&self) -> String {
            "timed".into()
        }
    }

    /// Run until `opens` links have been opened; returns the recorded delays
    fn reconnect_delays(uptime: Duration, min_uptime_ms: u64, opens: usize) -> Vec<Option<u64>> {
        let state = Arc::new(RwLock::new(ReaderState::new("timed")));
        let delays = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let driver = TimedLinkDriver {
            uptime,
            opened_at: None,
            state: state.clone(),
            delays: delays.clone(),
        };
        let settings = ReconnectSettings {
            initial_backoff_ms: 5,
            max_backoff_ms: 1_000,
            min_uptime_ms,
            max_consecutive_failures: 5,
            read_timeout_ms: 5,
        };
        let (_cmd_tx, cmd_rx) = unbounded();
        let (trigger, signal) = shutdown_pair();
        let connection = ReaderConnection::new("timed", Box::new(driver), settings, state, cmd_rx, signal);
        let handle = std::thread::spawn(move || connection.run(&mut Collect::default()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while delays.lock().len() < opens && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        trigger.trigger();
        handle.join().unwrap();

        let recorded = delays.lock().clone();
        assert!(recorded.len() >= opens, "only {} opens", recorded.len());
        recorded[..opens].to_vec()
    }

    #[test]
    fn test_backoff_grows_across_short_lived_links() {
        let delays = reconnect_delays(Duration::ZERO, 60_000, 4);
        assert_eq!(delays, vec![None, Some(5), Some(10), Some(20)]);
    }

    #[test]
    fn test_backoff_resets_after_sustained_link() {
        let delays = reconnect_delays(Duration::from_millis(60), 20, 4);
        assert_eq!(delays, vec![None, Some(5), Some(5), Some(5)]);
    }

    #[test]
    fn test_shutdown_interrupts_long_backoff() {
        let driver = FlakyDriver {
            failures: u32::MAX,
            chunks: VecDeque::new(),
            open: false,
        };
        let mut settings = fast_settings(100);
        settings.initial_backoff_ms = 60_000;
        settings.max_backoff_ms = 60_000;
        let state = Arc::new(RwLock::new(ReaderState::new("flaky")));
        let (_cmd_tx, cmd_rx) = unbounded();
        let (trigger, signal) = shutdown_pair();
        let connection = ReaderConnection::new("flaky", Box::new(driver), settings, state, cmd_rx, signal);
        let handle = std::thread::spawn(move || connection.run(&mut Collect::default()));

        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        trigger.trigger();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

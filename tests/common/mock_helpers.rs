//! Mock construction helpers
//!
//! - [`ScriptHandle`] / [`ScriptedDriver`] - A reader whose connect failures
//!   and byte stream are scripted by the test
//! - [`RecordingSink`], [`FlakySink`], [`FailingSink`], [`SlowSink`] - Sinks
//!   with controlled delivery outcomes

use parking_lot::Mutex;
use rfidreader::config::ReaderConfig;
use rfidreader::decoder::INPUT_EVENT_SIZE;
use rfidreader::reader::{DriverFactory, DriverRead, ReaderDriver};
use rfidreader::{EventSink, PresenceEvent, Result, RfidError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ==================== Scripted reader ====================

#[derive(Debug, Default)]
struct Script {
    open_failures: u32,
    chunks: VecDeque<Vec<u8>>,
    close_after_chunks: bool,
    open_attempts: u32,
    opens: u32,
}

/// Shared script for one reader; survives lane restarts
#[derive(Debug, Clone, Default)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connect attempts
    pub fn fail_opens(self, count: u32) -> Self {
        self.0.lock().open_failures = count;
        self
    }

    /// Report the link closed once the queued chunks are consumed
    pub fn close_after_chunks(self) -> Self {
        self.0.lock().close_after_chunks = true;
        self
    }

    pub fn push_chunk(&self, chunk: impl Into<Vec<u8>>) {
        self.0.lock().chunks.push_back(chunk.into());
    }

    pub fn open_attempts(&self) -> u32 {
        self.0.lock().open_attempts
    }

    pub fn opens(&self) -> u32 {
        self.0.lock().opens
    }

    pub fn pending_chunks(&self) -> usize {
        self.0.lock().chunks.len()
    }

    pub fn driver(&self, reader_id: &str) -> ScriptedDriver {
        ScriptedDriver {
            reader_id: reader_id.to_string(),
            script: self.clone(),
            open: false,
        }
    }
}

pub struct ScriptedDriver {
    reader_id: String,
    script: ScriptHandle,
    open: bool,
}

impl ReaderDriver for ScriptedDriver {
    fn open(&mut self) -> Result<()> {
        let mut script = self.script.0.lock();
        script.open_attempts += 1;
        if script.open_failures > 0 {
            script.open_failures -= 1;
            return Err(RfidError::connection(&self.reader_id, "connection refused"));
        }
        script.opens += 1;
        self.open = true;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<DriverRead> {
        {
            let mut script = self.script.0.lock();
            if let Some(chunk) = script.chunks.pop_front() {
                return Ok(DriverRead::Data(chunk));
            }
            if script.close_after_chunks {
                script.close_after_chunks = false;
                return Ok(DriverRead::Closed);
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(DriverRead::Idle)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        format!("scripted:{}", self.reader_id)
    }
}

/// Factory handing each reader the driver for its script
pub fn scripted_factory(scripts: &[(&str, ScriptHandle)]) -> DriverFactory {
    let scripts: HashMap<String, ScriptHandle> = scripts
        .iter()
        .map(|(id, script)| (id.to_string(), script.clone()))
        .collect();
    Arc::new(move |reader: &ReaderConfig| -> Box<dyn ReaderDriver> {
        let script = scripts.get(&reader.id).cloned().unwrap_or_default();
        Box::new(script.driver(&reader.id))
    })
}

// ==================== Frames ====================

/// One line-protocol TAG frame
pub fn tag_line(tag_hex: &str, antenna: u16) -> Vec<u8> {
    format!("TAG,{tag_hex},{antenna},-60.0\n").into_bytes()
}

fn key_record(code: u16, value: i32) -> Vec<u8> {
    let mut record = vec![0u8; 16];
    record.extend_from_slice(&1u16.to_le_bytes());
    record.extend_from_slice(&code.to_le_bytes());
    record.extend_from_slice(&value.to_le_bytes());
    assert_eq!(record.len(), INPUT_EVENT_SIZE);
    record
}

fn scancode(c: char) -> u16 {
    match c {
        '1'..='9' => c as u16 - '1' as u16 + 2,
        '0' => 11,
        'A' => 30,
        'B' => 48,
        'C' => 46,
        'D' => 32,
        'E' => 18,
        'F' => 33,
        other => panic!("no scancode for {other:?} in test helper"),
    }
}

/// Key-down/key-up records typing `id` followed by Enter
pub fn typed_id(id: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for code in id.chars().map(scancode).chain(std::iter::once(28)) {
        bytes.extend(key_record(code, 1));
        bytes.extend(key_record(code, 0));
    }
    bytes
}

// ==================== Sinks ====================

/// Records every delivered event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PresenceEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PresenceEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &PresenceEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Fails the first `failures` calls, then records
#[derive(Debug, Default)]
pub struct FlakySink {
    failures_left: AtomicU32,
    attempts: AtomicUsize,
    pub recorded: RecordingSink,
}

impl FlakySink {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            ..Default::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventSink for FlakySink {
    fn deliver(&self, event: &PresenceEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RfidError::Delivery("downstream unavailable".into()));
        }
        self.recorded.deliver(event)
    }
}

/// Rejects every event
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventSink for FailingSink {
    fn deliver(&self, _event: &PresenceEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(RfidError::Delivery("downstream rejected event".into()))
    }
}

/// Records after a fixed delay per event
#[derive(Debug)]
pub struct SlowSink {
    delay: Duration,
    pub recorded: RecordingSink,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            recorded: RecordingSink::default(),
        })
    }
}

impl EventSink for SlowSink {
    fn deliver(&self, event: &PresenceEvent) -> Result<()> {
        std::thread::sleep(self.delay);
        self.recorded.deliver(event)
    }
}

//! Virtual reader for demos and soak tests
//!
//! Emits one line-protocol `TAG` frame per interval, cycling through the
//! configured tag ids and antennas with a synthetic RSSI.

use super::driver::{DriverRead, ReaderDriver};
use crate::error::{Result, RfidError};
use std::time::{Duration, Instant};

/// Simulated reader
#[derive(Debug)]
pub struct VirtualDriver {
    reader_id: String,
    tags: Vec<String>,
    interval: Duration,
    antennas: u16,
    next_due: Option<Instant>,
    emitted: u64,
}

impl VirtualDriver {
    pub fn new(reader_id: &str, tags: Vec<String>, interval: Duration, antennas: u16) -> Self {
        Self {
            reader_id: reader_id.to_string(),
            tags,
            interval,
            antennas: antennas.max(1),
            next_due: None,
            emitted: 0,
        }
    }

    fn next_frame(&mut self) -> Vec<u8> {
        let n = self.emitted;
        self.emitted += 1;
        let tag = &self.tags[(n % self.tags.len() as u64) as usize];
        let antenna = 1 + (n % self.antennas as u64) as u16;
        let rssi = -40.0 - (n % 25) as f32;
        format!("TAG,{},{},{:.1}\n", tag, antenna, rssi).into_bytes()
    }
}

impl ReaderDriver for VirtualDriver {
    fn open(&mut self) -> Result<()> {
        if self.tags.is_empty() {
            return Err(RfidError::connection(&self.reader_id, "virtual reader has no tags"));
        }
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<DriverRead> {
        let Some(due) = self.next_due else {
            return Err(RfidError::connection(&self.reader_id, "read on closed link"));
        };
        let now = Instant::now();
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(DriverRead::Idle);
            }
            std::thread::sleep(wait);
        }
        // Fixed cadence; a slow consumer does not cause a burst
        self.next_due = Some(Instant::now().max(due) + self.interval);
        Ok(DriverRead::Data(self.next_frame()))
    }

    fn close(&mut self) {
        self.next_due = None;
    }

    fn is_open(&self) -> bool {
        self.next_due.is_some()
    }

    fn describe(&self) -> String {
        format!("virtual:{} tags every {:?}", self.tags.len(), self.interval)
    }
}

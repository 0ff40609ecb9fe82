//! Core data types for the rfidreader pipeline
//!
//! This module defines the values that flow between pipeline stages:
//!
//! - [`TagRead`] - A single observation produced by a reader lane
//! - [`PresenceEvent`] - The coalesced output of the dedup window
//! - [`ReaderState`] - Per-reader connection health
//!
//! Timestamps carry both a monotonic instant (for window arithmetic) and a
//! wall-clock time (for downstream consumers). Only the wall-clock half is
//! serialized.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Opaque tag identifier as reported by the reader
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(Vec<u8>);

impl TagId {
    /// Create a tag id from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a tag id from a hex string (e.g. an EPC)
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.trim()).map(Self)
    }

    /// Raw bytes of the id
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes in the id
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the id is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Upper-case hex rendering of the id
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }

    fn is_text(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| b.is_ascii_alphanumeric())
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keyboard-wedge readers type ASCII ids; show those as typed.
        if self.is_text() {
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

impl From<&str> for TagId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for TagId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Monotonic + wall-clock capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    #[serde(skip_serializing)]
    pub monotonic: Instant,
    #[serde(rename = "at")]
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    /// Capture the current time
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// Timestamp offset from this one by `delta` on both clocks
    pub fn offset(&self, delta: std::time::Duration) -> Self {
        let wall_delta = chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::zero());
        Self {
            monotonic: self.monotonic + delta,
            wall: self.wall + wall_delta,
        }
    }
}

/// A single observation of a tag by a reader/antenna
#[derive(Debug, Clone, PartialEq)]
pub struct TagRead {
    pub tag_id: TagId,
    pub reader_id: String,
    pub antenna: u16,
    /// Signal strength on the reader's own scale, if it reports one
    pub rssi: Option<f32>,
    pub timestamp: Timestamp,
}

impl TagRead {
    /// Create a tag read captured now
    pub fn new(tag_id: TagId, reader_id: impl Into<String>, antenna: u16, rssi: Option<f32>) -> Self {
        Self::at(tag_id, reader_id, antenna, rssi, Timestamp::now())
    }

    /// Create a tag read with an explicit capture time
    pub fn at(
        tag_id: TagId,
        reader_id: impl Into<String>,
        antenna: u16,
        rssi: Option<f32>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            tag_id,
            reader_id: reader_id.into(),
            antenna,
            rssi,
            timestamp,
        }
    }
}

/// Why a dedup entry was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// The entry's window elapsed
    WindowClosed,
    /// The entry saw no reads for longer than the idle bound
    Idle,
    /// The working set exceeded its capacity
    Capacity,
    /// Explicit drain (shutdown)
    Drain,
}

/// Coalesced output for one appearance of a tag at a reader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEvent {
    pub event_id: Uuid,
    pub tag_id: TagId,
    pub reader_id: String,
    /// Antenna of the first read in the window
    pub antenna: u16,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub read_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_rssi: Option<f32>,
    pub reason: FlushReason,
}

/// Connection status of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    /// Not connected (initial state, or waiting out a backoff)
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and reading
    Connected,
    /// Gave up after repeated failures; needs an explicit reset
    Faulted,
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderStatus::Disconnected => write!(f, "Disconnected"),
            ReaderStatus::Connecting => write!(f, "Connecting..."),
            ReaderStatus::Connected => write!(f, "Connected"),
            ReaderStatus::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Health of a single reader connection
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaderState {
    pub reader_id: String,
    pub status: ReaderStatus,
    /// Connect attempts that failed since the last successful open
    pub consecutive_failures: u32,
    /// Wall-clock time of the last chunk received
    pub last_read_at: Option<DateTime<Utc>>,
    /// Most recent connection error
    pub last_error: Option<String>,
    /// Successful opens since start
    pub connects: u64,
    /// Backoff before the pending reconnect attempt
    pub retry_delay_ms: Option<u64>,
}

impl ReaderState {
    /// Fresh state for a reader
    pub fn new(reader_id: impl Into<String>) -> Self {
        Self {
            reader_id: reader_id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tag_id_display_ascii() {
        let tag = TagId::from("0004A1B2C3D4");
        assert_eq!(tag.to_string(), "0004A1B2C3D4");
    }

    #[test]
    fn test_tag_id_display_binary_as_hex() {
        let tag = TagId::new(vec![0xE2, 0x80, 0x11, 0x05]);
        assert_eq!(tag.to_string(), "E2801105");
    }

    #[test]
    fn test_tag_id_from_hex() {
        let tag = TagId::from_hex("e2801105").unwrap();
        assert_eq!(tag.as_bytes(), &[0xE2, 0x80, 0x11, 0x05]);
        assert!(TagId::from_hex("xyz").is_err());
    }

    #[test]
    fn test_timestamp_offset_moves_both_clocks() {
        let base = Timestamp::now();
        let later = base.offset(Duration::from_millis(250));
        assert_eq!(later.monotonic - base.monotonic, Duration::from_millis(250));
        assert_eq!((later.wall - base.wall).num_milliseconds(), 250);
    }

    #[test]
    fn test_presence_event_serializes_wall_clock_only() {
        let ts = Timestamp::now();
        let event = PresenceEvent {
            event_id: Uuid::new_v4(),
            tag_id: TagId::new(vec![0xAB, 0x01]),
            reader_id: "gate".to_string(),
            antenna: 2,
            first_seen: ts,
            last_seen: ts,
            read_count: 3,
            peak_rssi: None,
            reason: FlushReason::WindowClosed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tag_id"], "AB01");
        assert_eq!(json["reason"], "window_closed");
        assert!(json["first_seen"]["at"].is_string());
        assert!(json["first_seen"].get("monotonic").is_none());
        assert!(json.get("peak_rssi").is_none());
    }

    #[test]
    fn test_reader_status_display() {
        assert_eq!(ReaderStatus::Faulted.to_string(), "Faulted");
        assert_eq!(ReaderStatus::default(), ReaderStatus::Disconnected);
    }
}

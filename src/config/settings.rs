//! Section types for the pipeline configuration file
//!
//! Every section deserializes with defaults so a minimal file only needs
//! its `[[readers]]` entries. Durations are stored in milliseconds and
//! exposed as [`Duration`] through accessor methods.
//!
//! # Main Types
//!
//! - [`ReaderConfig`] - One reader: endpoint, decoder and reconnect policy
//! - [`DedupSettings`] - Window length and policy
//! - [`QueueSettings`] - Delivery queue capacity and overflow policy
//! - [`DeliverySettings`] - Retry bounds and dead-letter routing
//! - [`SinkSettings`] / [`PresenceSettings`] / [`LoggingSettings`]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ==================== Readers ====================

/// Configuration of a single reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Unique reader id, carried on every event from this reader
    pub id: String,

    /// Frame format produced by the reader
    #[serde(default)]
    pub decoder: DecoderKind,

    /// Longest accepted line for the line decoder
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Where and how to connect
    pub endpoint: EndpointConfig,

    /// Reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Keyboard-wedge decoder settings
    #[serde(default)]
    pub keyboard: KeyboardSettings,
}

impl ReaderConfig {
    /// Reader with default decoder and reconnect settings
    pub fn new(id: impl Into<String>, endpoint: EndpointConfig) -> Self {
        Self {
            id: id.into(),
            decoder: DecoderKind::default(),
            max_line_length: default_max_line_length(),
            endpoint,
            reconnect: ReconnectSettings::default(),
            keyboard: KeyboardSettings::default(),
        }
    }
}

fn default_max_line_length() -> usize {
    512
}

/// Reader endpoint descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// Network reader speaking the line protocol
    Tcp {
        address: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    /// Character device such as `/dev/input/event3`
    Device {
        path: PathBuf,
        /// Take exclusive access (EVIOCGRAB) so scans don't also reach the desktop
        #[serde(default = "default_grab")]
        grab: bool,
    },
    /// Simulated reader emitting line-protocol frames
    Virtual {
        /// Hex tag ids to cycle through
        tags: Vec<String>,
        #[serde(default = "default_virtual_interval_ms")]
        interval_ms: u64,
        #[serde(default = "default_antenna_count")]
        antennas: u16,
    },
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_grab() -> bool {
    true
}

fn default_virtual_interval_ms() -> u64 {
    100
}

fn default_antenna_count() -> u16 {
    1
}

/// Frame format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// `TAG,<hex>,<antenna>,<rssi>` lines
    #[default]
    Line,
    /// Linux input events from a keyboard-wedge reader
    Keyboard,
}

/// Reconnect/backoff policy for a reader
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Uptime after which the backoff is reset
    pub min_uptime_ms: u64,
    /// Failed connects before the reader is marked faulted
    pub max_consecutive_failures: u32,
    /// Idle poll interval for driver reads
    pub read_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            min_uptime_ms: 60_000,
            max_consecutive_failures: 5,
            read_timeout_ms: 200,
        }
    }
}

impl ReconnectSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Keyboard-wedge decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardSettings {
    /// Exact number of characters in a valid id
    pub id_length: usize,
}

impl Default for KeyboardSettings {
    fn default() -> Self {
        Self { id_length: 12 }
    }
}

// ==================== Dedup ====================

/// Window policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Window start never moves; bounds latency under continuous reads
    #[default]
    Fixed,
    /// Every read restarts the window
    Sliding,
}

/// Deduplication window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub window_ms: u64,
    pub policy: WindowPolicy,
    /// Idle entries older than `window * safety_factor` are force-flushed
    pub safety_factor: u32,
    /// Working-set bound per reader
    pub max_entries: usize,
    /// Number of lock shards (rounded up to a power of two)
    pub shards: usize,
    /// Flush ticker interval
    pub flush_tick_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            policy: WindowPolicy::Fixed,
            safety_factor: 3,
            max_entries: 100_000,
            shards: 16,
            flush_tick_ms: 50,
        }
    }
}

impl DedupSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_idle(&self) -> Duration {
        self.window() * self.safety_factor.max(1)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms)
    }
}

// ==================== Queue & Delivery ====================

/// What to do when the delivery queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producers stall until space frees
    #[default]
    Backpressure,
    /// Drop the oldest queued event and count it
    DropOldest,
}

/// Delivery queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// How long a stalled producer waits before reporting a stall
    pub stall_report_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            overflow: OverflowPolicy::Backpressure,
            stall_report_ms: 1_000,
        }
    }
}

impl QueueSettings {
    pub fn stall_report(&self) -> Duration {
        Duration::from_millis(self.stall_report_ms)
    }
}

/// Dead-letter routing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterSettings {
    /// Drop with a counter and an error log
    #[default]
    Discard,
    /// Append to a JSON-lines file
    Jsonl { path: PathBuf },
}

/// Delivery worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub workers: usize,
    /// Total attempts per event, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub dead_letter: DeadLetterSettings,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            workers: 1,
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            dead_letter: DeadLetterSettings::Discard,
        }
    }
}

impl DeliverySettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Downstream sink used by the binary
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkSettings {
    /// Log each event through tracing
    #[default]
    Log,
    /// Append each event to a JSON-lines file
    Jsonl { path: PathBuf },
}

// ==================== Presence & Logging ====================

/// Current-tag tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// Inactivity after which the current tag expires
    pub timeout_ms: u64,
    /// Optional JSON file that keeps the current tag across restarts
    pub state_file: Option<PathBuf>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 8_000,
            state_file: None,
        }
    }
}

impl PresenceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Directory for a daily rolling log file
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info,rfidreader=debug".to_string(),
            directory: None,
            file_prefix: "rfidreader.log".to_string(),
        }
    }
}

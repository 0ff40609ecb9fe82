//! Configuration module for rfidreader
//!
//! The pipeline is configured from a single TOML file. All sections except
//! `[[readers]]` are optional and fall back to defaults.
//!
//! # Config Location
//!
//! When no path is given on the command line the file is looked up in the
//! platform-appropriate config directory under `rfidreader`:
//!
//! - **Linux**: `~/.config/rfidreader/rfidreader.toml`
//! - **macOS**: `~/Library/Application Support/rfidreader/rfidreader.toml`
//! - **Windows**: `%APPDATA%\rfidreader\rfidreader.toml`
//!
//! # Example
//!
//! ```toml
//! shutdown_timeout_ms = 5000
//!
//! [[readers]]
//! id = "dock-door-1"
//! decoder = "line"
//! endpoint = { kind = "tcp", address = "10.0.0.5:5084" }
//!
//! [[readers]]
//! id = "desk"
//! decoder = "keyboard"
//! endpoint = { kind = "device", path = "/dev/input/event3" }
//!
//! [dedup]
//! window_ms = 1000
//! policy = "fixed"
//!
//! [queue]
//! capacity = 10000
//! overflow = "backpressure"
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{RfidError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "rfidreader";

/// Config filename
pub const CONFIG_FILE: &str = "rfidreader.toml";

/// Upper bound on `dedup.shards`
pub const MAX_DEDUP_SHARDS: usize = 1024;

/// Default graceful-shutdown timeout in milliseconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on `stop()` before remaining work is abandoned
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Configured readers, one lane each
    #[serde(default)]
    pub readers: Vec<ReaderConfig>,

    #[serde(default)]
    pub dedup: DedupSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub delivery: DeliverySettings,

    #[serde(default)]
    pub sink: SinkSettings,

    #[serde(default)]
    pub presence: PresenceSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            readers: Vec::new(),
            dedup: DedupSettings::default(),
            queue: QueueSettings::default(),
            delivery: DeliverySettings::default(),
            sink: SinkSettings::default(),
            presence: PresenceSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Config with the given readers and defaults everywhere else
    pub fn with_readers(readers: Vec<ReaderConfig>) -> Self {
        Self {
            readers,
            ..Default::default()
        }
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RfidError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(
            "Loaded config from {:?} ({} readers)",
            path,
            config.readers.len()
        );
        Ok(config)
    }

    /// Parse and validate a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RfidError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RfidError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Graceful-shutdown timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Look up a reader by id
    pub fn reader(&self, id: &str) -> Option<&ReaderConfig> {
        self.readers.iter().find(|r| r.id == id)
    }

    /// Check the config for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.readers.is_empty() {
            return Err(RfidError::Config("at least one reader is required".into()));
        }

        let mut seen = HashSet::new();
        for reader in &self.readers {
            if reader.id.trim().is_empty() {
                return Err(RfidError::Config("reader id must not be empty".into()));
            }
            if !seen.insert(reader.id.as_str()) {
                return Err(RfidError::Config(format!(
                    "duplicate reader id `{}`",
                    reader.id
                )));
            }
            validate_reader(reader)?;
        }

        if self.dedup.window_ms == 0 {
            return Err(RfidError::Config("dedup.window_ms must be positive".into()));
        }
        if self.dedup.safety_factor == 0 {
            return Err(RfidError::Config(
                "dedup.safety_factor must be at least 1".into(),
            ));
        }
        if self.dedup.max_entries == 0 || self.dedup.shards == 0 || self.dedup.flush_tick_ms == 0
        {
            return Err(RfidError::Config(
                "dedup.max_entries, dedup.shards and dedup.flush_tick_ms must be positive".into(),
            ));
        }
        if self.dedup.shards > MAX_DEDUP_SHARDS {
            return Err(RfidError::Config(format!(
                "dedup.shards must not exceed {MAX_DEDUP_SHARDS}"
            )));
        }
        if self.queue.capacity == 0 {
            return Err(RfidError::Config("queue.capacity must be positive".into()));
        }
        if self.delivery.workers == 0 {
            return Err(RfidError::Config("delivery.workers must be positive".into()));
        }
        if self.delivery.max_attempts == 0 {
            return Err(RfidError::Config(
                "delivery.max_attempts must be at least 1".into(),
            ));
        }
        if self.delivery.initial_backoff_ms > self.delivery.max_backoff_ms {
            return Err(RfidError::Config(
                "delivery.initial_backoff_ms exceeds delivery.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

fn validate_reader(reader: &ReaderConfig) -> Result<()> {
    let id = &reader.id;
    let reconnect = &reader.reconnect;
    if reconnect.initial_backoff_ms == 0 || reconnect.initial_backoff_ms > reconnect.max_backoff_ms
    {
        return Err(RfidError::Config(format!(
            "reader `{id}`: backoff bounds must satisfy 0 < initial <= max"
        )));
    }
    if reconnect.max_consecutive_failures == 0 {
        return Err(RfidError::Config(format!(
            "reader `{id}`: max_consecutive_failures must be at least 1"
        )));
    }
    if reconnect.read_timeout_ms == 0 {
        return Err(RfidError::Config(format!(
            "reader `{id}`: read_timeout_ms must be positive"
        )));
    }
    if reader.decoder == DecoderKind::Keyboard && reader.keyboard.id_length == 0 {
        return Err(RfidError::Config(format!(
            "reader `{id}`: keyboard.id_length must be positive"
        )));
    }
    if reader.max_line_length == 0 {
        return Err(RfidError::Config(format!(
            "reader `{id}`: max_line_length must be positive"
        )));
    }

    match &reader.endpoint {
        EndpointConfig::Tcp { address, .. } if address.trim().is_empty() => Err(
            RfidError::Config(format!("reader `{id}`: tcp address must not be empty")),
        ),
        EndpointConfig::Virtual {
            tags, interval_ms, ..
        } => {
            if tags.is_empty() || *interval_ms == 0 {
                return Err(RfidError::Config(format!(
                    "reader `{id}`: virtual reader needs tags and a positive interval"
                )));
            }
            for tag in tags {
                if tag.is_empty() || hex::decode(tag).is_err() {
                    return Err(RfidError::Config(format!(
                        "reader `{id}`: virtual tag `{tag}` is not valid hex"
                    )));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

//! Downstream event sinks
//!
//! [`EventSink`] is the delivery contract. A sink returns `Err` for a
//! transient failure and the delivery worker retries; it must not retry
//! internally. The dead-letter destination is also an `EventSink`.

use crate::config::{DeadLetterSettings, SinkSettings};
use crate::error::{Result, ResultExt, RfidError};
use crate::types::PresenceEvent;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Destination for delivered presence events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &PresenceEvent) -> Result<()>;
}

/// Logs each event through `tracing`
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver(&self, event: &PresenceEvent) -> Result<()> {
        tracing::info!(
            target: "rfidreader::events",
            event_id = %event.event_id,
            reader = %event.reader_id,
            antenna = event.antenna,
            reads = event.read_count,
            reason = ?event.reason,
            "tag {} present {} .. {}",
            event.tag_id,
            event.first_seen.wall.format("%H:%M:%S%.3f"),
            event.last_seen.wall.format("%H:%M:%S%.3f"),
        );
        Ok(())
    }
}

/// Appends each event as one JSON object per line
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open (or create) the file in append mode, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(RfidError::from)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(RfidError::from)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesSink {
    fn deliver(&self, event: &PresenceEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Forwards events to an in-process consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<PresenceEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<PresenceEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &PresenceEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| RfidError::Delivery("event consumer disconnected".into()))
    }
}

/// Build the primary sink from configuration
pub fn build_sink(settings: &SinkSettings) -> Result<Arc<dyn EventSink>> {
    Ok(match settings {
        SinkSettings::Log => Arc::new(LogSink),
        SinkSettings::Jsonl { path } => Arc::new(JsonLinesSink::open(path).context("Event sink")?),
    })
}

/// Build the dead-letter sink; `None` means exhausted events are discarded
pub fn build_dead_letter(settings: &DeadLetterSettings) -> Result<Option<Arc<dyn EventSink>>> {
    Ok(match settings {
        DeadLetterSettings::Discard => None,
        DeadLetterSettings::Jsonl { path } => {
            Some(Arc::new(JsonLinesSink::open(path).context("Dead-letter sink")?))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlushReason, TagId, Timestamp};
    use crossbeam_channel::unbounded;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn event() -> PresenceEvent {
        let ts = Timestamp::now();
        PresenceEvent {
            event_id: Uuid::new_v4(),
            tag_id: TagId::new(vec![0xE2, 0x00]),
            reader_id: "dock".into(),
            antenna: 3,
            first_seen: ts,
            last_seen: ts,
            read_count: 7,
            peak_rssi: Some(-48.0),
            reason: FlushReason::Drain,
        }
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("events.jsonl");
        let sink = JsonLinesSink::open(&path).unwrap();
        sink.deliver(&event()).unwrap();
        sink.deliver(&event()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["tag_id"], "E200");
        assert_eq!(parsed["read_count"], 7);
        assert_eq!(parsed["reason"], "drain");
    }

    #[test]
    fn test_channel_sink_fails_when_consumer_gone() {
        let (tx, rx) = unbounded();
        let sink = ChannelSink::new(tx);
        sink.deliver(&event()).unwrap();
        assert_eq!(rx.try_recv().unwrap().read_count, 7);
        drop(rx);
        assert!(matches!(sink.deliver(&event()), Err(RfidError::Delivery(_))));
    }

    #[test]
    fn test_build_dead_letter_discard_is_none() {
        assert!(build_dead_letter(&DeadLetterSettings::Discard).unwrap().is_none());
        let dir = TempDir::new().unwrap();
        let settings = DeadLetterSettings::Jsonl {
            path: dir.path().join("dead.jsonl"),
        };
        assert!(build_dead_letter(&settings).unwrap().is_some());
    }
}

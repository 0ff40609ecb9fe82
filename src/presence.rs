//! Current-tag tracking
//!
//! Keeps the most recent tag seen by each reader. A tag expires once the
//! reader has been quiet for longer than the presence timeout; expiry is
//! applied lazily when the current tag is queried.
//!
//! An unreadable scan invalidates the reader's current tag immediately.
//!
//! With a state file configured the map is saved as JSON whenever the
//! current tag changes or expires (and periodically while it stays the
//! same), and loaded at start so the current tag survives a restart.

use crate::config::PresenceSettings;
use crate::error::{Result, ResultExt, RfidError};
use crate::types::TagId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Most recent tag at a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTag {
    pub tag_id: TagId,
    pub antenna: u16,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTag {
    tag_hex: String,
    antenna: u16,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    readers: BTreeMap<String, PersistedTag>,
}

#[derive(Debug, Default)]
struct Inner {
    current: BTreeMap<String, CurrentTag>,
    /// When each reader's entry was last written to disk
    saved_at: BTreeMap<String, DateTime<Utc>>,
}

/// Tracker of the current tag per reader
#[derive(Debug)]
pub struct PresenceTracker {
    timeout: chrono::Duration,
    state_file: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl PresenceTracker {
    /// In-memory tracker with the given inactivity timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            state_file: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Build from settings, loading the state file if one exists
    pub fn from_settings(settings: &PresenceSettings) -> Self {
        let mut tracker = Self::new(settings.timeout());
        if let Some(path) = &settings.state_file {
            tracker.state_file = Some(path.clone());
            if path.exists() {
                match load_state(path) {
                    Ok(loaded) => {
                        tracing::debug!("Loaded presence state for {} readers", loaded.current.len());
                        tracker.inner = Mutex::new(loaded);
                    }
                    Err(e) => tracing::warn!(
                        "Ignoring unreadable presence state {}: {}",
                        path.display(),
                        e
                    ),
                }
            }
        }
        tracker
    }

    /// Record a tag read at `at`
    pub fn record(&self, reader_id: &str, tag_id: &TagId, antenna: u16, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let changed = inner
            .current
            .get(reader_id)
            .map_or(true, |current| &current.tag_id != tag_id);
        if changed {
            tracing::debug!("[{}] current tag is now {}", reader_id, tag_id);
        }

        inner.current.insert(
            reader_id.to_string(),
            CurrentTag {
                tag_id: tag_id.clone(),
                antenna,
                seen_at: at,
            },
        );

        // Refresh the saved timestamp before it could expire on reload
        let stale = inner
            .saved_at
            .get(reader_id)
            .map_or(true, |saved| at - *saved >= self.timeout / 2);
        if changed || stale {
            inner.saved_at.insert(reader_id.to_string(), at);
            self.save(&inner);
        }
    }

    /// Current tag at `now`, clearing it if it has expired
    pub fn current_at(&self, reader_id: &str, now: DateTime<Utc>) -> Option<CurrentTag> {
        let mut inner = self.inner.lock();
        let current = inner.current.get(reader_id)?.clone();
        if now - current.seen_at > self.timeout {
            tracing::debug!("[{}] current tag {} expired", reader_id, current.tag_id);
            inner.current.remove(reader_id);
            inner.saved_at.remove(reader_id);
            self.save(&inner);
            return None;
        }
        Some(current)
    }

    /// Current tag now
    pub fn current(&self, reader_id: &str) -> Option<CurrentTag> {
        self.current_at(reader_id, Utc::now())
    }

    /// Drop the reader's current tag, e.g. after an unreadable scan
    pub fn invalidate(&self, reader_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.current.remove(reader_id) {
            tracing::debug!("[{}] current tag {} invalidated", reader_id, previous.tag_id);
            inner.saved_at.remove(reader_id);
            self.save(&inner);
        }
    }

    fn save(&self, inner: &Inner) {
        let Some(path) = &self.state_file else {
            return;
        };
        if let Err(e) = save_state(path, inner) {
            tracing::warn!("Failed to save presence state to {}: {}", path.display(), e);
        }
    }
}

fn load_state(path: &Path) -> Result<Inner> {
    let json = std::fs::read_to_string(path)
        .map_err(RfidError::from)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let state: PersistedState = serde_json::from_str(&json)?;
    let mut inner = Inner::default();
    for (reader_id, tag) in state.readers {
        let tag_id = TagId::from_hex(&tag.tag_hex)
            .map_err(|e| RfidError::Serialization(format!("tag {}: {}", tag.tag_hex, e)))?;
        inner.saved_at.insert(reader_id.clone(), tag.seen_at);
        inner.current.insert(
            reader_id,
            CurrentTag {
                tag_id,
                antenna: tag.antenna,
                seen_at: tag.seen_at,
            },
        );
    }
    Ok(inner)
}

fn save_state(path: &Path, inner: &Inner) -> Result<()> {
    let state = PersistedState {
        readers: inner
            .current
            .iter()
            .map(|(reader_id, current)| {
                let seen_at = inner.saved_at.get(reader_id).copied().unwrap_or(current.seen_at);
                (
                    reader_id.clone(),
                    PersistedTag {
                        tag_hex: current.tag_id.to_hex(),
                        antenna: current.antenna,
                        seen_at,
                    },
                )
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&state)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tag() -> TagId {
        TagId::from("0004A1B2C3D4")
    }

    #[test]
    fn test_current_expires_after_timeout() {
        let tracker = PresenceTracker::new(Duration::from_secs(8));
        let t0 = Utc::now();
        tracker.record("desk", &tag(), 0, t0);

        let current = tracker.current_at("desk", t0 + chrono::Duration::seconds(8)).unwrap();
        assert_eq!(current.tag_id, tag());
        assert!(tracker.current_at("desk", t0 + chrono::Duration::seconds(9)).is_none());
        // Expiry cleared the entry for good
        assert!(tracker.current_at("desk", t0).is_none());
    }

    #[test]
    fn test_readers_are_independent() {
        let tracker = PresenceTracker::new(Duration::from_secs(8));
        let now = Utc::now();
        tracker.record("a", &TagId::from("AAAA"), 1, now);
        tracker.record("b", &TagId::from("BBBB"), 2, now);
        tracker.record("a", &TagId::from("CCCC"), 1, now);
        assert_eq!(tracker.current_at("a", now).unwrap().tag_id.to_string(), "CCCC");
        assert_eq!(tracker.current_at("b", now).unwrap().antenna, 2);
        assert!(tracker.current_at("c", now).is_none());
    }

    #[test]
    fn test_invalidate_forgets_current_tag() {
        let dir = TempDir::new().unwrap();
        let settings = PresenceSettings {
            timeout_ms: 60_000,
            state_file: Some(dir.path().join("presence.json")),
        };
        let now = Utc::now();
        let tracker = PresenceTracker::from_settings(&settings);
        tracker.record("desk", &tag(), 0, now);
        tracker.record("dock", &TagId::from("BBBB"), 1, now);

        tracker.invalidate("desk");
        tracker.invalidate("nowhere");
        assert!(tracker.current_at("desk", now).is_none());
        assert!(tracker.current_at("dock", now).is_some());

        let reloaded = PresenceTracker::from_settings(&settings);
        assert!(reloaded.current_at("desk", now).is_none());
        assert_eq!(reloaded.current_at("dock", now).unwrap().antenna, 1);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let settings = PresenceSettings {
            timeout_ms: 60_000,
            state_file: Some(dir.path().join("presence.json")),
        };
        let now = Utc::now();
        {
            let tracker = PresenceTracker::from_settings(&settings);
            tracker.record("desk", &tag(), 0, now);
        }

        let reloaded = PresenceTracker::from_settings(&settings);
        let current = reloaded.current_at("desk", now).unwrap();
        assert_eq!(current.tag_id, tag());
        assert_eq!(current.seen_at, now);

        // Expiry is persisted too
        assert!(reloaded
            .current_at("desk", now + chrono::Duration::seconds(61))
            .is_none());
        let again = PresenceTracker::from_settings(&settings);
        assert!(again.current_at("desk", now).is_none());
    }

    #[test]
    fn test_corrupt_state_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("presence.json");
        std::fs::write(&path, "not json").unwrap();
        let settings = PresenceSettings {
            timeout_ms: 1_000,
            state_file: Some(path),
        };
        let tracker = PresenceTracker::from_settings(&settings);
        assert!(tracker.current("desk").is_none());
        // The next change overwrites the bad file
        tracker.record("desk", &tag(), 0, Utc::now());
        let reloaded = PresenceTracker::from_settings(&settings);
        assert_eq!(reloaded.current("desk").unwrap().tag_id, tag());
    }
}

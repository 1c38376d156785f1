//! Bounded on-disk queue of events waiting for redelivery.
//!
//! One directory per store, one JSON file per entry:
//!
//! ```text
//! <dir>/
//!   00000000000000000001.json
//!   00000000000000000002.json
//!   .00000000000000000003.json.tmp.1718000000000000000   <- interrupted write
//! ```
//!
//! File names are the zero-padded insertion sequence, so directory order is
//! FIFO order and every entry can be deleted without touching the others.
//! Writes go to a hidden temp file that is synced and renamed into place, so a
//! crash mid-write leaves at most one stray temp file, removed on the next
//! [`DiskStore::open`]. Entries that fail to parse are discarded one by one.
//!
//! The store is not thread-safe. The transport worker is its only owner.

use crate::{Event, TransportError, TransportResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "json";

/// Insertion-ordered key of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueEntryId(u64);

impl QueueEntryId {
    pub fn sequence(&self) -> u64 {
        self.0
    }

    fn file_name(&self) -> String {
        format!("{:020}.{ENTRY_EXTENSION}", self.0)
    }
}

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event held for a later drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub event: Event,
    pub enqueued_at: DateTime<Utc>,
    /// Network attempts already spent on this event.
    pub attempt_count: u32,
}

/// Result of [`DiskStore::persist`].
#[derive(Debug)]
pub struct PersistOutcome {
    pub id: QueueEntryId,
    /// Oldest entries pushed out to respect `max_events`.
    pub evicted: Vec<QueueEntry>,
}

/// Bounded FIFO store, mirrored in memory.
pub struct DiskStore {
    dir: PathBuf,
    max_events: usize,
    entries: BTreeMap<QueueEntryId, QueueEntry>,
    next_sequence: u64,
}

impl DiskStore {
    /// Open (or create) the store at `dir` and recover its entries.
    ///
    /// If more than `max_events` entries survive recovery the oldest are
    /// deleted.
    pub fn open(dir: impl Into<PathBuf>, max_events: usize) -> TransportResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut entries = BTreeMap::new();
        let mut discarded = 0usize;

        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if is_temp_file(name) {
                debug!(file = %name, "Removing interrupted store write");
                remove_file_if_exists(&path);
                continue;
            }
            let Some(sequence) = parse_entry_file_name(name) else {
                continue;
            };

            match read_entry(&path) {
                Ok(mut entry) => {
                    entry.id = QueueEntryId(sequence);
                    entries.insert(entry.id, entry);
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "Discarding corrupt store entry");
                    remove_file_if_exists(&path);
                    discarded += 1;
                }
            }
        }

        let next_sequence = entries
            .keys()
            .next_back()
            .map(|id| id.0 + 1)
            .unwrap_or(1);

        let mut store = Self {
            dir,
            max_events: max_events.max(1),
            entries,
            next_sequence,
        };
        let evicted = store.evict_overflow();

        info!(
            dir = %store.dir.display(),
            entries = store.entries.len(),
            discarded,
            evicted = evicted.len(),
            "Opened event store"
        );
        Ok(store)
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: QueueEntryId) -> Option<&QueueEntry> {
        self.entries.get(&id)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    /// Write `event` as the newest entry, then evict the oldest entries
    /// beyond `max_events`.
    ///
    /// A failed write leaves the store untouched; nothing is evicted for it.
    pub fn persist(&mut self, event: Event, attempt_count: u32) -> TransportResult<PersistOutcome> {
        let id = QueueEntryId(self.next_sequence);
        let entry = QueueEntry {
            id,
            event,
            enqueued_at: Utc::now(),
            attempt_count,
        };

        self.write_entry(&entry)?;
        self.next_sequence += 1;

        debug!(
            entry_id = %id,
            event_id = %entry.event.id,
            attempt_count,
            "Persisted event"
        );
        self.entries.insert(id, entry);
        let evicted = self.evict_overflow();

        Ok(PersistOutcome { id, evicted })
    }

    /// Up to `limit` entries, oldest first. Entries stay stored until removed.
    pub fn drain_batch(&self, limit: usize) -> Vec<QueueEntry> {
        self.entries.values().take(limit).cloned().collect()
    }

    /// Delete an entry. Returns it if it was present.
    pub fn remove(&mut self, id: QueueEntryId) -> TransportResult<Option<QueueEntry>> {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(None);
        };
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                // Keep memory and disk consistent: the file is still there.
                self.entries.insert(id, entry);
                return Err(e.into());
            }
        }
        debug!(entry_id = %id, "Removed stored event");
        Ok(Some(entry))
    }

    /// Count one more failed attempt for a stored entry, rewriting it in place.
    ///
    /// Returns the new attempt count, or `None` if the entry is gone.
    pub fn record_failed_attempt(&mut self, id: QueueEntryId) -> TransportResult<Option<u32>> {
        let Some(current) = self.entries.get(&id) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        updated.attempt_count = updated.attempt_count.saturating_add(1);

        self.write_entry(&updated)?;
        let attempt_count = updated.attempt_count;
        self.entries.insert(id, updated);
        Ok(Some(attempt_count))
    }

    /// Change the capacity. Lowering it evicts the oldest entries right away.
    pub fn set_max_events(&mut self, max_events: usize) -> Vec<QueueEntry> {
        self.max_events = max_events.max(1);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Vec<QueueEntry> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_events {
            let Some((id, entry)) = self.entries.pop_first() else {
                break;
            };
            remove_file_if_exists(&self.entry_path(id));
            warn!(
                entry_id = %id,
                event_id = %entry.event.id,
                max_events = self.max_events,
                "Evicted oldest stored event"
            );
            evicted.push(entry);
        }
        evicted
    }

    fn entry_path(&self, id: QueueEntryId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    fn write_entry(&self, entry: &QueueEntry) -> TransportResult<()> {
        let bytes = serde_json::to_vec(entry)?;
        atomic_write(&self.entry_path(entry.id), &bytes)
    }
}

/// Write via a synced temp file renamed over `path`.
fn atomic_write(path: &Path, content: &[u8]) -> TransportResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TransportError::Storage(format!("{} has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransportError::Storage(format!("{} has no file name", path.display())))?;

    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        file_name,
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));

    let write_result = (|| -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

fn read_entry(path: &Path) -> TransportResult<QueueEntry> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

fn parse_entry_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(ENTRY_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn remove_file_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete store file");
        }
    }
}

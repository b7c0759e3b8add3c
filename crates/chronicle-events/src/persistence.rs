//! The durable event-log collaborator.
//!
//! The core never waits on persistence: events reach an
//! [`EventPersistence`] through the [`WriteBehind`](crate::WriteBehind)
//! task. The only ordering contract is that [`load_events_since`] returns
//! events in logical sequence order.
//!
//! [`load_events_since`]: EventPersistence::load_events_since

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chronicle_types::{Event, EventId};

/// Errors reported by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Reading or writing the backing file failed.
    #[error("event log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event could not be encoded or a stored line could not be decoded.
    #[error("event log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lock guarding the backend was poisoned.
    #[error("persistence lock poisoned")]
    LockPoisoned,
}

/// A durable store for events.
pub trait EventPersistence: Send + Sync {
    /// Durably record one event.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the backend rejects the write.
    fn persist_event(&self, event: &Event) -> Result<(), PersistError>;

    /// Durably record a batch of events, in order.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on the first failed write.
    fn persist_batch(&self, events: &[Arc<Event>]) -> Result<(), PersistError> {
        for event in events {
            self.persist_event(event)?;
        }
        Ok(())
    }

    /// Every stored event with an id greater than `after` (all for `None`),
    /// in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the backend cannot be read.
    fn load_events_since(&self, after: Option<EventId>) -> Result<Vec<Event>, PersistError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Keeps persisted events in memory. Used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    events: Mutex<Vec<Event>>,
}

impl InMemoryPersistence {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().map_or(0, |events| events.len())
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventPersistence for InMemoryPersistence {
    fn persist_event(&self, event: &Event) -> Result<(), PersistError> {
        let mut events = self.events.lock().map_err(|_poisoned| PersistError::LockPoisoned)?;
        events.push(event.clone());
        Ok(())
    }

    fn load_events_since(&self, after: Option<EventId>) -> Result<Vec<Event>, PersistError> {
        let events = self.events.lock().map_err(|_poisoned| PersistError::LockPoisoned)?;
        let mut loaded: Vec<Event> = events
            .iter()
            .filter(|e| after.is_none_or(|after| e.id > after))
            .cloned()
            .collect();
        loaded.sort_by_key(|e| e.id);
        Ok(loaded)
    }
}

// ---------------------------------------------------------------------------
// JSON-lines file backend
// ---------------------------------------------------------------------------

/// Appends one JSON-encoded event per line to a file.
#[derive(Debug)]
pub struct JsonLinesPersistence {
    path: PathBuf,
    /// Serializes writers so lines never interleave.
    write_lock: Mutex<()>,
}

impl JsonLinesPersistence {
    /// Use the file at `path`, creating it on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_lines(&self, events: &[&Event]) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().map_err(|_poisoned| PersistError::LockPoisoned)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl EventPersistence for JsonLinesPersistence {
    fn persist_event(&self, event: &Event) -> Result<(), PersistError> {
        self.append_lines(&[event])
    }

    fn persist_batch(&self, events: &[Arc<Event>]) -> Result<(), PersistError> {
        let refs: Vec<&Event> = events.iter().map(AsRef::as_ref).collect();
        self.append_lines(&refs)
    }

    fn load_events_since(&self, after: Option<EventId>) -> Result<Vec<Event>, PersistError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        let mut loaded = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)?;
            if after.is_none_or(|after| event.id > after) {
                loaded.push(event);
            }
        }
        loaded.sort_by_key(|e| e.id);
        Ok(loaded)
    }
}

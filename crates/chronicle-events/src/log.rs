//! The append-only event log.
//!
//! The log assigns logical sequence numbers and holds every appended event
//! behind an [`Arc`] so readers share them without copying. Appends are
//! serialized by a single write lock; the critical section is a push onto
//! two vectors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use chronicle_types::{EntityId, Event, EventId};

use crate::draft::EventDraft;
use crate::EventError;

#[derive(Debug)]
struct LogInner {
    /// Events in strictly increasing id order.
    events: Vec<Arc<Event>>,
    /// Per-entity list of event ids touching the entity, in id order.
    by_entity: HashMap<EntityId, Vec<EventId>>,
    /// Id the next appended draft receives.
    next: EventId,
}

/// Totally ordered, append-only log of events.
#[derive(Debug)]
pub struct EventLog {
    inner: RwLock<LogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// An empty log whose first event will be [`EventId::FIRST`].
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LogInner {
                events: Vec::new(),
                by_entity: HashMap::new(),
                next: EventId::FIRST,
            }),
        }
    }

    /// Assign the next sequence number to `draft` and append it.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SequenceExhausted`] if the counter would
    /// overflow, or [`EventError::LockPoisoned`].
    pub fn append(&self, draft: EventDraft) -> Result<Arc<Event>, EventError> {
        let mut inner = self.inner.write().map_err(|_poisoned| EventError::LockPoisoned)?;
        let id = inner.next;
        let next = id.next().ok_or(EventError::SequenceExhausted)?;
        let event = Arc::new(draft.seal(id, Utc::now()));
        inner.push(Arc::clone(&event));
        inner.next = next;

        tracing::debug!(
            event_id = %event.id,
            kind = %event.kind,
            affected = event.affected.len(),
            depth = event.cascade_depth,
            "Appended event"
        );
        Ok(event)
    }

    /// Append an event that already carries a sequence number, e.g. one
    /// loaded back from persistence. Gaps are allowed; going backwards is not.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::OutOfOrder`] if `event.id` is not greater than
    /// every id already in the log.
    pub fn append_existing(&self, event: Event) -> Result<Arc<Event>, EventError> {
        let mut inner = self.inner.write().map_err(|_poisoned| EventError::LockPoisoned)?;
        if event.id < inner.next {
            let head = inner.events.last().map_or(EventId::new(0), |e| e.id);
            return Err(EventError::OutOfOrder { id: event.id, head });
        }
        let next = event.id.next().ok_or(EventError::SequenceExhausted)?;
        let event = Arc::new(event);
        inner.push(Arc::clone(&event));
        inner.next = next;
        Ok(event)
    }

    /// Look up an event by id.
    pub fn get(&self, id: EventId) -> Option<Arc<Event>> {
        let inner = self.inner.read().ok()?;
        inner
            .events
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .and_then(|idx| inner.events.get(idx))
            .cloned()
    }

    /// Events with an id greater than `after` (all events for `None`), in
    /// sequence order.
    pub fn events_since(&self, after: Option<EventId>) -> Vec<Arc<Event>> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let start = after.map_or(0, |after| inner.events.partition_point(|e| e.id <= after));
        inner.events.iter().skip(start).cloned().collect()
    }

    /// Every event touching `entity`, in sequence order.
    pub fn events_for(&self, entity: &EntityId) -> Vec<Arc<Event>> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let Some(ids) = inner.by_entity.get(entity) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                inner
                    .events
                    .binary_search_by_key(id, |e| e.id)
                    .ok()
                    .and_then(|idx| inner.events.get(idx))
                    .cloned()
            })
            .collect()
    }

    /// Id of the most recently appended event.
    pub fn last_id(&self) -> Option<EventId> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.events.last().map(|e| e.id))
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |inner| inner.events.len())
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogInner {
    fn push(&mut self, event: Arc<Event>) {
        for entity in &event.affected {
            self.by_entity
                .entry(entity.clone())
                .or_default()
                .push(event.id);
        }
        self.events.push(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chronicle_types::kinds::{ENTITY_DEATH, LOCATION_DISCOVERED};
    use chronicle_types::{EntityState, Occurrence};

    use super::*;
    use crate::registry::KindRegistry;

    fn draft(kind: &str, entities: &[&str]) -> EventDraft {
        let occ = Occurrence::new(kind, entities.iter().map(|&e| EntityId::from(e)));
        EventDraft::from_occurrence(occ, &KindRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let log = EventLog::new();
        let a = log.append(draft(ENTITY_DEATH, &["a"])).unwrap();
        let b = log.append(draft(ENTITY_DEATH, &["b"])).unwrap();
        assert_eq!(a.id, EventId::FIRST);
        assert_eq!(b.id, EventId::new(2));
        assert_eq!(log.last_id(), Some(EventId::new(2)));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn events_since_is_exclusive() {
        let log = EventLog::new();
        for _ in 0..5 {
            log.append(draft(LOCATION_DISCOVERED, &["map"])).unwrap();
        }
        let ids: Vec<u64> = log
            .events_since(Some(EventId::new(3)))
            .iter()
            .map(|e| e.id.get())
            .collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(log.events_since(None).len(), 5);
    }

    #[test]
    fn events_for_filters_by_entity() {
        let log = EventLog::new();
        log.append(draft(ENTITY_DEATH, &["a"])).unwrap();
        log.append(draft(ENTITY_DEATH, &["b"])).unwrap();
        log.append(
            EventDraft::creation(EntityId::from("a"), EntityState::new(), 0).unwrap(),
        )
        .unwrap();
        let ids: Vec<u64> = log
            .events_for(&EntityId::from("a"))
            .iter()
            .map(|e| e.id.get())
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn append_existing_rejects_going_backwards() {
        let log = EventLog::new();
        let first = log.append(draft(ENTITY_DEATH, &["a"])).unwrap();
        let mut stale = (*first).clone();
        stale.id = EventId::FIRST;
        assert!(matches!(
            log.append_existing(stale),
            Err(EventError::OutOfOrder { .. })
        ));

        let mut later = (*first).clone();
        later.id = EventId::new(10);
        log.append_existing(later).unwrap();
        let next = log.append(draft(ENTITY_DEATH, &["a"])).unwrap();
        assert_eq!(next.id, EventId::new(11));
        assert!(log.get(EventId::new(10)).is_some());
        assert!(log.get(EventId::new(5)).is_none());
    }

    #[test]
    fn concurrent_appends_get_unique_contiguous_ids() {
        let log = Arc::new(EventLog::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let log = Arc::clone(&log);
                scope.spawn(move || {
                    for _ in 0..50 {
                        log.append(draft(ENTITY_DEATH, &["a"])).unwrap();
                    }
                });
            }
        });
        let ids: Vec<u64> = log.events_since(None).iter().map(|e| e.id.get()).collect();
        let expected: Vec<u64> = (1..=400).collect();
        assert_eq!(ids, expected);
    }
}

//! The concurrent entity store.
//!
//! An arena of per-entity records: the outer map lock is held only long
//! enough to find or insert a record, and every record has its own mutex.
//! Callers that must advance several entities together (one event touching
//! a king and his realm) use [`EntityStore::with_locked`], which takes the
//! entity locks in sorted id order so concurrent multi-entity commits
//! cannot deadlock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chronicle_types::{
    AsOf, EntityId, EntityState, EventId, FieldDiff, StaleMarker, StateChange, Version,
};

use crate::reconstruct::{self, Reconstruction, replay};
use crate::record::EntityRecord;
use crate::{DEFAULT_CHECKPOINT_INTERVAL, StoreError};

type Slot = Arc<Mutex<EntityRecord>>;

/// A consistent read of one entity's current state.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    /// Current version.
    pub version: Version,
    /// Current state.
    pub state: Arc<EntityState>,
    /// Stale marker, if any.
    pub stale: Option<StaleMarker>,
    /// Turn of the most recent change (or of registration).
    pub last_turn: u64,
    /// Event behind the most recent change (or the creating event).
    pub last_event: EventId,
}

/// Versioned, concurrently accessible store of entities.
#[derive(Debug)]
pub struct EntityStore {
    entities: RwLock<HashMap<EntityId, Slot>>,
    checkpoint_interval: u64,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_INTERVAL)
    }
}

impl EntityStore {
    /// An empty store materializing a checkpoint every
    /// `checkpoint_interval` versions.
    pub fn new(checkpoint_interval: u64) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            checkpoint_interval,
        }
    }

    /// The configured checkpoint interval.
    pub const fn checkpoint_interval(&self) -> u64 {
        self.checkpoint_interval
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register `entity` at version 1 with `initial` state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    pub fn register(
        &self,
        entity: &EntityId,
        initial: EntityState,
        created_by: EventId,
        turn: u64,
    ) -> Result<Version, StoreError> {
        self.register_with(entity, initial, turn, || Ok::<_, StoreError>(created_by))
    }

    /// Register `entity`, obtaining the creating event id from `append`
    /// while the store's map lock is held.
    ///
    /// `append` runs only when the id is free, so a lost registration race
    /// never leaves a creation event behind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] (converted into `E`) if the id
    /// is taken, or whatever `append` fails with.
    pub fn register_with<E, F>(
        &self,
        entity: &EntityId,
        initial: EntityState,
        turn: u64,
        append: F,
    ) -> Result<Version, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Result<EventId, E>,
    {
        let mut entities = self
            .entities
            .write()
            .map_err(|_poisoned| StoreError::LockPoisoned)?;
        if entities.contains_key(entity) {
            return Err(StoreError::AlreadyExists {
                entity_id: entity.clone(),
            }
            .into());
        }
        let created_by = append()?;
        let record = EntityRecord::new(entity.clone(), initial, created_by, turn);
        entities.insert(entity.clone(), Arc::new(Mutex::new(record)));

        tracing::debug!(entity_id = %entity, event_id = %created_by, "Registered entity");
        Ok(Version::INITIAL)
    }

    /// Whether `entity` is registered.
    pub fn contains(&self, entity: &EntityId) -> bool {
        self.entities
            .read()
            .is_ok_and(|entities| entities.contains_key(entity))
    }

    /// Every registered id, sorted.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let Ok(entities) = self.entities.read() else {
            return Vec::new();
        };
        let mut ids: Vec<EntityId> = entities.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.read().map_or(0, |entities| entities.len())
    }

    /// Whether no entity is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Apply `diff` to `entity` as exactly one new version, provided the
    /// entity is still at `expected`.
    ///
    /// Concurrent calls with the same expected version race; exactly one
    /// wins and the rest fail with [`StoreError::VersionConflict`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`],
    /// [`StoreError::VersionConflict`], [`StoreError::TurnRegression`], or
    /// [`StoreError::VersionOverflow`].
    pub fn apply_change(
        &self,
        entity: &EntityId,
        expected: Version,
        diff: &FieldDiff,
        event_id: EventId,
        turn: u64,
    ) -> Result<Version, StoreError> {
        let slot = self.slot(entity)?;
        let mut record = lock(&slot)?;
        let version = record.apply(Some(expected), diff, event_id, turn, self.checkpoint_interval)?;
        tracing::debug!(entity_id = %entity, version = %version, event_id = %event_id, "Applied change");
        Ok(version)
    }

    /// Lock every entity in `ids` (sorted, deduplicated) and run `f` with
    /// exclusive access to them.
    ///
    /// Other entities stay fully available while `f` runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`] (converted into `E`) if any id
    /// is not registered, or whatever `f` fails with.
    pub fn with_locked<R, E, F>(&self, ids: &[EntityId], f: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut LockedEntities<'_>) -> Result<R, E>,
    {
        let mut sorted: Vec<&EntityId> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let slots: Vec<(EntityId, Slot)> = sorted
            .into_iter()
            .map(|id| self.slot(id).map(|slot| (id.clone(), slot)))
            .collect::<Result<_, StoreError>>()?;

        let mut guards = Vec::with_capacity(slots.len());
        for (id, slot) in &slots {
            guards.push((id.clone(), lock(slot)?));
        }

        let mut locked = LockedEntities {
            guards,
            checkpoint_interval: self.checkpoint_interval,
        };
        f(&mut locked)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current state of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn get_current(&self, entity: &EntityId) -> Result<Arc<EntityState>, StoreError> {
        self.read(entity, EntityRecord::head)
    }

    /// Current version of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn current_version(&self, entity: &EntityId) -> Result<Version, StoreError> {
        self.read(entity, EntityRecord::version)
    }

    /// Version, state, and stale marker read under one lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn snapshot(&self, entity: &EntityId) -> Result<EntitySnapshot, StoreError> {
        self.read(entity, |record| EntitySnapshot {
            version: record.version(),
            state: record.head(),
            stale: record.stale().cloned(),
            last_turn: record.last_turn(),
            last_event: record.last_event(),
        })
    }

    /// State of `entity` at `version`.
    ///
    /// The current version is a direct lookup; older versions replay at most
    /// one checkpoint interval of diffs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`] or
    /// [`StoreError::VersionOutOfRange`].
    pub fn get_at_version(
        &self,
        entity: &EntityId,
        version: Version,
    ) -> Result<EntityState, StoreError> {
        self.reconstruct(entity, AsOf::Version(version))
            .map(|r| r.state)
    }

    /// Reconstruct `entity` at a version or turn.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`],
    /// [`StoreError::VersionOutOfRange`], or [`StoreError::BeforeCreation`].
    pub fn reconstruct(&self, entity: &EntityId, target: AsOf) -> Result<Reconstruction, StoreError> {
        let slot = self.slot(entity)?;
        let record = lock(&slot)?;
        reconstruct::reconstruct(&record, target)
    }

    /// Ordered state-change history of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn history(&self, entity: &EntityId) -> Result<Vec<StateChange>, StoreError> {
        self.read(entity, |record| record.changes().to_vec())
    }

    /// Whether replaying the full history from version 1 reproduces the
    /// current state and versions are contiguous.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn verify_replay(&self, entity: &EntityId) -> Result<bool, StoreError> {
        self.read(entity, |record| {
            let Some(initial) = record.initial() else {
                return false;
            };
            let contiguous = record.changes().iter().enumerate().all(|(idx, change)| {
                let from = u64::try_from(idx).ok().and_then(|i| i.checked_add(1));
                Some(change.from_version.get()) == from
                    && change.from_version.next() == Some(change.to_version)
            });
            contiguous && replay(initial, record.changes()) == *record.head()
        })
    }

    // =========================================================================
    // Staleness
    // =========================================================================

    /// Mark `entity` stale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn mark_stale(&self, entity: &EntityId, marker: StaleMarker) -> Result<(), StoreError> {
        let slot = self.slot(entity)?;
        lock(&slot)?.mark_stale(marker);
        Ok(())
    }

    /// The stale marker of `entity`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn stale_marker(&self, entity: &EntityId) -> Result<Option<StaleMarker>, StoreError> {
        self.read(entity, |record| record.stale().cloned())
    }

    /// Clear and return the stale marker of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn clear_stale(&self, entity: &EntityId) -> Result<Option<StaleMarker>, StoreError> {
        let slot = self.slot(entity)?;
        let marker = lock(&slot)?.clear_stale();
        Ok(marker)
    }

    /// Every stale entity with its marker, sorted by id.
    pub fn stale_entities(&self) -> BTreeMap<EntityId, StaleMarker> {
        self.entity_ids()
            .into_iter()
            .filter_map(|id| {
                let marker = self.stale_marker(&id).ok().flatten()?;
                Some((id, marker))
            })
            .collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn slot(&self, entity: &EntityId) -> Result<Slot, StoreError> {
        let entities = self
            .entities
            .read()
            .map_err(|_poisoned| StoreError::LockPoisoned)?;
        entities
            .get(entity)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntity {
                entity_id: entity.clone(),
            })
    }

    fn read<T>(&self, entity: &EntityId, f: impl FnOnce(&EntityRecord) -> T) -> Result<T, StoreError> {
        let slot = self.slot(entity)?;
        let record = lock(&slot)?;
        Ok(f(&record))
    }
}

fn lock(slot: &Slot) -> Result<MutexGuard<'_, EntityRecord>, StoreError> {
    slot.lock().map_err(|_poisoned| StoreError::LockPoisoned)
}

// ---------------------------------------------------------------------------
// Multi-entity access
// ---------------------------------------------------------------------------

/// Exclusive access to a set of entities for the duration of a
/// [`EntityStore::with_locked`] call.
#[derive(Debug)]
pub struct LockedEntities<'a> {
    guards: Vec<(EntityId, MutexGuard<'a, EntityRecord>)>,
    checkpoint_interval: u64,
}

impl LockedEntities<'_> {
    /// The locked ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.guards.iter().map(|(id, _)| id)
    }

    /// Current version of a locked entity.
    pub fn version(&self, entity: &EntityId) -> Option<Version> {
        self.record(entity).map(EntityRecord::version)
    }

    /// Check that `entity` is at `expected` and has room for one more
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`] if the entity is not locked,
    /// [`StoreError::VersionConflict`], or [`StoreError::VersionOverflow`].
    pub fn check(&self, entity: &EntityId, expected: Option<Version>) -> Result<(), StoreError> {
        let record = self.record(entity).ok_or_else(|| StoreError::UnknownEntity {
            entity_id: entity.clone(),
        })?;
        record.check_expected(expected)?;
        record.next_version().map(|_| ())
    }

    /// Check that a change at `turn` would not precede `entity`'s last
    /// change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`] if the entity is not locked,
    /// or [`StoreError::TurnRegression`].
    pub fn check_turn(&self, entity: &EntityId, turn: u64) -> Result<(), StoreError> {
        self.record(entity)
            .ok_or_else(|| StoreError::UnknownEntity {
                entity_id: entity.clone(),
            })?
            .check_turn(turn)
    }

    /// Apply `diff` to a locked entity as exactly one new version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`] if the entity is not locked,
    /// or the errors of [`EntityRecord::apply`].
    pub fn apply(
        &mut self,
        entity: &EntityId,
        expected: Option<Version>,
        diff: &FieldDiff,
        event_id: EventId,
        turn: u64,
    ) -> Result<Version, StoreError> {
        let interval = self.checkpoint_interval;
        let record = self
            .guards
            .iter_mut()
            .find(|(id, _)| id == entity)
            .map(|(_, guard)| &mut **guard)
            .ok_or_else(|| StoreError::UnknownEntity {
                entity_id: entity.clone(),
            })?;
        record.apply(expected, diff, event_id, turn, interval)
    }

    fn record(&self, entity: &EntityId) -> Option<&EntityRecord> {
        self.guards
            .iter()
            .find(|(id, _)| id == entity)
            .map(|(_, guard)| &**guard)
    }
}

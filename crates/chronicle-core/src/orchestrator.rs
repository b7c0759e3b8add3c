//! The orchestrator façade.
//!
//! Each `submit_occurrence` is one unit: validate, lock the affected
//! entities, append the event, apply its diffs, release, then run
//! invalidation. Validation and version checks happen under the entity
//! locks before anything is appended, so a failed submit leaves nothing
//! behind in the log or the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chronicle_events::{EventDraft, EventError, EventLog, KindRegistry, WriteBehindHandle};
use chronicle_invalidation::{
    InvalidationEngine, InvalidationHost, InvalidationOutcome, InvalidationReport,
    InvalidationWarning,
};
use chronicle_store::{EntityStore, Reconstruction, StoreError};
use chronicle_types::{
    AsOf, ChangeSummary, EntityId, EntityState, EntityView, Event, EventId, Occurrence,
    StaleMarker, Version,
};
use serde::Serialize;

use crate::config::ChronicleConfig;
use crate::ChronicleError;

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// What a submit produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    /// The event recorded for the occurrence (the original one for a
    /// deduplicated resubmission).
    pub event_id: EventId,
    /// Whether the occurrence was recognised as already recorded.
    pub duplicate: bool,
    /// New version of every entity the event mutated.
    pub versions: BTreeMap<EntityId, Version>,
    /// Invalidation outcomes, in the order they were applied.
    pub outcomes: Vec<InvalidationOutcome>,
    /// Non-fatal warnings raised while invalidating.
    pub warnings: Vec<InvalidationWarning>,
    /// Events synthesised by cascades.
    pub derived_events: Vec<EventId>,
}

/// What an elapsed-time evaluation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ElapsedReceipt {
    /// Invalidation outcomes, in the order they were applied.
    pub outcomes: Vec<InvalidationOutcome>,
    /// Non-fatal warnings.
    pub warnings: Vec<InvalidationWarning>,
    /// Events synthesised by cascades.
    pub derived_events: Vec<EventId>,
}

impl From<InvalidationReport> for ElapsedReceipt {
    fn from(report: InvalidationReport) -> Self {
        Self {
            outcomes: report.outcomes,
            warnings: report.warnings,
            derived_events: report.derived.iter().map(|e| e.id).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The single entry point for recording and querying entity state.
#[derive(Debug)]
pub struct Orchestrator {
    registry: KindRegistry,
    log: EventLog,
    store: EntityStore,
    engine: InvalidationEngine,
    dedupe_source_refs: bool,
    /// First event recorded for each source reference; `None` while the
    /// first submit is still in flight.
    seen_sources: Mutex<HashMap<String, Option<EventId>>>,
    write_behind: Option<WriteBehindHandle>,
    configuration_warnings: Vec<InvalidationWarning>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::from_config(&ChronicleConfig::default())
    }
}

impl Orchestrator {
    /// Build an empty orchestrator from configuration.
    ///
    /// Malformed rules are skipped; see
    /// [`Orchestrator::configuration_warnings`].
    pub fn from_config(config: &ChronicleConfig) -> Self {
        let registry = config.kind_registry();
        let (engine, configuration_warnings) = InvalidationEngine::new(
            config.rules.clone(),
            registry.clone(),
            config.invalidation.max_cascade_depth,
        );
        Self {
            registry,
            log: EventLog::new(),
            store: EntityStore::new(config.store.checkpoint_interval),
            engine,
            dedupe_source_refs: config.events.dedupe_source_refs,
            seen_sources: Mutex::new(HashMap::new()),
            write_behind: None,
            configuration_warnings,
        }
    }

    /// Forward every event appended from now on to a write-behind task.
    pub fn attach_write_behind(&mut self, handle: WriteBehindHandle) {
        self.write_behind = Some(handle);
    }

    /// Warnings about rules skipped at construction.
    pub fn configuration_warnings(&self) -> &[InvalidationWarning] {
        &self.configuration_warnings
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Register an entity at version 1 with `initial` state.
    ///
    /// Registration is recorded as an `EntityCreated` event carrying the
    /// initial state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken, or
    /// [`EventError::InvalidEvent`] for a blank id.
    pub fn register_entity(
        &self,
        entity: impl Into<EntityId>,
        initial: EntityState,
        turn: u64,
    ) -> Result<Version, ChronicleError> {
        let entity = entity.into();
        let draft = EventDraft::creation(entity.clone(), initial.clone(), turn)?;
        self.store.register_with(&entity, initial, turn, || {
            self.append(draft).map(|event| event.id).map_err(ChronicleError::from)
        })
    }

    /// Record an occurrence, apply it, and run invalidation.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] for invalid input,
    /// [`StoreError::VersionConflict`] when an expected version does not
    /// match (retry after re-reading), [`StoreError::TurnRegression`] when
    /// the occurrence is dated before a mutated entity's last change,
    /// [`StoreError::UnknownEntity`] when an expected version names an
    /// unregistered entity, or [`ChronicleError::SourceInFlight`] while
    /// another submit with the same source reference is running.
    ///
    /// Source references are reserved only for the duration of the lookup;
    /// the commit itself runs without any global lock.
    pub fn submit_occurrence(&self, occurrence: Occurrence) -> Result<SubmitReceipt, ChronicleError> {
        if occurrence.kind.is_creation() {
            return Err(EventError::invalid("entities are created with register_entity").into());
        }

        let source_ref = occurrence.source_ref.clone().filter(|_| self.dedupe_source_refs);
        if let Some(key) = &source_ref
            && let Some(original) = self.reserve_source(key)?
        {
            tracing::debug!(source_ref = %key, event_id = %original, "Duplicate occurrence ignored");
            return Ok(SubmitReceipt {
                event_id: original,
                duplicate: true,
                versions: BTreeMap::new(),
                outcomes: Vec::new(),
                warnings: Vec::new(),
                derived_events: Vec::new(),
            });
        }

        let committed = self.record(occurrence);
        if let Some(key) = source_ref {
            self.settle_source(key, committed.as_ref().ok().map(|(event, _)| event.id));
        }
        let (event, versions) = committed?;

        let report = self.engine.process(&event, &Host(self));
        for warning in &report.warnings {
            tracing::warn!(event_id = %event.id, ?warning, "Invalidation warning");
        }

        Ok(SubmitReceipt {
            event_id: event.id,
            duplicate: false,
            versions,
            derived_events: report.derived.iter().map(|e| e.id).collect(),
            outcomes: report.outcomes,
            warnings: report.warnings,
        })
    }

    /// Run the time-based rules at turn `now`.
    pub fn evaluate_elapsed(&self, now: u64) -> ElapsedReceipt {
        let report = self.engine.evaluate_elapsed(now, &Host(self));
        tracing::debug!(now, outcomes = report.outcomes.len(), "Evaluated elapsed rules");
        ElapsedReceipt::from(report)
    }

    /// Clear the stale marker of `entity`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn acknowledge_stale(&self, entity: &EntityId) -> Result<Option<StaleMarker>, ChronicleError> {
        Ok(self.store.clear_stale(entity)?)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// State of `entity`, currently or as of a version or turn.
    ///
    /// Current reads are a direct lookup; historical reads reconstruct from
    /// the nearest checkpoint. Only current views carry a stale marker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`],
    /// [`StoreError::VersionOutOfRange`], or [`StoreError::BeforeCreation`].
    pub fn query_state(&self, entity: &EntityId, as_of: Option<AsOf>) -> Result<EntityView, ChronicleError> {
        let view = match as_of {
            None => {
                let snapshot = self.store.snapshot(entity)?;
                EntityView {
                    entity_id: entity.clone(),
                    version: snapshot.version,
                    state: Arc::unwrap_or_clone(snapshot.state),
                    stale: snapshot.stale,
                }
            }
            Some(target) => {
                let reconstruction = self.reconstruct(entity, target)?;
                EntityView {
                    entity_id: reconstruction.entity_id,
                    version: reconstruction.version,
                    state: reconstruction.state,
                    stale: None,
                }
            }
        };
        Ok(view)
    }

    /// Reconstruct `entity` at a version or turn, reporting the checkpoint
    /// replay started from and how many diffs were applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`],
    /// [`StoreError::VersionOutOfRange`], or [`StoreError::BeforeCreation`].
    pub fn reconstruct(&self, entity: &EntityId, target: AsOf) -> Result<Reconstruction, ChronicleError> {
        Ok(self.store.reconstruct(entity, target)?)
    }

    /// Ordered summaries of every change applied to `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn get_history(&self, entity: &EntityId) -> Result<Vec<ChangeSummary>, ChronicleError> {
        let history = self.store.history(entity)?;
        Ok(history
            .into_iter()
            .map(|change| ChangeSummary {
                from_version: change.from_version,
                to_version: change.to_version,
                event_id: change.event_id,
                kind: self.log.get(change.event_id).map(|event| event.kind.clone()),
                turn: change.turn,
                fields: change.diff.keys().cloned().collect(),
            })
            .collect())
    }

    /// Every stale entity with its marker.
    pub fn stale_entities(&self) -> BTreeMap<EntityId, StaleMarker> {
        self.store.stale_entities()
    }

    /// Events with ids greater than `after` (all for `None`).
    pub fn events_since(&self, after: Option<EventId>) -> Vec<Arc<Event>> {
        self.log.events_since(after)
    }

    /// Every registered entity id, sorted.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.store.entity_ids()
    }

    /// Number of events in the log.
    pub fn event_count(&self) -> usize {
        self.log.len()
    }

    /// Whether replaying `entity`'s history reproduces its current state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownEntity`].
    pub fn verify_replay(&self, entity: &EntityId) -> Result<bool, ChronicleError> {
        Ok(self.store.verify_replay(entity)?)
    }

    // =========================================================================
    // Rehydration
    // =========================================================================

    /// Rebuild state from persisted events, in sequence order.
    ///
    /// Creation events register, other events apply their diffs. Rules are
    /// not re-run: derived events are already in the list. The events are
    /// restored into a fresh log and store that replace the current ones
    /// only once every event has been restored, so a bad stream leaves the
    /// orchestrator empty. Returns the number of events loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ChronicleError::AlreadyPopulated`] unless the orchestrator
    /// is empty, or the first append or apply error.
    pub fn rehydrate(&mut self, events: Vec<Event>) -> Result<usize, ChronicleError> {
        if !self.log.is_empty() {
            return Err(ChronicleError::AlreadyPopulated {
                events: self.log.len(),
            });
        }

        let log = EventLog::new();
        let store = EntityStore::new(self.store.checkpoint_interval());
        let mut seen = HashMap::new();
        let count = events.len();
        for event in events {
            let event = log.append_existing(event)?;
            restore(&store, &event)?;
            if self.dedupe_source_refs
                && !event.is_derived()
                && let Some(key) = &event.source_ref
            {
                seen.entry(key.clone()).or_insert(Some(event.id));
            }
        }

        self.log = log;
        self.store = store;
        self.seen_sources = Mutex::new(seen);
        tracing::info!(
            events = count,
            entities = self.store.len(),
            last_id = ?self.log.last_id(),
            "Rehydrated from persisted events"
        );
        Ok(count)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn append(&self, draft: EventDraft) -> Result<Arc<Event>, EventError> {
        let event = self.log.append(draft)?;
        if let Some(handle) = &self.write_behind {
            handle.forward(Arc::clone(&event));
        }
        Ok(event)
    }

    /// Validate, check and commit an occurrence.
    fn record(&self, mut occurrence: Occurrence) -> Result<(Arc<Event>, BTreeMap<EntityId, Version>), ChronicleError> {
        let expected = std::mem::take(&mut occurrence.expected_versions);
        let draft = EventDraft::from_occurrence(occurrence, &self.registry)?;
        self.precheck(&draft, &expected)?;
        self.commit(draft, &expected)
    }

    /// Look up `key`, reserving it if unseen. Returns the original event
    /// for a key already recorded.
    fn reserve_source(&self, key: &str) -> Result<Option<EventId>, ChronicleError> {
        let mut seen = self.seen_sources.lock().map_err(|_poisoned| EventError::LockPoisoned)?;
        match seen.get(key) {
            Some(Some(original)) => Ok(Some(*original)),
            Some(None) => Err(ChronicleError::SourceInFlight {
                source_ref: key.to_owned(),
            }),
            None => {
                seen.insert(key.to_owned(), None);
                Ok(None)
            }
        }
    }

    /// Record the event for a reserved key, or release it if the submit
    /// failed.
    fn settle_source(&self, key: String, event: Option<EventId>) {
        let Ok(mut seen) = self.seen_sources.lock() else {
            return; // poisoned mutex -- later submits fail on reserve anyway
        };
        match event {
            Some(id) => {
                seen.insert(key, Some(id));
            }
            None => {
                seen.remove(&key);
            }
        }
    }

    /// Fail fast on expected versions and out-of-order turns before any
    /// entity is auto-created.
    fn precheck(&self, draft: &EventDraft, expected: &BTreeMap<EntityId, Version>) -> Result<(), ChronicleError> {
        for entity in draft.affected() {
            if draft.diff_for(entity).is_none() || !self.store.contains(entity) {
                continue;
            }
            let last_turn = self.store.snapshot(entity)?.last_turn;
            if draft.turn() < last_turn {
                return Err(StoreError::TurnRegression {
                    entity_id: entity.clone(),
                    turn: draft.turn(),
                    last_turn,
                }
                .into());
            }
        }
        for (entity, &version) in expected {
            if !draft.affected().contains(entity) {
                return Err(EventError::invalid_entity(entity, "has an expected version but is not affected").into());
            }
            let actual = self.store.current_version(entity)?;
            if actual != version {
                return Err(StoreError::VersionConflict {
                    entity_id: entity.clone(),
                    expected: version,
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Register any affected entity seen for the first time.
    fn ensure_registered(&self, draft: &EventDraft) -> Result<(), ChronicleError> {
        for entity in draft.affected() {
            if self.store.contains(entity) {
                continue;
            }
            match self.register_entity(entity.clone(), EntityState::new(), draft.turn()) {
                Ok(_) => tracing::debug!(entity_id = %entity, "Created entity on first reference"),
                Err(ChronicleError::Store(StoreError::AlreadyExists { .. })) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Append `draft` and apply its diffs with every affected entity
    /// locked. Checks run before the append, so failure leaves no trace.
    fn commit(
        &self,
        draft: EventDraft,
        expected: &BTreeMap<EntityId, Version>,
    ) -> Result<(Arc<Event>, BTreeMap<EntityId, Version>), ChronicleError> {
        self.ensure_registered(&draft)?;
        let affected = draft.affected().to_vec();

        self.store.with_locked(&affected, |locked| {
            for entity in &affected {
                let expected_version = expected.get(entity).copied();
                if expected_version.is_some() || draft.diff_for(entity).is_some() {
                    locked.check(entity, expected_version)?;
                }
                if draft.diff_for(entity).is_some() {
                    locked.check_turn(entity, draft.turn())?;
                }
            }

            let event = self.append(draft)?;
            let mut versions = BTreeMap::new();
            for (entity, diff) in event.mutations() {
                let version = locked.apply(entity, None, diff, event.id, event.turn)?;
                versions.insert(entity.clone(), version);
            }
            Ok((event, versions))
        })
    }
}

/// Replay one persisted event into `store`.
fn restore(store: &EntityStore, event: &Event) -> Result<(), ChronicleError> {
    if event.kind.is_creation() {
        for entity in &event.affected {
            let initial = event.changes.get(entity).cloned().unwrap_or_default();
            store.register(entity, initial, event.id, event.turn)?;
        }
        return Ok(());
    }

    for entity in &event.affected {
        if !store.contains(entity) {
            store.register(entity, EntityState::new(), event.id, event.turn)?;
        }
    }
    store.with_locked(&event.affected, |locked| {
        for (entity, diff) in event.mutations() {
            locked.apply(entity, None, diff, event.id, event.turn)?;
        }
        Ok::<_, ChronicleError>(())
    })
}

// ---------------------------------------------------------------------------
// Invalidation host
// ---------------------------------------------------------------------------

/// The orchestrator as seen by the invalidation engine.
struct Host<'a>(&'a Orchestrator);

impl InvalidationHost for Host<'_> {
    type Error = ChronicleError;

    fn entity_ids(&self) -> Vec<EntityId> {
        self.0.store.entity_ids()
    }

    fn state_of(&self, entity: &EntityId) -> Option<Arc<EntityState>> {
        self.0.store.get_current(entity).ok()
    }

    fn last_activity(&self, entity: &EntityId) -> Option<(u64, EventId)> {
        self.0
            .store
            .snapshot(entity)
            .ok()
            .map(|snapshot| (snapshot.last_turn, snapshot.last_event))
    }

    fn mark_stale(&self, entity: &EntityId, marker: StaleMarker) {
        if let Err(error) = self.0.store.mark_stale(entity, marker) {
            tracing::warn!(entity_id = %entity, error = %error, "Could not mark entity stale");
        }
    }

    fn record_derived(&self, draft: EventDraft) -> Result<Arc<Event>, ChronicleError> {
        self.0
            .commit(draft, &BTreeMap::new())
            .map(|(event, _)| event)
    }
}

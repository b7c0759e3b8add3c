//! Validation of occurrences into event drafts.
//!
//! An [`EventDraft`] is an event that has passed validation but has not yet
//! been assigned a sequence number. Only the [`EventLog`](crate::EventLog)
//! turns drafts into [`Event`]s, which keeps sequence assignment in one
//! place.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use chronicle_types::kinds::ENTITY_CREATED;
use chronicle_types::{
    EntityId, EntityState, Event, EventId, EventKind, FieldDiff, Occurrence, RuleId,
};

use crate::registry::KindRegistry;
use crate::EventError;

/// A validated, unsequenced event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    kind: EventKind,
    affected: Vec<EntityId>,
    changes: BTreeMap<EntityId, FieldDiff>,
    source_ref: Option<String>,
    cascade_hints: Vec<EventKind>,
    turn: u64,
    caused_by: Option<EventId>,
    rule: Option<RuleId>,
    cascade_depth: u32,
}

impl EventDraft {
    /// Validate an externally reported occurrence.
    ///
    /// Empty diffs are dropped: an affected entity without a diff is
    /// referenced, not mutated.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventKind`] if the kind or a cascade hint
    /// is not registered, and [`EventError::InvalidEvent`] if `affected` is
    /// empty, contains blank or duplicate ids, or `changes` names an entity
    /// that is not affected.
    pub fn from_occurrence(
        occurrence: Occurrence,
        registry: &KindRegistry,
    ) -> Result<Self, EventError> {
        let draft = Self {
            kind: occurrence.kind,
            affected: occurrence.affected,
            changes: occurrence
                .changes
                .into_iter()
                .filter(|(_, diff)| !diff.is_empty())
                .collect(),
            source_ref: occurrence.source_ref,
            cascade_hints: occurrence.cascade_hints,
            turn: occurrence.turn,
            caused_by: None,
            rule: None,
            cascade_depth: 0,
        };
        draft.validate(registry)?;
        Ok(draft)
    }

    /// Draft the registration of `entity` with its version-1 state.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidEvent`] if the id is blank.
    pub fn creation(
        entity: EntityId,
        initial_state: EntityState,
        turn: u64,
    ) -> Result<Self, EventError> {
        if entity.as_str().trim().is_empty() {
            return Err(EventError::invalid("entity id must not be blank"));
        }
        let mut changes = BTreeMap::new();
        changes.insert(entity.clone(), initial_state);
        Ok(Self {
            kind: EventKind::from(ENTITY_CREATED),
            affected: vec![entity],
            changes,
            source_ref: None,
            cascade_hints: Vec::new(),
            turn,
            caused_by: None,
            rule: None,
            cascade_depth: 0,
        })
    }

    /// Draft an event synthesised by an invalidation rule.
    ///
    /// Every target receives the same `set` diff (possibly empty). The
    /// derived event inherits the parent's turn and sits one cascade hop
    /// deeper.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventKind`] if `kind` or a hint is not
    /// registered, and [`EventError::InvalidEvent`] if `targets` is empty.
    pub fn derived(
        kind: EventKind,
        targets: Vec<EntityId>,
        set: &FieldDiff,
        parent: &Event,
        rule: RuleId,
        hints: Vec<EventKind>,
        registry: &KindRegistry,
    ) -> Result<Self, EventError> {
        let mut draft = Self::synthesised(kind, targets, set, parent.turn, rule, hints);
        draft.source_ref.clone_from(&parent.source_ref);
        draft.caused_by = Some(parent.id);
        draft.cascade_depth = parent.cascade_depth.saturating_add(1);
        draft.validate(registry)?;
        Ok(draft)
    }

    /// Draft an event synthesised by a time-based rule at `turn`.
    ///
    /// There is no parent event; the draft is one cascade hop from the
    /// caller's elapsed-time evaluation.
    ///
    /// # Errors
    ///
    /// Same as [`EventDraft::derived`].
    pub fn scheduled(
        kind: EventKind,
        targets: Vec<EntityId>,
        set: &FieldDiff,
        turn: u64,
        rule: RuleId,
        hints: Vec<EventKind>,
        registry: &KindRegistry,
    ) -> Result<Self, EventError> {
        let draft = Self::synthesised(kind, targets, set, turn, rule, hints);
        draft.validate(registry)?;
        Ok(draft)
    }

    fn synthesised(
        kind: EventKind,
        targets: Vec<EntityId>,
        set: &FieldDiff,
        turn: u64,
        rule: RuleId,
        hints: Vec<EventKind>,
    ) -> Self {
        let changes = if set.is_empty() {
            BTreeMap::new()
        } else {
            targets.iter().map(|id| (id.clone(), set.clone())).collect()
        };
        Self {
            kind,
            affected: targets,
            changes,
            source_ref: None,
            cascade_hints: hints,
            turn,
            caused_by: None,
            rule: Some(rule),
            cascade_depth: 1,
        }
    }

    fn validate(&self, registry: &KindRegistry) -> Result<(), EventError> {
        registry.require(&self.kind)?;
        for hint in &self.cascade_hints {
            registry.require(hint)?;
        }

        if self.affected.is_empty() {
            return Err(EventError::invalid("affected entities must not be empty"));
        }
        if self.kind.is_creation() && self.affected.len() != 1 {
            return Err(EventError::invalid(
                "a creation event registers exactly one entity",
            ));
        }

        let mut seen = BTreeSet::new();
        for id in &self.affected {
            if id.as_str().trim().is_empty() {
                return Err(EventError::invalid("entity id must not be blank"));
            }
            if !seen.insert(id) {
                return Err(EventError::invalid_entity(id, "listed more than once"));
            }
        }
        if let Some(stray) = self.changes.keys().find(|id| !seen.contains(id)) {
            return Err(EventError::invalid_entity(
                stray,
                "has changes but is not an affected entity",
            ));
        }
        Ok(())
    }

    /// The draft's kind.
    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Entities the draft touches.
    pub fn affected(&self) -> &[EntityId] {
        &self.affected
    }

    /// The draft's source reference.
    pub fn source_ref(&self) -> Option<&str> {
        self.source_ref.as_deref()
    }

    /// The non-empty diff for `entity`, if any.
    pub fn diff_for(&self, entity: &EntityId) -> Option<&FieldDiff> {
        self.changes.get(entity)
    }

    /// Narrative time of the draft.
    pub const fn turn(&self) -> u64 {
        self.turn
    }

    /// Turn the draft into an event. Only the log calls this.
    pub(crate) fn seal(self, id: EventId, recorded_at: DateTime<Utc>) -> Event {
        Event {
            id,
            kind: self.kind,
            affected: self.affected,
            changes: self.changes,
            source_ref: self.source_ref,
            cascade_hints: self.cascade_hints,
            turn: self.turn,
            caused_by: self.caused_by,
            rule: self.rule,
            cascade_depth: self.cascade_depth,
            recorded_at,
        }
    }
}

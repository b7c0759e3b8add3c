//! Core data structures: events, occurrences, state-change records, views.
//!
//! Entity state is an open field-name-to-value mapping because entity
//! schemas (character, location, faction) vary. Field diffs replace whole
//! values; a JSON `null` is a value like any other, not a deletion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::{EntityId, EventId, RuleId, Version};
use crate::kinds::EventKind;

/// Full state of an entity at one version.
pub type EntityState = BTreeMap<String, serde_json::Value>;

/// Field-name to new-value replacements applied to one entity.
pub type FieldDiff = BTreeMap<String, serde_json::Value>;

/// Name of the state field holding an entity's tags (an array of strings).
pub const TAGS_FIELD: &str = "tags";

/// Apply a diff to a state in place, replacing each named field.
///
/// This is the only state transition function. Replay calls nothing else,
/// so replay is a pure function of the starting state and the diffs.
pub fn apply_diff(state: &mut EntityState, diff: &FieldDiff) {
    for (field, value) in diff {
        state.insert(field.clone(), value.clone());
    }
}

/// Whether the state's `tags` array contains `tag`.
pub fn has_tag(state: &EntityState, tag: &str) -> bool {
    state
        .get(TAGS_FIELD)
        .and_then(serde_json::Value::as_array)
        .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag)))
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable record of one state-affecting occurrence.
///
/// Events are never edited; a correction is a new event. The `id` is the
/// logical sequence number assigned by the log, and `recorded_at` is audit
/// metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Event {
    /// Logical sequence number.
    pub id: EventId,
    /// The kind of occurrence.
    pub kind: EventKind,
    /// Every entity the event touches, in caller order, without duplicates.
    pub affected: Vec<EntityId>,
    /// Field diffs for the entities the event mutates. Affected entities
    /// without an entry are referenced but not mutated.
    #[serde(default)]
    pub changes: BTreeMap<EntityId, FieldDiff>,
    /// Reference back to the narrative context that caused the event.
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Other kinds this event may trigger.
    #[serde(default)]
    pub cascade_hints: Vec<EventKind>,
    /// Caller-supplied narrative time (days or turns).
    #[serde(default)]
    pub turn: u64,
    /// For derived events, the event whose invalidation synthesised this one.
    #[serde(default)]
    pub caused_by: Option<EventId>,
    /// For derived events, the rule that synthesised this one.
    #[serde(default)]
    pub rule: Option<RuleId>,
    /// Number of cascade hops from an external occurrence (0 for external).
    #[serde(default)]
    pub cascade_depth: u32,
    /// Wall-clock time the event was appended.
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// The non-empty diff for `entity`, if the event mutates it.
    pub fn diff_for(&self, entity: &EntityId) -> Option<&FieldDiff> {
        self.changes.get(entity).filter(|diff| !diff.is_empty())
    }

    /// Mutated entities and their diffs, in affected order.
    pub fn mutations(&self) -> impl Iterator<Item = (&EntityId, &FieldDiff)> {
        self.affected
            .iter()
            .filter_map(|id| self.diff_for(id).map(|diff| (id, diff)))
    }

    /// Whether the event was synthesised by the invalidation engine.
    pub const fn is_derived(&self) -> bool {
        self.rule.is_some()
    }

    /// Whether the event touches `entity` at all.
    pub fn affects(&self, entity: &EntityId) -> bool {
        self.affected.contains(entity)
    }
}

// ---------------------------------------------------------------------------
// Occurrence (caller input)
// ---------------------------------------------------------------------------

/// A pre-decided occurrence reported by the narrative layer.
///
/// The orchestrator turns this into an [`Event`] after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Occurrence {
    /// The kind of occurrence; must be registered.
    pub kind: EventKind,
    /// Entities the occurrence touches; must be non-empty.
    pub affected: Vec<EntityId>,
    /// Field diffs per mutated entity.
    #[serde(default)]
    pub changes: BTreeMap<EntityId, FieldDiff>,
    /// Narrative context reference, also the idempotency key when
    /// deduplication is enabled.
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Kinds this occurrence is known to potentially trigger.
    #[serde(default)]
    pub cascade_hints: Vec<EventKind>,
    /// Narrative time of the occurrence.
    #[serde(default)]
    pub turn: u64,
    /// Versions the caller last observed. A mismatch fails the submit with
    /// a version conflict.
    #[serde(default)]
    pub expected_versions: BTreeMap<EntityId, Version>,
}

impl Occurrence {
    /// Start an occurrence of `kind` touching `affected`.
    pub fn new(kind: impl Into<EventKind>, affected: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            kind: kind.into(),
            affected: affected.into_iter().collect(),
            changes: BTreeMap::new(),
            source_ref: None,
            cascade_hints: Vec::new(),
            turn: 0,
            expected_versions: BTreeMap::new(),
        }
    }

    /// Set one field of one entity's diff.
    #[must_use]
    pub fn set(
        mut self,
        entity: impl Into<EntityId>,
        field: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.changes
            .entry(entity.into())
            .or_default()
            .insert(field.into(), value);
        self
    }

    /// Set the narrative time.
    #[must_use]
    pub const fn at_turn(mut self, turn: u64) -> Self {
        self.turn = turn;
        self
    }

    /// Set the narrative source reference.
    #[must_use]
    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Add a cascade hint.
    #[must_use]
    pub fn hint(mut self, kind: impl Into<EventKind>) -> Self {
        self.cascade_hints.push(kind.into());
        self
    }

    /// Require `entity` to be at `version` when the occurrence is applied.
    #[must_use]
    pub fn expect_version(mut self, entity: impl Into<EntityId>, version: Version) -> Self {
        self.expected_versions.insert(entity.into(), version);
        self
    }
}

// ---------------------------------------------------------------------------
// State-change records and views
// ---------------------------------------------------------------------------

/// The append-only unit of entity history.
///
/// Links a `(from_version, to_version)` transition to the event that caused
/// it and the exact diff applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StateChange {
    /// The entity that changed.
    pub entity_id: EntityId,
    /// Version before the change.
    pub from_version: Version,
    /// Version after the change (always `from_version + 1`).
    pub to_version: Version,
    /// The event that caused the change.
    pub event_id: EventId,
    /// Narrative time of the causing event.
    pub turn: u64,
    /// The fields replaced.
    pub diff: FieldDiff,
}

/// A history line as returned to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ChangeSummary {
    /// Version before the change.
    pub from_version: Version,
    /// Version after the change.
    pub to_version: Version,
    /// The causing event.
    pub event_id: EventId,
    /// Kind of the causing event, when the event is still in the log.
    pub kind: Option<EventKind>,
    /// Narrative time of the change.
    pub turn: u64,
    /// Names of the fields replaced, in order.
    pub fields: Vec<String>,
}

/// Back-reference from an entity to the event that invalidated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StaleMarker {
    /// The invalidating event.
    pub event_id: EventId,
    /// The rule that fired.
    pub rule: RuleId,
    /// Priority of the rule, used to keep the strongest reason per event.
    pub priority: i32,
}

/// What a caller sees when asking for an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct EntityView {
    /// The entity.
    pub entity_id: EntityId,
    /// Version the state corresponds to.
    pub version: Version,
    /// The state at that version.
    pub state: EntityState,
    /// Present when the entity's derived state has been invalidated.
    pub stale: Option<StaleMarker>,
}

/// A point in an entity's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum AsOf {
    /// An exact version.
    Version(Version),
    /// The last version whose change happened at or before this turn.
    Turn(u64),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kinds::{ENTITY_DEATH, RELATIONSHIP_CHANGE};

    fn event(changes: BTreeMap<EntityId, FieldDiff>) -> Event {
        Event {
            id: EventId::FIRST,
            kind: EventKind::from(RELATIONSHIP_CHANGE),
            affected: vec![EntityId::from("a"), EntityId::from("b")],
            changes,
            source_ref: None,
            cascade_hints: Vec::new(),
            turn: 0,
            caused_by: None,
            rule: None,
            cascade_depth: 0,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn apply_diff_replaces_whole_values() {
        let mut state = EntityState::new();
        state.insert("inventory".to_owned(), json!(["sword"]));
        state.insert("hp".to_owned(), json!(10));
        let mut diff = FieldDiff::new();
        diff.insert("inventory".to_owned(), json!(["shield"]));
        apply_diff(&mut state, &diff);
        assert_eq!(state.get("inventory"), Some(&json!(["shield"])));
        assert_eq!(state.get("hp"), Some(&json!(10)));
    }

    #[test]
    fn null_is_stored_not_removed() {
        let mut state = EntityState::new();
        state.insert("ally".to_owned(), json!("b"));
        let mut diff = FieldDiff::new();
        diff.insert("ally".to_owned(), serde_json::Value::Null);
        apply_diff(&mut state, &diff);
        assert_eq!(state.get("ally"), Some(&serde_json::Value::Null));
    }

    #[test]
    fn referenced_entities_are_not_mutations() {
        let mut changes = BTreeMap::new();
        let mut diff = FieldDiff::new();
        diff.insert("trust".to_owned(), json!(-5));
        changes.insert(EntityId::from("a"), diff);
        changes.insert(EntityId::from("b"), FieldDiff::new());
        let e = event(changes);
        let mutated: Vec<_> = e.mutations().map(|(id, _)| id.as_str()).collect();
        assert_eq!(mutated, vec!["a"]);
        assert!(e.affects(&EntityId::from("b")));
        assert!(e.diff_for(&EntityId::from("b")).is_none());
    }

    #[test]
    fn tags_lookup() {
        let mut state = EntityState::new();
        state.insert(TAGS_FIELD.to_owned(), json!(["ruler", "human"]));
        assert!(has_tag(&state, "ruler"));
        assert!(!has_tag(&state, "dragon"));
        state.insert(TAGS_FIELD.to_owned(), json!("ruler"));
        assert!(!has_tag(&state, "ruler"));
    }

    #[test]
    fn occurrence_builder_collects_diffs() {
        let occ = Occurrence::new(ENTITY_DEATH, [EntityId::from("king_01")])
            .set("king_01", "status", json!("deceased"))
            .at_turn(12)
            .source_ref("chapter-3")
            .expect_version("king_01", Version::new(3));
        assert_eq!(occ.turn, 12);
        assert_eq!(
            occ.changes
                .get(&EntityId::from("king_01"))
                .and_then(|d| d.get("status")),
            Some(&json!("deceased"))
        );
        assert_eq!(
            occ.expected_versions.get(&EntityId::from("king_01")),
            Some(&Version::new(3))
        );
    }

    #[test]
    fn occurrence_deserializes_with_defaults() {
        let occ: Result<Occurrence, _> = serde_json::from_str(
            r#"{"kind":"EntityDeath","affected":["king_01"],"changes":{"king_01":{"status":"deceased"}}}"#,
        );
        assert!(occ.is_ok());
        let occ = occ.unwrap_or_else(|_| Occurrence::new("x", []));
        assert_eq!(occ.kind.as_str(), "EntityDeath");
        assert!(occ.expected_versions.is_empty());
        assert_eq!(occ.turn, 0);
    }

    #[test]
    fn as_of_serializes_snake_case() {
        let json = serde_json::to_string(&AsOf::Turn(7)).unwrap_or_default();
        assert_eq!(json, r#"{"turn":7}"#);
    }
}

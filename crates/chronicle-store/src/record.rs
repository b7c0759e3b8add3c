//! A single entity's versioned history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chronicle_types::{
    EntityId, EntityState, EventId, FieldDiff, StaleMarker, StateChange, Version, apply_diff,
};

use crate::StoreError;

/// The versioned record of one entity.
///
/// Invariants:
/// - `version == 1 + changes.len()`.
/// - `changes[i]` moves version `i + 1` to `i + 2`.
/// - Change turns never decrease and never precede `created_turn`.
/// - Replaying `changes` over `initial` yields `head`.
/// - `checkpoints` holds version 1 and every version divisible by the
///   store's checkpoint interval.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    id: EntityId,
    created_by: EventId,
    created_turn: u64,
    version: Version,
    head: Arc<EntityState>,
    changes: Vec<StateChange>,
    checkpoints: BTreeMap<Version, Arc<EntityState>>,
    stale: Option<StaleMarker>,
}

impl EntityRecord {
    /// A record at version 1 holding `initial`.
    pub fn new(id: EntityId, initial: EntityState, created_by: EventId, created_turn: u64) -> Self {
        let initial = Arc::new(initial);
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(Version::INITIAL, Arc::clone(&initial));
        Self {
            id,
            created_by,
            created_turn,
            version: Version::INITIAL,
            head: initial,
            changes: Vec::new(),
            checkpoints,
            stale: None,
        }
    }

    /// Apply `diff` as exactly one new version.
    ///
    /// With `expected` set, fails unless the record is at that version.
    /// Nothing is mutated until every check has passed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] on a stale expected version,
    /// [`StoreError::TurnRegression`] if `turn` precedes the last change,
    /// and [`StoreError::VersionOverflow`] if the counter is exhausted.
    pub fn apply(
        &mut self,
        expected: Option<Version>,
        diff: &FieldDiff,
        event_id: EventId,
        turn: u64,
        checkpoint_interval: u64,
    ) -> Result<Version, StoreError> {
        self.check_expected(expected)?;
        self.check_turn(turn)?;
        let to_version = self.next_version()?;

        let mut state = EntityState::clone(&self.head);
        apply_diff(&mut state, diff);
        let state = Arc::new(state);

        self.changes.push(StateChange {
            entity_id: self.id.clone(),
            from_version: self.version,
            to_version,
            event_id,
            turn,
            diff: diff.clone(),
        });
        if to_version.is_checkpoint(checkpoint_interval) {
            self.checkpoints.insert(to_version, Arc::clone(&state));
            tracing::trace!(entity_id = %self.id, version = %to_version, "Materialized checkpoint");
        }
        self.head = state;
        self.version = to_version;
        Ok(to_version)
    }

    /// Fail with a conflict unless the record is at `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] on mismatch.
    pub fn check_expected(&self, expected: Option<Version>) -> Result<(), StoreError> {
        match expected {
            Some(expected) if expected != self.version => Err(StoreError::VersionConflict {
                entity_id: self.id.clone(),
                expected,
                actual: self.version,
            }),
            _ => Ok(()),
        }
    }

    /// Fail unless a change at `turn` keeps change turns non-decreasing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TurnRegression`] if `turn` is earlier than the
    /// last change (or the creation turn).
    pub fn check_turn(&self, turn: u64) -> Result<(), StoreError> {
        let last_turn = self.last_turn();
        if turn < last_turn {
            return Err(StoreError::TurnRegression {
                entity_id: self.id.clone(),
                turn,
                last_turn,
            });
        }
        Ok(())
    }

    /// The version the next change would produce.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionOverflow`] if there is none.
    pub fn next_version(&self) -> Result<Version, StoreError> {
        self.version.next().ok_or_else(|| StoreError::VersionOverflow {
            entity_id: self.id.clone(),
        })
    }

    /// The entity's id.
    pub const fn id(&self) -> &EntityId {
        &self.id
    }

    /// Current version.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Current state.
    pub fn head(&self) -> Arc<EntityState> {
        Arc::clone(&self.head)
    }

    /// The event that registered the entity.
    pub const fn created_by(&self) -> EventId {
        self.created_by
    }

    /// The turn the entity was registered.
    pub const fn created_turn(&self) -> u64 {
        self.created_turn
    }

    /// Turn of the most recent change, or the creation turn.
    pub fn last_turn(&self) -> u64 {
        self.changes.last().map_or(self.created_turn, |c| c.turn)
    }

    /// The event behind the most recent change, or the creating event.
    pub fn last_event(&self) -> EventId {
        self.changes.last().map_or(self.created_by, |c| c.event_id)
    }

    /// Ordered state-change records.
    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    /// The version-1 state.
    pub fn initial(&self) -> Option<&EntityState> {
        self.checkpoints.get(&Version::INITIAL).map(AsRef::as_ref)
    }

    /// The nearest checkpoint at or before `version`.
    pub fn checkpoint_at_or_before(&self, version: Version) -> Option<(Version, &EntityState)> {
        self.checkpoints
            .range(..=version)
            .next_back()
            .map(|(v, state)| (*v, state.as_ref()))
    }

    /// Number of materialized checkpoints.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// The stale marker, if the entity is stale.
    pub const fn stale(&self) -> Option<&StaleMarker> {
        self.stale.as_ref()
    }

    /// Record that the entity's derived state is stale.
    ///
    /// A later marker replaces an earlier one, except that for the same
    /// event the highest-priority rule's marker is kept.
    pub fn mark_stale(&mut self, marker: StaleMarker) {
        let keep_existing = self.stale.as_ref().is_some_and(|existing| {
            existing.event_id == marker.event_id && existing.priority >= marker.priority
        });
        if !keep_existing {
            self.stale = Some(marker);
        }
    }

    /// Clear and return the stale marker.
    pub fn clear_stale(&mut self) -> Option<StaleMarker> {
        self.stale.take()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chronicle_types::RuleId;
    use serde_json::json;

    use super::*;

    fn diff(field: &str, value: serde_json::Value) -> FieldDiff {
        let mut diff = FieldDiff::new();
        diff.insert(field.to_owned(), value);
        diff
    }

    fn record() -> EntityRecord {
        EntityRecord::new(EntityId::from("king_01"), EntityState::new(), EventId::FIRST, 0)
    }

    #[test]
    fn apply_advances_by_one() {
        let mut rec = record();
        let v = rec
            .apply(None, &diff("hp", json!(10)), EventId::new(2), 1, 50)
            .unwrap();
        assert_eq!(v, Version::new(2));
        assert_eq!(rec.changes().len(), 1);
        assert_eq!(rec.head().get("hp"), Some(&json!(10)));
    }

    #[test]
    fn identical_diff_is_still_a_version() {
        let mut rec = record();
        rec.apply(None, &diff("hp", json!(10)), EventId::new(2), 1, 50).unwrap();
        let v = rec
            .apply(None, &diff("hp", json!(10)), EventId::new(3), 1, 50)
            .unwrap();
        assert_eq!(v, Version::new(3));
    }

    #[test]
    fn stale_expected_version_conflicts_without_mutation() {
        let mut rec = record();
        rec.apply(None, &diff("hp", json!(10)), EventId::new(2), 1, 50).unwrap();
        let result = rec.apply(
            Some(Version::INITIAL),
            &diff("hp", json!(0)),
            EventId::new(3),
            2,
            50,
        );
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        assert_eq!(rec.version(), Version::new(2));
        assert_eq!(rec.head().get("hp"), Some(&json!(10)));
    }

    #[test]
    fn change_before_last_turn_is_rejected_without_mutation() {
        let mut rec = record();
        rec.apply(None, &diff("a", json!("t10")), EventId::new(2), 10, 50).unwrap();
        let result = rec.apply(None, &diff("b", json!("t5")), EventId::new(3), 5, 50);
        assert_eq!(
            result,
            Err(StoreError::TurnRegression {
                entity_id: EntityId::from("king_01"),
                turn: 5,
                last_turn: 10,
            })
        );
        assert_eq!(rec.version(), Version::new(2));
        assert!(rec.head().get("b").is_none());

        // Same turn is fine.
        rec.apply(None, &diff("b", json!("t10")), EventId::new(3), 10, 50).unwrap();
        assert_eq!(rec.version(), Version::new(3));
    }

    #[test]
    fn change_before_creation_turn_is_rejected() {
        let mut rec = EntityRecord::new(EntityId::from("heir"), EntityState::new(), EventId::FIRST, 8);
        assert!(matches!(
            rec.apply(None, &diff("a", json!(1)), EventId::new(2), 7, 50),
            Err(StoreError::TurnRegression { last_turn: 8, .. })
        ));
    }

    #[test]
    fn checkpoints_follow_interval() {
        let mut rec = record();
        for i in 0..10_u64 {
            rec.apply(None, &diff("n", json!(i)), EventId::new(i + 2), i, 4)
                .unwrap();
        }
        // Versions 1, 4, 8.
        assert_eq!(rec.checkpoint_count(), 3);
        let (v, state) = rec.checkpoint_at_or_before(Version::new(7)).unwrap();
        assert_eq!(v, Version::new(4));
        assert_eq!(state.get("n"), Some(&json!(2)));
    }

    #[test]
    fn same_event_keeps_highest_priority_marker() {
        let mut rec = record();
        let marker = |event: u64, rule: &str, priority: i32| StaleMarker {
            event_id: EventId::new(event),
            rule: RuleId::from(rule),
            priority,
        };
        rec.mark_stale(marker(5, "high", 10));
        rec.mark_stale(marker(5, "low", 1));
        assert_eq!(rec.stale().map(|m| m.rule.as_str()), Some("high"));
        rec.mark_stale(marker(6, "later", 0));
        assert_eq!(rec.stale().map(|m| m.rule.as_str()), Some("later"));
        assert!(rec.clear_stale().is_some());
        assert!(rec.stale().is_none());
    }
}

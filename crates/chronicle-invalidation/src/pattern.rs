//! Resolving entity patterns against the current entity universe.

use std::collections::BTreeSet;

use chronicle_types::{EntityId, Event};
use serde_json::Value;

use crate::host::InvalidationHost;
use crate::rule::EntityPattern;
use crate::RuleError;

/// Match `text` against a glob where `*` matches any run of characters and
/// `?` matches exactly one.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0_usize, 0_usize);
    // Position of the last `*` and the text index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match (pattern.get(p), text.get(t)) {
            (Some('*'), _) => {
                backtrack = Some((p, t));
                p = p.saturating_add(1);
            }
            (Some(&pc), Some(&tc)) if pc == '?' || pc == tc => {
                p = p.saturating_add(1);
                t = t.saturating_add(1);
            }
            _ => match backtrack {
                Some((star, tried)) => {
                    let retry = tried.saturating_add(1);
                    backtrack = Some((star, retry));
                    p = star.saturating_add(1);
                    t = retry;
                }
                None => return false,
            },
        }
    }
    pattern
        .get(p..)
        .is_some_and(|rest| rest.iter().all(|&c| c == '*'))
}

impl EntityPattern {
    /// Resolve the pattern to existing entity ids.
    ///
    /// Event-relative patterns resolve to nothing without an event. Ids are
    /// returned without duplicates: in affected order for `affected`, in
    /// field order for `referenced_by`, sorted otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Unresolvable`] when a `referenced_by` field
    /// holds something other than an id or a list of ids.
    pub fn resolve<H: InvalidationHost>(
        &self,
        event: Option<&Event>,
        host: &H,
    ) -> Result<Vec<EntityId>, RuleError> {
        let ids = match self {
            Self::Affected => event.map(|e| e.affected.clone()).unwrap_or_default(),
            Self::Id { id } => {
                let id = EntityId::from(id.as_str());
                if host.state_of(&id).is_some() {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            Self::Glob { pattern } => host
                .entity_ids()
                .into_iter()
                .filter(|id| glob_match(pattern, id.as_str()))
                .collect(),
            Self::Tagged { tag } => host
                .entity_ids()
                .into_iter()
                .filter(|id| {
                    host.state_of(id)
                        .is_some_and(|state| chronicle_types::has_tag(&state, tag))
                })
                .collect(),
            Self::FieldEquals { field, value } => host
                .entity_ids()
                .into_iter()
                .filter(|id| {
                    host.state_of(id)
                        .is_some_and(|state| state.get(field) == Some(value))
                })
                .collect(),
            Self::ReferencedBy { field } => match event {
                Some(event) => referenced_ids(event, field, host)?,
                None => Vec::new(),
            },
        };
        Ok(dedup_in_order(ids))
    }
}

fn referenced_ids<H: InvalidationHost>(
    event: &Event,
    field: &str,
    host: &H,
) -> Result<Vec<EntityId>, RuleError> {
    let mut ids = Vec::new();
    for subject in &event.affected {
        let Some(state) = host.state_of(subject) else {
            continue;
        };
        let unresolvable = || RuleError::Unresolvable {
            entity_id: subject.clone(),
            field: field.to_owned(),
        };
        match state.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(id)) => ids.push(EntityId::from(id.as_str())),
            Some(Value::Array(items)) => {
                for item in items {
                    let id = item.as_str().ok_or_else(unresolvable)?;
                    ids.push(EntityId::from(id));
                }
            }
            Some(_) => return Err(unresolvable()),
        }
    }
    ids.retain(|id| host.state_of(id).is_some());
    Ok(ids)
}

fn dedup_in_order(ids: Vec<EntityId>) -> Vec<EntityId> {
    let mut seen = BTreeSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Utc;
    use chronicle_events::EventDraft;
    use chronicle_types::kinds::ENTITY_DEATH;
    use chronicle_types::{EntityState, EventId, EventKind, StaleMarker};
    use serde_json::json;

    use super::*;

    struct World(BTreeMap<EntityId, Arc<EntityState>>);

    impl World {
        fn new(entities: &[(&str, serde_json::Value)]) -> Self {
            Self(
                entities
                    .iter()
                    .map(|(id, state)| {
                        let state: EntityState = serde_json::from_value(state.clone()).unwrap();
                        (EntityId::from(*id), Arc::new(state))
                    })
                    .collect(),
            )
        }
    }

    impl InvalidationHost for World {
        type Error = String;

        fn entity_ids(&self) -> Vec<EntityId> {
            self.0.keys().cloned().collect()
        }

        fn state_of(&self, entity: &EntityId) -> Option<Arc<EntityState>> {
            self.0.get(entity).cloned()
        }

        fn last_activity(&self, _entity: &EntityId) -> Option<(u64, EventId)> {
            None
        }

        fn mark_stale(&self, _entity: &EntityId, _marker: StaleMarker) {}

        fn record_derived(&self, _draft: EventDraft) -> Result<Arc<Event>, String> {
            Err("read-only".to_owned())
        }
    }

    fn death_of(id: &str) -> Event {
        Event {
            id: EventId::new(7),
            kind: EventKind::from(ENTITY_DEATH),
            affected: vec![EntityId::from(id)],
            changes: BTreeMap::new(),
            source_ref: None,
            cascade_hints: Vec::new(),
            turn: 1,
            caused_by: None,
            rule: None,
            cascade_depth: 0,
            recorded_at: Utc::now(),
        }
    }

    fn ids(list: &[&str]) -> Vec<EntityId> {
        list.iter().map(|s| EntityId::from(*s)).collect()
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("king_*", "king_01"));
        assert!(glob_match("king_??", "king_01"));
        assert!(!glob_match("king_?", "king_01"));
        assert!(glob_match("*_north*", "realm_north_march"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("a*b", "acbd"));
        assert!(glob_match("a*b*", "acbd"));
        assert!(glob_match("exact", "exact"));
    }

    #[test]
    fn resolves_tags_and_fields() {
        let world = World::new(&[
            ("king_01", json!({"tags": ["ruler"], "realm": "north"})),
            ("queen_02", json!({"tags": ["ruler"]})),
            ("north", json!({"stability": "calm"})),
            ("smith", json!({"tags": ["artisan"]})),
        ]);
        let tagged = EntityPattern::Tagged {
            tag: "ruler".to_owned(),
        };
        assert_eq!(tagged.resolve(None, &world).unwrap(), ids(&["king_01", "queen_02"]));

        let calm = EntityPattern::FieldEquals {
            field: "stability".to_owned(),
            value: json!("calm"),
        };
        assert_eq!(calm.resolve(None, &world).unwrap(), ids(&["north"]));

        let realm = EntityPattern::ReferencedBy {
            field: "realm".to_owned(),
        };
        let death = death_of("king_01");
        assert_eq!(realm.resolve(Some(&death), &world).unwrap(), ids(&["north"]));
        assert!(realm.resolve(None, &world).unwrap().is_empty());
    }

    #[test]
    fn missing_ids_resolve_to_nothing() {
        let world = World::new(&[("a", json!({}))]);
        let pattern = EntityPattern::Id {
            id: "ghost".to_owned(),
        };
        assert!(pattern.resolve(None, &world).unwrap().is_empty());
    }

    #[test]
    fn non_id_reference_field_is_unresolvable() {
        let world = World::new(&[("king_01", json!({"realm": 42}))]);
        let pattern = EntityPattern::ReferencedBy {
            field: "realm".to_owned(),
        };
        let result = pattern.resolve(Some(&death_of("king_01")), &world);
        assert!(matches!(result, Err(RuleError::Unresolvable { .. })));
    }
}

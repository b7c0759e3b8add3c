//! Point-in-time reconstruction.
//!
//! Reconstruction loads the nearest checkpoint at or before the target
//! version and replays the state-change records from there. The number of
//! diffs applied is therefore below the checkpoint interval no matter how
//! long the history is. Replay reads nothing but the checkpoint and the
//! diffs: no clock, no randomness.

use chronicle_types::{AsOf, EntityId, EntityState, StateChange, Version, apply_diff};
use serde::Serialize;

use crate::record::EntityRecord;
use crate::StoreError;

/// The result of reconstructing an entity at a point in its history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconstruction {
    /// The entity.
    pub entity_id: EntityId,
    /// The version the state corresponds to.
    pub version: Version,
    /// The reconstructed state.
    pub state: EntityState,
    /// The checkpoint replay started from.
    pub checkpoint_version: Version,
    /// Number of diffs replayed on top of the checkpoint.
    pub diffs_applied: usize,
}

/// Replay `changes` in order on top of `base`.
pub fn replay<'a>(
    base: &EntityState,
    changes: impl IntoIterator<Item = &'a StateChange>,
) -> EntityState {
    let mut state = base.clone();
    for change in changes {
        apply_diff(&mut state, &change.diff);
    }
    state
}

/// Resolve `target` to a concrete version of `record`.
///
/// A turn resolves to the last version whose change happened at or before
/// that turn, or version 1 if no change qualifies.
///
/// # Errors
///
/// Returns [`StoreError::VersionOutOfRange`] for versions outside
/// `1..=current` and [`StoreError::BeforeCreation`] for turns before
/// registration.
pub fn resolve_version(record: &EntityRecord, target: AsOf) -> Result<Version, StoreError> {
    match target {
        AsOf::Version(version) => {
            if version < Version::INITIAL || version > record.version() {
                return Err(StoreError::VersionOutOfRange {
                    entity_id: record.id().clone(),
                    requested: version,
                    current: record.version(),
                });
            }
            Ok(version)
        }
        AsOf::Turn(turn) => {
            if turn < record.created_turn() {
                return Err(StoreError::BeforeCreation {
                    entity_id: record.id().clone(),
                    turn,
                    created_turn: record.created_turn(),
                });
            }
            // Change turns are non-decreasing, so the changes made at or
            // before `turn` form a prefix.
            let changes = record.changes();
            let applied = changes.partition_point(|change| change.turn <= turn);
            Ok(applied
                .checked_sub(1)
                .and_then(|idx| changes.get(idx))
                .map_or(Version::INITIAL, |change| change.to_version))
        }
    }
}

/// Reconstruct `record` at `target`.
///
/// The current version is served straight from the record's head; older
/// versions replay from the nearest checkpoint.
///
/// # Errors
///
/// Returns the errors of [`resolve_version`], or
/// [`StoreError::CorruptHistory`] if the record's invariants do not hold.
pub fn reconstruct(record: &EntityRecord, target: AsOf) -> Result<Reconstruction, StoreError> {
    let version = resolve_version(record, target)?;
    if version == record.version() {
        return Ok(Reconstruction {
            entity_id: record.id().clone(),
            version,
            state: EntityState::clone(&record.head()),
            checkpoint_version: version,
            diffs_applied: 0,
        });
    }

    let corrupt = |reason| StoreError::CorruptHistory {
        entity_id: record.id().clone(),
        reason,
    };
    let (checkpoint_version, checkpoint) = record
        .checkpoint_at_or_before(version)
        .ok_or_else(|| corrupt("no checkpoint at or before target"))?;

    // changes[i] moves version i + 1 to i + 2, so the diffs after a
    // checkpoint at version c start at index c - 1.
    let start = index_of(checkpoint_version).ok_or_else(|| corrupt("checkpoint index"))?;
    let end = index_of(version).ok_or_else(|| corrupt("target index"))?;
    let diffs = record
        .changes()
        .get(start..end)
        .ok_or_else(|| corrupt("missing state-change records"))?;

    Ok(Reconstruction {
        entity_id: record.id().clone(),
        version,
        state: replay(checkpoint, diffs),
        checkpoint_version,
        diffs_applied: diffs.len(),
    })
}

/// Index into `changes` of the record that leaves `version`.
fn index_of(version: Version) -> Option<usize> {
    version
        .get()
        .checked_sub(1)
        .and_then(|idx| usize::try_from(idx).ok())
}

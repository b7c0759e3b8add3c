//! The engine's window onto the entity store and event log.

use std::sync::Arc;

use chronicle_events::EventDraft;
use chronicle_types::{EntityId, EntityState, Event, EventId, StaleMarker};

/// Everything the invalidation engine reads and writes.
///
/// Rules never touch the store directly: they read current states through
/// this trait, and the engine applies their consequences through it. The
/// orchestrator implements it over its store and log.
pub trait InvalidationHost {
    /// Why a synthesised event could not be recorded.
    type Error: std::fmt::Display;

    /// Every known entity id, sorted.
    fn entity_ids(&self) -> Vec<EntityId>;

    /// Current state of `entity`, if it exists.
    fn state_of(&self, entity: &EntityId) -> Option<Arc<EntityState>>;

    /// Turn and event of the entity's most recent change (or creation).
    fn last_activity(&self, entity: &EntityId) -> Option<(u64, EventId)>;

    /// Record that `entity` is stale.
    fn mark_stale(&self, entity: &EntityId, marker: StaleMarker);

    /// Append a synthesised event and apply its changes.
    ///
    /// # Errors
    ///
    /// Whatever prevents the event from being committed.
    fn record_derived(&self, draft: EventDraft) -> Result<Arc<Event>, Self::Error>;
}

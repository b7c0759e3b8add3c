//! Versioned entity store for Chronicle.
//!
//! Every entity carries its current state, a contiguous version counter, and
//! the ordered list of [`StateChange`] records that produced it. Historical
//! states are reconstructed from the nearest checkpoint, so the cost of any
//! lookup is bounded by the checkpoint interval rather than history length.
//!
//! # Architecture
//!
//! ```text
//! EntityStore
//!     |
//!     +-- RwLock<HashMap<EntityId, Arc<Mutex<EntityRecord>>>>
//!     |       the map lock is held only to find or insert a record
//!     |
//!     +-- EntityRecord (one mutex per entity)
//!             |-- head          current state, O(1) reads
//!             |-- changes       StateChange per version transition
//!             +-- checkpoints   full snapshots every N versions
//! ```
//!
//! Mutations of different entities never contend on a shared lock.
//! Mutations of the same entity are serialized by its mutex and guarded by
//! optimistic version checks.
//!
//! # Modules
//!
//! - [`record`] -- A single entity's versioned history
//! - [`reconstruct`] -- Checkpoint-plus-replay reconstruction
//! - [`store`] -- The concurrent [`EntityStore`] and multi-entity locking
//!
//! [`StateChange`]: chronicle_types::StateChange

pub mod reconstruct;
pub mod record;
pub mod store;

pub use reconstruct::{Reconstruction, replay};
pub use record::EntityRecord;
pub use store::{EntitySnapshot, EntityStore, LockedEntities};

use chronicle_types::{EntityId, Version};

/// Default number of versions between materialized checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 50;

/// Errors raised by the entity store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The entity's version moved since the caller observed it. Re-read and
    /// retry.
    #[error("version conflict on '{entity_id}': expected {expected}, found {actual}")]
    VersionConflict {
        /// The contended entity.
        entity_id: EntityId,
        /// The version the caller observed.
        expected: Version,
        /// The store's current version.
        actual: Version,
    },

    /// No entity with this id has been registered.
    #[error("unknown entity '{entity_id}'")]
    UnknownEntity {
        /// The missing entity.
        entity_id: EntityId,
    },

    /// An entity with this id is already registered.
    #[error("entity '{entity_id}' already exists")]
    AlreadyExists {
        /// The duplicate entity.
        entity_id: EntityId,
    },

    /// The requested version does not exist.
    #[error("entity '{entity_id}' has no {requested} (current is {current})")]
    VersionOutOfRange {
        /// The entity.
        entity_id: EntityId,
        /// The requested version.
        requested: Version,
        /// The entity's current version.
        current: Version,
    },

    /// The requested turn precedes the entity's registration.
    #[error("entity '{entity_id}' did not exist at turn {turn} (created at turn {created_turn})")]
    BeforeCreation {
        /// The entity.
        entity_id: EntityId,
        /// The requested turn.
        turn: u64,
        /// The turn the entity was registered.
        created_turn: u64,
    },

    /// A change was dated before the entity's most recent change.
    #[error("entity '{entity_id}' was last changed at turn {last_turn}; cannot apply a change at turn {turn}")]
    TurnRegression {
        /// The entity.
        entity_id: EntityId,
        /// Turn of the rejected change.
        turn: u64,
        /// Turn of the entity's most recent change, or its creation turn.
        last_turn: u64,
    },

    /// The version counter would overflow.
    #[error("version counter exhausted for '{entity_id}'")]
    VersionOverflow {
        /// The entity.
        entity_id: EntityId,
    },

    /// Stored history is inconsistent with its version numbers. Indicates a
    /// bug; the operation is refused rather than returning wrong state.
    #[error("history of '{entity_id}' is corrupt: {reason}")]
    CorruptHistory {
        /// The entity.
        entity_id: EntityId,
        /// What did not line up.
        reason: &'static str,
    },

    /// A lock was poisoned by a panicking writer.
    #[error("entity store lock poisoned")]
    LockPoisoned,
}

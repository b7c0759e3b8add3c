//! Event sourcing for Chronicle.
//!
//! Every state change starts life as an immutable [`Event`] appended to the
//! [`EventLog`]. Events are the source of truth: the entity store can be
//! rebuilt by replaying them in sequence order.
//!
//! # Modules
//!
//! - [`registry`] -- The set of event kinds accepted at runtime
//! - [`draft`] -- Validation of occurrences into unsequenced event drafts
//! - [`log`] -- The append-only, totally ordered in-memory event log
//! - [`persistence`] -- The external persistence collaborator interface
//! - [`write_behind`] -- Batched, fire-and-forget forwarding to persistence
//!
//! [`Event`]: chronicle_types::Event

pub mod draft;
pub mod log;
pub mod persistence;
pub mod registry;
pub mod write_behind;

pub use draft::EventDraft;
pub use log::EventLog;
pub use persistence::{EventPersistence, InMemoryPersistence, JsonLinesPersistence, PersistError};
pub use registry::KindRegistry;
pub use write_behind::{WriteBehind, WriteBehindHandle};

use chronicle_types::{EntityId, EventId, EventKind};

/// Errors raised while constructing or appending events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event kind is not registered.
    #[error("unknown event kind: {kind}")]
    UnknownEventKind {
        /// The rejected kind.
        kind: EventKind,
    },

    /// The event input is malformed.
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// What is wrong with the input.
        reason: String,
    },

    /// A pre-sequenced event was appended behind the log's head.
    #[error("event {id} is not after the log head {head}")]
    OutOfOrder {
        /// The rejected event id.
        id: EventId,
        /// The current last id in the log.
        head: EventId,
    },

    /// The sequence counter would overflow.
    #[error("event sequence exhausted")]
    SequenceExhausted,

    /// A lock guarding the log was poisoned by a panicking writer.
    #[error("event log lock poisoned")]
    LockPoisoned,
}

impl EventError {
    /// Shorthand for an [`EventError::InvalidEvent`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Shorthand for an invalid-event error about one entity.
    pub fn invalid_entity(entity: &EntityId, reason: &str) -> Self {
        Self::InvalidEvent {
            reason: format!("entity '{entity}': {reason}"),
        }
    }
}

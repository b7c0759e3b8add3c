//! Rule-driven invalidation for Chronicle.
//!
//! Rules are pure predicates over an event (or over elapsed narrative time)
//! and the current entity states. When a rule fires, the entities its
//! pattern resolves to are marked stale, and the rule may synthesise a
//! follow-on event that is fed back into the rules. Cascades are bounded
//! by a maximum depth instead of cycle detection, so any rule set
//! terminates.
//!
//! # Modules
//!
//! - [`rule`] -- Serialisable rule specifications and conditions
//! - [`pattern`] -- Resolution of entity patterns to concrete ids
//! - [`host`] -- The view of the world the engine reads and writes through
//! - [`engine`] -- The [`InvalidationEngine`] itself

pub mod engine;
pub mod host;
pub mod pattern;
pub mod rule;

pub use engine::{InvalidationEngine, InvalidationReport};
pub use host::InvalidationHost;
pub use pattern::glob_match;
pub use rule::{CascadeSpec, Condition, EntityPattern, RuleSpec, Trigger};

use chronicle_types::{EntityId, EventId, EventKind, RuleId};
use serde::{Deserialize, Serialize};

/// Default number of cascade hops before synthesis stops.
pub const DEFAULT_MAX_CASCADE_DEPTH: u32 = 3;

/// Why a rule could not be used, at configuration time or while resolving
/// its pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// The rule has no name.
    #[error("rule name must not be empty")]
    EmptyName,

    /// Another rule already uses this name.
    #[error("duplicate rule name '{name}'")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// The rule triggers on or cascades into a kind nobody registered.
    #[error("event kind '{kind}' is not registered")]
    UnregisteredKind {
        /// The unknown kind.
        kind: EventKind,
    },

    /// A cascade into the registration kind. Entities are only created by
    /// registration or on first reference.
    #[error("rules cannot cascade into '{kind}'")]
    CreationCascade {
        /// The creation kind.
        kind: EventKind,
    },

    /// A glob pattern with nothing in it.
    #[error("glob pattern must not be empty")]
    EmptyGlob,

    /// A time-based rule uses a pattern that needs a triggering event.
    #[error("pattern '{pattern}' needs a triggering event and cannot be used by an elapsed rule")]
    NeedsEvent {
        /// The offending pattern.
        pattern: &'static str,
    },

    /// `elapsed { turns: 0 }` would fire on every evaluation.
    #[error("elapsed rules need at least one turn")]
    ZeroElapsed,

    /// A `referenced_by` field does not hold entity ids.
    #[error("field '{field}' of '{entity_id}' is not an entity id or list of ids")]
    Unresolvable {
        /// The entity whose field was read.
        entity_id: EntityId,
        /// The field.
        field: String,
    },
}

/// What an outcome asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// The entity's derived state is stale.
    MarkStale,
    /// The entity is a target of a synthesised event.
    DerivedEvent(EventId),
}

/// One consequence of a rule firing for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationOutcome {
    /// The affected entity.
    pub entity: EntityId,
    /// The rule that fired.
    pub rule: RuleId,
    /// The rule's priority.
    pub priority: i32,
    /// The event the rule fired on, or the entity's last event for
    /// time-based rules.
    pub event_id: EventId,
    /// What to do about the entity.
    pub directive: Directive,
}

/// Non-fatal problems reported alongside results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum InvalidationWarning {
    /// A cascade was truncated at the depth limit.
    CascadeDepthExceeded {
        /// The rule whose cascade was dropped.
        rule: RuleId,
        /// The kind it would have synthesised.
        kind: EventKind,
        /// Depth of the event the rule fired on.
        depth: u32,
    },

    /// A malformed rule was skipped.
    ConfigurationWarning {
        /// The rule.
        rule: RuleId,
        /// What is wrong with it.
        reason: String,
    },

    /// The host refused to record a synthesised event.
    DerivedEventRejected {
        /// The rule that synthesised it.
        rule: RuleId,
        /// Why it was refused.
        reason: String,
    },
}

impl InvalidationWarning {
    /// A configuration warning built from a rule error.
    pub fn configuration(rule: &RuleId, error: &RuleError) -> Self {
        Self::ConfigurationWarning {
            rule: rule.clone(),
            reason: error.to_string(),
        }
    }
}

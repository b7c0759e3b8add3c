//! Event kinds.
//!
//! The set of kinds is closed at runtime (an event of an unregistered kind is
//! rejected) but extensible through configuration, so [`EventKind`] is an open
//! string newtype rather than an enum. Membership is decided by the kind
//! registry in `chronicle-events`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Registration of a new entity; its change map carries the initial state.
pub const ENTITY_CREATED: &str = "EntityCreated";
/// An entity died or was destroyed.
pub const ENTITY_DEATH: &str = "EntityDeath";
/// The relationship between two or more entities changed.
pub const RELATIONSHIP_CHANGE: &str = "RelationshipChange";
/// A location became known.
pub const LOCATION_DISCOVERED: &str = "LocationDiscovered";
/// A resource ran out.
pub const RESOURCE_DEPLETED: &str = "ResourceDepleted";
/// Rulership of a realm became contested.
pub const SUCCESSION_CRISIS: &str = "SuccessionCrisis";
/// A correction of previously recorded state. Events are never edited.
pub const STATE_CORRECTION: &str = "StateCorrection";

/// Kinds every registry knows without configuration.
pub const BUILTIN_KINDS: &[&str] = &[
    ENTITY_CREATED,
    ENTITY_DEATH,
    RELATIONSHIP_CHANGE,
    LOCATION_DISCOVERED,
    RESOURCE_DEPLETED,
    SUCCESSION_CRISIS,
    STATE_CORRECTION,
];

/// The kind of an [`Event`](crate::Event).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct EventKind(pub String);

impl EventKind {
    /// Create a kind from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The kind's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the entity registration kind.
    pub fn is_creation(&self) -> bool {
        self.0 == ENTITY_CREATED
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        Self(name)
    }
}

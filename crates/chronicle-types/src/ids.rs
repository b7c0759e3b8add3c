//! Identifier types.
//!
//! Entity and rule identifiers are opaque caller-chosen strings
//! (`king_01`, `ruler_death_succession`). Event identifiers are the logical
//! sequence number assigned at append time, so comparing two [`EventId`]s
//! compares their position in the log. Versions are per-entity counters that
//! start at 1 and advance by exactly one per applied change.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Generates a newtype wrapper around [`String`] with standard derives.
macro_rules! define_key {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return the inner [`String`].
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

define_key! {
    /// Stable identifier of a tracked entity (character, location, faction, item).
    EntityId
}

define_key! {
    /// Name of a configured invalidation rule.
    RuleId
}

/// Identifier of an event: its logical sequence number in the log.
///
/// Sequence numbers start at [`EventId::FIRST`] and are strictly increasing.
/// Wall-clock time never participates in ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub struct EventId(pub u64);

impl EventId {
    /// The sequence number of the first event ever appended.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw sequence number.
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Return the raw sequence number.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id following this one, or `None` on overflow.
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(seq) => Some(Self(seq)),
            None => None,
        }
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-entity version number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub struct Version(pub u64);

impl Version {
    /// Version of a freshly registered entity.
    pub const INITIAL: Self = Self(1);

    /// Wrap a raw version number.
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Return the raw version number.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version following this one, or `None` on overflow.
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Whether this version is a checkpoint for the given interval.
    ///
    /// Version 1 is always a checkpoint (it is the registered initial state).
    /// An interval of zero disables periodic checkpoints.
    pub const fn is_checkpoint(self, interval: u64) -> bool {
        if self.0 == 1 {
            return true;
        }
        match self.0.checked_rem(interval) {
            Some(rem) => rem == 0,
            None => false,
        }
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

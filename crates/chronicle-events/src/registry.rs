//! The registry of accepted event kinds.

use std::collections::BTreeSet;

use chronicle_types::{BUILTIN_KINDS, EventKind};

use crate::EventError;

/// The set of event kinds accepted at runtime.
///
/// Starts with the built-in kinds; configuration may register more at
/// startup. Read-only once the orchestrator is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindRegistry {
    kinds: BTreeSet<EventKind>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl KindRegistry {
    /// A registry holding only the built-in kinds.
    pub fn with_builtins() -> Self {
        Self {
            kinds: BUILTIN_KINDS.iter().map(|&k| EventKind::from(k)).collect(),
        }
    }

    /// An empty registry. Only useful in tests.
    pub const fn empty() -> Self {
        Self {
            kinds: BTreeSet::new(),
        }
    }

    /// Register a kind. Returns `false` if it was already registered.
    pub fn register(&mut self, kind: impl Into<EventKind>) -> bool {
        self.kinds.insert(kind.into())
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: &EventKind) -> bool {
        self.kinds.contains(kind)
    }

    /// Fail with [`EventError::UnknownEventKind`] unless `kind` is registered.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventKind`] for unregistered kinds.
    pub fn require(&self, kind: &EventKind) -> Result<(), EventError> {
        if self.contains(kind) {
            Ok(())
        } else {
            Err(EventError::UnknownEventKind { kind: kind.clone() })
        }
    }

    /// Iterate the registered kinds in name order.
    pub fn iter(&self) -> impl Iterator<Item = &EventKind> {
        self.kinds.iter()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

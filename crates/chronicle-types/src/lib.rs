//! Shared type definitions for the Chronicle versioned entity store.
//!
//! This crate is the single source of truth for the data that flows between
//! the event log, the entity store, the invalidation engine, and the
//! orchestrator. Types defined here flow downstream to `TypeScript` via
//! `ts-rs` for the presentation layer.
//!
//! # Modules
//!
//! - [`ids`] -- Identifier newtypes for entities, events, rules, and versions
//! - [`kinds`] -- The open [`EventKind`] newtype and the built-in kind names
//! - [`structs`] -- Events, occurrences, state-change records, and views

pub mod ids;
pub mod kinds;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use ids::{EntityId, EventId, RuleId, Version};
pub use kinds::{BUILTIN_KINDS, EventKind};
pub use structs::{
    AsOf, ChangeSummary, EntityState, EntityView, Event, FieldDiff, Occurrence, StaleMarker,
    StateChange, TAGS_FIELD, apply_diff, has_tag,
};

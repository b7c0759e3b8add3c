//! The Chronicle façade.
//!
//! [`Orchestrator`] is the only component callers talk to. It owns the
//! event log and the entity store, turns reported occurrences into events,
//! commits them, and drives invalidation.
//!
//! ```text
//! Occurrence ──► EventDraft ──► commit (entity locks + log append + apply)
//!                                   │
//!                                   ▼
//!                        InvalidationEngine::process
//!                          │ stale markers    │ derived events
//!                          ▼                  ▼
//!                     EntityStore         commit (again)
//! ```
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with defaults and env overrides
//! - [`orchestrator`] -- Submit, query, history, elapsed-time evaluation

pub mod config;
pub mod orchestrator;

pub use config::{ChronicleConfig, ConfigError};
pub use orchestrator::{ElapsedReceipt, Orchestrator, SubmitReceipt};

use chronicle_events::{EventError, PersistError};
use chronicle_store::StoreError;

/// Errors surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ChronicleError {
    /// Event construction or append failed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The entity store refused the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reading persisted events failed.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another submit carrying the same source reference has not finished.
    /// Retry to receive its event id, or to record the occurrence if that
    /// submit failed.
    #[error("an occurrence with source_ref '{source_ref}' is still being recorded")]
    SourceInFlight {
        /// The contended source reference.
        source_ref: String,
    },

    /// Rehydration needs an orchestrator that has seen no events.
    #[error("cannot rehydrate: the event log already holds {events} events")]
    AlreadyPopulated {
        /// Events already in the log.
        events: usize,
    },
}

impl ChronicleError {
    /// Whether a well-behaved caller should re-read and retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::VersionConflict { .. }) | Self::SourceInFlight { .. }
        )
    }
}

//! The JSON command protocol.
//!
//! One command per input line, one response per output line:
//!
//! ```text
//! {"command":"register","entity":"king_01","state":{"tags":["ruler"]}}
//! {"ok":1}
//! {"command":"query","entity":"king_01","as_of":{"turn":3}}
//! {"ok":{"entity_id":"king_01","version":1,...}}
//! {"command":"query","entity":"nobody"}
//! {"error":"unknown entity 'nobody'"}
//! ```

use chronicle_core::Orchestrator;
use chronicle_types::{AsOf, EntityId, EntityState, Event, EventId, Occurrence};
use serde::Deserialize;
use serde_json::{Value, json};

/// A request read from stdin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Register an entity.
    Register {
        /// The new entity.
        entity: EntityId,
        /// Its version-1 state.
        #[serde(default)]
        state: EntityState,
        /// Narrative time of registration.
        #[serde(default)]
        turn: u64,
    },
    /// Record an occurrence.
    Submit {
        /// What happened.
        occurrence: Occurrence,
    },
    /// Read current or historical state.
    Query {
        /// The entity.
        entity: EntityId,
        /// Omit for the current state.
        #[serde(default)]
        as_of: Option<AsOf>,
    },
    /// List state-change summaries.
    History {
        /// The entity.
        entity: EntityId,
    },
    /// Evaluate time-based rules.
    Elapsed {
        /// Current turn.
        now: u64,
    },
    /// Clear a stale marker.
    Acknowledge {
        /// The entity.
        entity: EntityId,
    },
    /// List stale entities.
    Stale,
    /// List events after an id.
    Events {
        /// Omit for the whole log.
        #[serde(default)]
        after: Option<EventId>,
    },
}

/// Run one command against the orchestrator.
///
/// # Errors
///
/// Returns whatever the orchestrator reports, or a serialization error.
pub fn execute(chronicle: &Orchestrator, command: Command) -> anyhow::Result<Value> {
    let value = match command {
        Command::Register {
            entity,
            state,
            turn,
        } => serde_json::to_value(chronicle.register_entity(entity, state, turn)?)?,
        Command::Submit { occurrence } => {
            serde_json::to_value(chronicle.submit_occurrence(occurrence)?)?
        }
        Command::Query { entity, as_of } => {
            serde_json::to_value(chronicle.query_state(&entity, as_of)?)?
        }
        Command::History { entity } => serde_json::to_value(chronicle.get_history(&entity)?)?,
        Command::Elapsed { now } => serde_json::to_value(chronicle.evaluate_elapsed(now))?,
        Command::Acknowledge { entity } => {
            serde_json::to_value(chronicle.acknowledge_stale(&entity)?)?
        }
        Command::Stale => serde_json::to_value(chronicle.stale_entities())?,
        Command::Events { after } => {
            let events = chronicle.events_since(after);
            let events: Vec<&Event> = events.iter().map(AsRef::as_ref).collect();
            serde_json::to_value(events)?
        }
    };
    Ok(value)
}

/// Parse `line`, run it, and render the response line.
pub fn respond(chronicle: &Orchestrator, line: &str) -> String {
    let response = match serde_json::from_str::<Command>(line) {
        Ok(command) => match execute(chronicle, command) {
            Ok(value) => json!({ "ok": value }),
            Err(error) => {
                tracing::debug!(error = %error, "Command failed");
                json!({ "error": error.to_string() })
            }
        },
        Err(error) => json!({ "error": format!("malformed command: {error}") }),
    };
    response.to_string()
}

//! Rule specifications.
//!
//! Rules arrive from configuration, so every type here round-trips through
//! serde. A rule in YAML:
//!
//! ```yaml
//! name: ruler_succession
//! priority: 10
//! trigger:
//!   on_event:
//!     kind: EntityDeath
//!     condition:
//!       subject_tagged: { tag: ruler }
//! targets:
//!   referenced_by: { field: realm }
//! cascade:
//!   kind: SuccessionCrisis
//!   set: { stability: unrest }
//! ```

use chronicle_events::KindRegistry;
use chronicle_types::{Event, EventKind, FieldDiff, has_tag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::host::InvalidationHost;
use crate::RuleError;

/// One configured invalidation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique rule name, used in markers, outcomes and warnings.
    pub name: String,
    /// Higher fires first; ties keep registration order.
    #[serde(default)]
    pub priority: i32,
    /// When the rule fires.
    pub trigger: Trigger,
    /// Which entities it invalidates.
    pub targets: EntityPattern,
    /// Optional follow-on event synthesised for the targets.
    #[serde(default)]
    pub cascade: Option<CascadeSpec>,
}

/// When a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// An event of `kind` occurred and `condition` holds.
    OnEvent {
        /// The kind to match.
        kind: EventKind,
        /// Predicate over the event's changes and subjects.
        #[serde(default)]
        condition: Condition,
    },
    /// At least `turns` have passed since a target's last change.
    Elapsed {
        /// Threshold in caller-supplied turns.
        turns: u64,
    },
}

/// Predicate over a triggering event.
///
/// Field conditions look at the event's diffs; tag conditions look at the
/// current (post-event) state of the affected entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Always holds.
    #[default]
    Always,
    /// Some diff sets `field` to exactly `value`.
    FieldEquals {
        /// Field name.
        field: String,
        /// Expected new value.
        value: Value,
    },
    /// Some diff touches `field`.
    FieldChanged {
        /// Field name.
        field: String,
    },
    /// Some affected entity carries `tag`.
    SubjectTagged {
        /// The tag.
        tag: String,
    },
    /// Every nested condition holds.
    All(Vec<Condition>),
    /// At least one nested condition holds.
    Any(Vec<Condition>),
    /// The nested condition does not hold.
    Not(Box<Condition>),
}

/// Which entities a rule resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPattern {
    /// The triggering event's affected entities.
    Affected,
    /// One entity by id.
    Id {
        /// The id.
        id: String,
    },
    /// Ids matching a glob with `*` and `?` wildcards.
    Glob {
        /// The glob.
        pattern: String,
    },
    /// Entities whose `tags` include `tag`.
    Tagged {
        /// The tag.
        tag: String,
    },
    /// Entities whose current `field` equals `value`.
    FieldEquals {
        /// Field name.
        field: String,
        /// Value to match.
        value: Value,
    },
    /// Ids listed in `field` of the triggering event's affected entities.
    ReferencedBy {
        /// Field holding an id or a list of ids.
        field: String,
    },
}

impl EntityPattern {
    /// Short name for messages.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Affected => "affected",
            Self::Id { .. } => "id",
            Self::Glob { .. } => "glob",
            Self::Tagged { .. } => "tagged",
            Self::FieldEquals { .. } => "field_equals",
            Self::ReferencedBy { .. } => "referenced_by",
        }
    }

    /// Whether resolving the pattern needs a triggering event.
    pub const fn needs_event(&self) -> bool {
        matches!(self, Self::Affected | Self::ReferencedBy { .. })
    }
}

/// The follow-on event a rule synthesises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeSpec {
    /// Kind of the synthesised event.
    pub kind: EventKind,
    /// Diff applied to every target; empty means the targets are only
    /// referenced.
    #[serde(default)]
    pub set: FieldDiff,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl RuleSpec {
    /// Check the rule against the registered kinds.
    ///
    /// Name uniqueness is checked by the engine, which sees all rules.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self, registry: &KindRegistry) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }

        match &self.trigger {
            Trigger::OnEvent { kind, .. } => require_kind(registry, kind)?,
            Trigger::Elapsed { turns } => {
                if *turns == 0 {
                    return Err(RuleError::ZeroElapsed);
                }
                if self.targets.needs_event() {
                    return Err(RuleError::NeedsEvent {
                        pattern: self.targets.label(),
                    });
                }
            }
        }

        if let EntityPattern::Glob { pattern } = &self.targets
            && pattern.is_empty()
        {
            return Err(RuleError::EmptyGlob);
        }

        if let Some(cascade) = &self.cascade {
            require_kind(registry, &cascade.kind)?;
            if cascade.kind.is_creation() {
                return Err(RuleError::CreationCascade {
                    kind: cascade.kind.clone(),
                });
            }
        }
        Ok(())
    }

    /// The kind this rule triggers on, for event rules.
    pub const fn trigger_kind(&self) -> Option<&EventKind> {
        match &self.trigger {
            Trigger::OnEvent { kind, .. } => Some(kind),
            Trigger::Elapsed { .. } => None,
        }
    }
}

fn require_kind(registry: &KindRegistry, kind: &EventKind) -> Result<(), RuleError> {
    if registry.contains(kind) {
        Ok(())
    } else {
        Err(RuleError::UnregisteredKind { kind: kind.clone() })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Condition {
    /// Whether the condition holds for `event`.
    pub fn holds<H: InvalidationHost>(&self, event: &Event, host: &H) -> bool {
        match self {
            Self::Always => true,
            Self::FieldEquals { field, value } => event
                .mutations()
                .any(|(_, diff)| diff.get(field) == Some(value)),
            Self::FieldChanged { field } => {
                event.mutations().any(|(_, diff)| diff.contains_key(field))
            }
            Self::SubjectTagged { tag } => event.affected.iter().any(|id| {
                host.state_of(id)
                    .is_some_and(|state| has_tag(&state, tag))
            }),
            Self::All(conditions) => conditions.iter().all(|c| c.holds(event, host)),
            Self::Any(conditions) => conditions.iter().any(|c| c.holds(event, host)),
            Self::Not(condition) => !condition.holds(event, host),
        }
    }
}

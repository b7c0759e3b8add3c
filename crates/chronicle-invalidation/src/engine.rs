//! The invalidation engine.
//!
//! For every event the engine walks the event rules in priority order,
//! resolves each firing rule's targets, marks them stale, and synthesises
//! the rule's cascade event if it has one. Synthesised events go through
//! the same rules, breadth first, until no rule fires or the cascade depth
//! limit is hit. Time-based rules run only when the caller asks, against a
//! caller-supplied turn.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chronicle_events::{EventDraft, KindRegistry};
use chronicle_types::{EntityId, Event, EventId, EventKind, RuleId, StaleMarker};

use crate::host::InvalidationHost;
use crate::rule::{RuleSpec, Trigger};
use crate::{Directive, InvalidationOutcome, InvalidationWarning, RuleError};

/// Everything one round of invalidation produced.
#[derive(Debug, Clone, Default)]
pub struct InvalidationReport {
    /// Stale and derived-event outcomes, in the order they were applied.
    pub outcomes: Vec<InvalidationOutcome>,
    /// Non-fatal problems met on the way.
    pub warnings: Vec<InvalidationWarning>,
    /// Events synthesised by cascades, in sequence order.
    pub derived: Vec<Arc<Event>>,
}

impl InvalidationReport {
    /// Fold `other` into this report.
    pub fn merge(&mut self, other: Self) {
        self.outcomes.extend(other.outcomes);
        self.warnings.extend(other.warnings);
        self.derived.extend(other.derived);
    }
}

#[derive(Debug)]
struct ActiveRule {
    id: RuleId,
    spec: RuleSpec,
}

/// Where a rule firing came from.
#[derive(Clone, Copy)]
enum Origin<'a> {
    Event(&'a Arc<Event>),
    Elapsed { now: u64 },
}

/// Evaluates configured rules against events and elapsed time.
#[derive(Debug)]
pub struct InvalidationEngine {
    /// Valid rules, sorted by descending priority then registration order.
    rules: Vec<ActiveRule>,
    registry: KindRegistry,
    max_depth: u32,
    /// Rules whose runtime failure was already reported.
    warned: Mutex<HashSet<RuleId>>,
}

impl InvalidationEngine {
    /// Build an engine from rule specifications.
    ///
    /// Malformed rules are skipped and reported as configuration warnings;
    /// they never prevent the engine from starting.
    pub fn new(
        specs: Vec<RuleSpec>,
        registry: KindRegistry,
        max_depth: u32,
    ) -> (Self, Vec<InvalidationWarning>) {
        let mut warnings = Vec::new();
        let mut names = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());

        for spec in specs {
            let id = RuleId::from(spec.name.as_str());
            let verdict = spec.validate(&registry).and_then(|()| {
                if names.insert(spec.name.clone()) {
                    Ok(())
                } else {
                    Err(RuleError::DuplicateName {
                        name: spec.name.clone(),
                    })
                }
            });
            match verdict {
                Ok(()) => rules.push(ActiveRule { id, spec }),
                Err(error) => {
                    tracing::warn!(rule = %id, error = %error, "Skipping malformed invalidation rule");
                    warnings.push(InvalidationWarning::configuration(&id, &error));
                }
            }
        }

        // Stable sort keeps registration order within a priority.
        rules.sort_by(|a, b| b.spec.priority.cmp(&a.spec.priority));

        tracing::info!(
            rules = rules.len(),
            skipped = warnings.len(),
            max_depth,
            "Invalidation engine ready"
        );

        let engine = Self {
            rules,
            registry,
            max_depth,
            warned: Mutex::new(HashSet::new()),
        };
        (engine, warnings)
    }

    /// Names of the active rules in firing order.
    pub fn rule_names(&self) -> impl Iterator<Item = &RuleId> {
        self.rules.iter().map(|rule| &rule.id)
    }

    /// The maximum number of cascade hops.
    pub const fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Kinds an event of `kind` may cascade into.
    pub fn potential_cascades(&self, kind: &EventKind) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = Vec::new();
        for rule in &self.rules {
            if rule.spec.trigger_kind() == Some(kind)
                && let Some(cascade) = &rule.spec.cascade
                && !kinds.contains(&cascade.kind)
            {
                kinds.push(cascade.kind.clone());
            }
        }
        kinds
    }

    /// Run the event rules against `event` and every event they cascade
    /// into.
    pub fn process<H: InvalidationHost>(&self, event: &Arc<Event>, host: &H) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let mut queue = VecDeque::from([Arc::clone(event)]);

        while let Some(current) = queue.pop_front() {
            for rule in &self.rules {
                let Trigger::OnEvent { kind, condition } = &rule.spec.trigger else {
                    continue;
                };
                if *kind != current.kind || !condition.holds(&current, host) {
                    continue;
                }
                self.fire(rule, Origin::Event(&current), host, &mut report, &mut queue);
            }
        }
        report
    }

    /// Run the time-based rules at turn `now`, then the event rules for any
    /// events they synthesise.
    pub fn evaluate_elapsed<H: InvalidationHost>(&self, now: u64, host: &H) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let mut queue = VecDeque::new();

        for rule in &self.rules {
            if matches!(rule.spec.trigger, Trigger::Elapsed { .. }) {
                self.fire(rule, Origin::Elapsed { now }, host, &mut report, &mut queue);
            }
        }

        for derived in queue {
            report.merge(self.process(&derived, host));
        }
        report
    }

    fn fire<H: InvalidationHost>(
        &self,
        rule: &ActiveRule,
        origin: Origin<'_>,
        host: &H,
        report: &mut InvalidationReport,
        queue: &mut VecDeque<Arc<Event>>,
    ) {
        let targets = match self.targets(rule, origin, host) {
            Ok(targets) => targets,
            Err(error) => {
                self.warn_once(rule, &error, report);
                return;
            }
        };
        if targets.is_empty() {
            return;
        }

        for (entity, event_id) in &targets {
            host.mark_stale(
                entity,
                StaleMarker {
                    event_id: *event_id,
                    rule: rule.id.clone(),
                    priority: rule.spec.priority,
                },
            );
            report.outcomes.push(outcome(rule, entity, *event_id, Directive::MarkStale));
        }

        let Some(cascade) = &rule.spec.cascade else {
            return;
        };

        let depth = match origin {
            Origin::Event(event) => event.cascade_depth,
            Origin::Elapsed { .. } => 0,
        };
        if depth >= self.max_depth {
            tracing::warn!(
                rule = %rule.id,
                kind = %cascade.kind,
                depth,
                "Cascade depth exceeded, truncating"
            );
            report.warnings.push(InvalidationWarning::CascadeDepthExceeded {
                rule: rule.id.clone(),
                kind: cascade.kind.clone(),
                depth,
            });
            return;
        }

        let ids: Vec<EntityId> = targets.into_iter().map(|(id, _)| id).collect();
        let hints = self.potential_cascades(&cascade.kind);
        let drafted = match origin {
            Origin::Event(parent) => EventDraft::derived(
                cascade.kind.clone(),
                ids,
                &cascade.set,
                parent,
                rule.id.clone(),
                hints,
                &self.registry,
            ),
            Origin::Elapsed { now } => EventDraft::scheduled(
                cascade.kind.clone(),
                ids,
                &cascade.set,
                now,
                rule.id.clone(),
                hints,
                &self.registry,
            ),
        };

        let recorded = drafted
            .map_err(|error| error.to_string())
            .and_then(|draft| host.record_derived(draft).map_err(|error| error.to_string()));
        match recorded {
            Ok(derived) => {
                tracing::info!(
                    rule = %rule.id,
                    kind = %derived.kind,
                    event_id = %derived.id,
                    depth = derived.cascade_depth,
                    "Cascade synthesised event"
                );
                for entity in &derived.affected {
                    let directive = Directive::DerivedEvent(derived.id);
                    let trigger = match origin {
                        Origin::Event(parent) => parent.id,
                        Origin::Elapsed { .. } => derived.id,
                    };
                    report.outcomes.push(outcome(rule, entity, trigger, directive));
                }
                report.derived.push(Arc::clone(&derived));
                queue.push_back(derived);
            }
            Err(reason) => {
                tracing::warn!(rule = %rule.id, reason = %reason, "Derived event rejected");
                report.warnings.push(InvalidationWarning::DerivedEventRejected {
                    rule: rule.id.clone(),
                    reason,
                });
            }
        }
    }

    /// Resolve a rule's targets paired with the event each stale marker
    /// should point at.
    fn targets<H: InvalidationHost>(
        &self,
        rule: &ActiveRule,
        origin: Origin<'_>,
        host: &H,
    ) -> Result<Vec<(EntityId, EventId)>, RuleError> {
        match origin {
            Origin::Event(event) => {
                let ids = rule.spec.targets.resolve(Some(event), host)?;
                Ok(ids.into_iter().map(|id| (id, event.id)).collect())
            }
            Origin::Elapsed { now } => {
                let Trigger::Elapsed { turns } = rule.spec.trigger else {
                    return Ok(Vec::new());
                };
                let ids = rule.spec.targets.resolve(None, host)?;
                Ok(ids
                    .into_iter()
                    .filter_map(|id| {
                        let (last_turn, last_event) = host.last_activity(&id)?;
                        let due = last_turn.checked_add(turns)?;
                        (due <= now).then_some((id, last_event))
                    })
                    .collect())
            }
        }
    }

    fn warn_once(&self, rule: &ActiveRule, error: &RuleError, report: &mut InvalidationReport) {
        let Ok(mut warned) = self.warned.lock() else {
            return; // poisoned mutex -- skip the report, keep processing
        };
        if warned.insert(rule.id.clone()) {
            tracing::warn!(rule = %rule.id, error = %error, "Invalidation rule failed to resolve, skipping");
            report
                .warnings
                .push(InvalidationWarning::configuration(&rule.id, error));
        }
    }
}

fn outcome(
    rule: &ActiveRule,
    entity: &EntityId,
    event_id: EventId,
    directive: Directive,
) -> InvalidationOutcome {
    InvalidationOutcome {
        entity: entity.clone(),
        rule: rule.id.clone(),
        priority: rule.spec.priority,
        event_id,
        directive,
    }
}

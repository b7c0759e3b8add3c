//! Orchestrator scenarios: cascades, replay, conflicts, deduplication and
//! rehydration.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chronicle_core::{ChronicleConfig, ChronicleError, Orchestrator};
use chronicle_events::{EventPersistence, InMemoryPersistence, WriteBehind};
use chronicle_invalidation::InvalidationWarning;
use chronicle_store::StoreError;
use chronicle_types::kinds::{ENTITY_DEATH, RELATIONSHIP_CHANGE, SUCCESSION_CRISIS};
use chronicle_types::{AsOf, EntityId, EntityState, Event, EventId, Occurrence, Version};
use serde_json::json;

const SUCCESSION: &str = r"
rules:
  - name: ruler_succession
    priority: 10
    trigger:
      on_event:
        kind: EntityDeath
        condition:
          subject_tagged: { tag: ruler }
    targets: affected
    cascade:
      kind: SuccessionCrisis
";

fn orchestrator(yaml: &str) -> Orchestrator {
    let config = ChronicleConfig::parse(yaml).unwrap();
    let orchestrator = Orchestrator::from_config(&config);
    assert!(orchestrator.configuration_warnings().is_empty());
    orchestrator
}

fn state(value: serde_json::Value) -> EntityState {
    serde_json::from_value(value).unwrap()
}

fn id(s: &str) -> EntityId {
    EntityId::from(s)
}

#[test]
fn king_death_cascades_into_exactly_one_succession_crisis() {
    let chronicle = orchestrator(SUCCESSION);
    chronicle
        .register_entity("king_01", state(json!({"tags": ["ruler"], "status": "alive"})), 0)
        .unwrap();
    for turn in 1..=2 {
        chronicle
            .submit_occurrence(
                Occurrence::new(RELATIONSHIP_CHANGE, [id("king_01")])
                    .set("king_01", "mood", json!(turn))
                    .at_turn(turn),
            )
            .unwrap();
    }
    assert_eq!(chronicle.query_state(&id("king_01"), None).unwrap().version, Version::new(3));

    let receipt = chronicle
        .submit_occurrence(
            Occurrence::new(ENTITY_DEATH, [id("king_01")])
                .set("king_01", "status", json!("deceased"))
                .at_turn(3),
        )
        .unwrap();

    let king = chronicle.query_state(&id("king_01"), None).unwrap();
    assert_eq!(king.version, Version::new(4));
    assert_eq!(king.state.get("status"), Some(&json!("deceased")));
    assert_eq!(king.stale.as_ref().map(|m| m.rule.as_str()), Some("ruler_succession"));

    let crises: Vec<_> = chronicle
        .events_since(None)
        .into_iter()
        .filter(|event| event.kind.as_str() == SUCCESSION_CRISIS)
        .collect();
    assert_eq!(crises.len(), 1);
    assert_eq!(crises[0].caused_by, Some(receipt.event_id));
    assert_eq!(receipt.derived_events, vec![crises[0].id]);
    assert_eq!(receipt.versions.get(&id("king_01")), Some(&Version::new(4)));
}

#[test]
fn every_entity_replays_and_reconstructs_consistently() {
    let chronicle = orchestrator("store:\n  checkpoint_interval: 7\n");
    let names = ["knight", "squire", "castle"];
    for name in names {
        chronicle.register_entity(name, EntityState::new(), 0).unwrap();
    }
    for turn in 1..=60_u64 {
        let (a, b) = (names[(turn % 3) as usize], names[((turn + 1) % 3) as usize]);
        chronicle
            .submit_occurrence(
                Occurrence::new(RELATIONSHIP_CHANGE, [id(a), id(b)])
                    .set(a, "trust", json!(turn))
                    .set(a, format!("met_{b}"), json!(true))
                    .at_turn(turn),
            )
            .unwrap();
    }

    for name in names {
        let entity = id(name);
        assert!(chronicle.verify_replay(&entity).unwrap());
        let history = chronicle.get_history(&entity).unwrap();
        for (idx, change) in history.iter().enumerate() {
            assert_eq!(change.from_version.get(), idx as u64 + 1);
            assert_eq!(change.to_version.get(), idx as u64 + 2);
            assert_eq!(change.kind.as_ref().map(|k| k.as_str()), Some(RELATIONSHIP_CHANGE));
        }
        let current = chronicle.query_state(&entity, None).unwrap();
        let rebuilt = chronicle
            .query_state(&entity, Some(AsOf::Version(current.version)))
            .unwrap();
        assert_eq!(rebuilt.state, current.state);
    }
}

#[test]
fn referenced_entities_do_not_advance() {
    let chronicle = orchestrator("");
    chronicle.register_entity("a", EntityState::new(), 0).unwrap();
    chronicle.register_entity("b", EntityState::new(), 0).unwrap();
    let receipt = chronicle
        .submit_occurrence(
            Occurrence::new(RELATIONSHIP_CHANGE, [id("a"), id("b")]).set("a", "rival", json!("b")),
        )
        .unwrap();
    assert_eq!(receipt.versions.len(), 1);
    assert_eq!(chronicle.query_state(&id("b"), None).unwrap().version, Version::INITIAL);
}

#[test]
fn unknown_entities_are_created_on_first_reference() {
    let chronicle = orchestrator("");
    chronicle
        .submit_occurrence(
            Occurrence::new("LocationDiscovered", [id("hidden_vale")])
                .set("hidden_vale", "discovered", json!(true)),
        )
        .unwrap();
    let vale = chronicle.query_state(&id("hidden_vale"), None).unwrap();
    assert_eq!(vale.version, Version::new(2));
    assert!(
        chronicle
            .query_state(&id("hidden_vale"), Some(AsOf::Version(Version::INITIAL)))
            .unwrap()
            .state
            .is_empty()
    );
}

#[test]
fn cyclic_rules_terminate_within_depth() {
    let chronicle = orchestrator(
        r"
invalidation:
  max_cascade_depth: 3
rules:
  - name: grudges_spread
    trigger:
      on_event: { kind: RelationshipChange }
    targets: affected
    cascade:
      kind: RelationshipChange
",
    );
    let receipt = chronicle
        .submit_occurrence(
            Occurrence::new(RELATIONSHIP_CHANGE, [id("a"), id("b")]).set("a", "grudge", json!(true)),
        )
        .unwrap();
    assert_eq!(receipt.derived_events.len(), 3);
    assert!(matches!(
        receipt.warnings.as_slice(),
        [InvalidationWarning::CascadeDepthExceeded { depth: 3, .. }]
    ));
}

#[test]
fn expected_version_conflict_leaves_no_trace() {
    let chronicle = orchestrator("");
    chronicle.register_entity("treasury", EntityState::new(), 0).unwrap();
    let events_before = chronicle.event_count();

    let result = chronicle.submit_occurrence(
        Occurrence::new("ResourceDepleted", [id("treasury"), id("mine")])
            .set("treasury", "gold", json!(0))
            .expect_version("treasury", Version::new(5)),
    );
    let error = result.unwrap_err();
    assert!(error.is_retryable());
    assert_eq!(chronicle.event_count(), events_before);
    assert_eq!(chronicle.entity_ids(), vec![id("treasury")]);
    assert_eq!(chronicle.query_state(&id("treasury"), None).unwrap().version, Version::INITIAL);
}

#[test]
fn concurrent_submits_with_one_expected_version_have_one_winner() {
    const WRITERS: usize = 12;
    let chronicle = orchestrator("");
    chronicle.register_entity("throne", EntityState::new(), 0).unwrap();
    let wins = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for writer in 0..WRITERS {
            let (chronicle, wins, conflicts) = (&chronicle, &wins, &conflicts);
            scope.spawn(move || {
                let result = chronicle.submit_occurrence(
                    Occurrence::new("SuccessionCrisis", [id("throne")])
                        .set("throne", "claimant", json!(writer))
                        .expect_version("throne", Version::INITIAL),
                );
                match result {
                    Ok(_) => wins.fetch_add(1, Ordering::SeqCst),
                    Err(ChronicleError::Store(StoreError::VersionConflict { .. })) => {
                        conflicts.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                };
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(conflicts.load(Ordering::SeqCst), WRITERS - 1);
    assert_eq!(chronicle.query_state(&id("throne"), None).unwrap().version, Version::new(2));
    // Registration plus the single winning event.
    assert_eq!(chronicle.event_count(), 2);
}

#[test]
fn resubmitted_source_ref_is_ignored() {
    let chronicle = orchestrator("events:\n  dedupe_source_refs: true\n");
    let occurrence = Occurrence::new(ENTITY_DEATH, [id("bandit")])
        .set("bandit", "status", json!("deceased"))
        .source_ref("chapter-3/scene-2");

    let first = chronicle.submit_occurrence(occurrence.clone()).unwrap();
    let second = chronicle.submit_occurrence(occurrence).unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.event_id, second.event_id);
    assert_eq!(chronicle.query_state(&id("bandit"), None).unwrap().version, Version::new(2));
}

#[test]
fn checkpoint_boundary_reconstruction_replays_one_diff() {
    let chronicle = orchestrator("");
    chronicle.register_entity("ledger", EntityState::new(), 0).unwrap();
    for n in 1..=127_u64 {
        chronicle
            .submit_occurrence(
                Occurrence::new("ResourceDepleted", [id("ledger")]).set("ledger", "entry", json!(n)),
            )
            .unwrap();
    }
    let view = chronicle
        .query_state(&id("ledger"), Some(AsOf::Version(Version::new(101))))
        .unwrap();
    assert_eq!(view.version, Version::new(101));
    assert_eq!(view.state.get("entry"), Some(&json!(100)));

    let report = chronicle
        .reconstruct(&id("ledger"), AsOf::Version(Version::new(101)))
        .unwrap();
    assert_eq!(report.checkpoint_version, Version::new(100));
    assert_eq!(report.diffs_applied, 1);
    assert_eq!(report.state, view.state);
}

#[test]
fn out_of_order_turns_are_rejected_and_turn_views_stay_in_the_past() {
    let chronicle = orchestrator("");
    chronicle.register_entity("keep", EntityState::new(), 0).unwrap();
    chronicle
        .submit_occurrence(
            Occurrence::new(RELATIONSHIP_CHANGE, [id("keep")])
                .set("keep", "a", json!("t10"))
                .at_turn(10),
        )
        .unwrap();
    let events_before = chronicle.event_count();

    let result = chronicle.submit_occurrence(
        Occurrence::new(RELATIONSHIP_CHANGE, [id("keep"), id("newcomer")])
            .set("keep", "b", json!("t5"))
            .set("newcomer", "seen", json!(true))
            .at_turn(5),
    );
    assert!(matches!(
        result,
        Err(ChronicleError::Store(StoreError::TurnRegression {
            turn: 5,
            last_turn: 10,
            ..
        }))
    ));
    assert!(!result.unwrap_err().is_retryable());
    assert_eq!(chronicle.event_count(), events_before);
    assert_eq!(chronicle.entity_ids(), vec![id("keep")]);

    let at_seven = chronicle.query_state(&id("keep"), Some(AsOf::Turn(7))).unwrap();
    assert_eq!(at_seven.version, Version::INITIAL);
    assert!(at_seven.state.is_empty());
    let at_ten = chronicle.query_state(&id("keep"), Some(AsOf::Turn(10))).unwrap();
    assert_eq!(at_ten.version, Version::new(2));
    assert_eq!(at_ten.state.get("a"), Some(&json!("t10")));
}

#[test]
fn elapsed_rules_and_acknowledgement() {
    let chronicle = orchestrator(
        r"
rules:
  - name: rumors_fade
    trigger:
      elapsed: { turns: 30 }
    targets:
      tagged: { tag: rumor }
",
    );
    chronicle
        .register_entity("tavern_talk", state(json!({"tags": ["rumor"]})), 10)
        .unwrap();

    assert!(chronicle.evaluate_elapsed(39).outcomes.is_empty());
    assert_eq!(chronicle.evaluate_elapsed(40).outcomes.len(), 1);
    assert_eq!(chronicle.stale_entities().len(), 1);

    let marker = chronicle.acknowledge_stale(&id("tavern_talk")).unwrap();
    assert_eq!(marker.map(|m| m.rule.into_inner()), Some("rumors_fade".to_owned()));
    assert!(chronicle.stale_entities().is_empty());
}

#[test]
fn creation_kind_cannot_be_submitted() {
    let chronicle = orchestrator("");
    let result = chronicle.submit_occurrence(Occurrence::new("EntityCreated", [id("x")]));
    assert!(matches!(result, Err(ChronicleError::Event(_))));
}

#[tokio::test]
async fn write_behind_log_rehydrates_identical_state() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let writer = WriteBehind::spawn(Arc::clone(&persistence) as Arc<dyn EventPersistence>, 4);

    let mut chronicle = orchestrator(SUCCESSION);
    chronicle.attach_write_behind(writer.handle());
    chronicle
        .register_entity("king_01", state(json!({"tags": ["ruler"]})), 0)
        .unwrap();
    chronicle
        .submit_occurrence(
            Occurrence::new(ENTITY_DEATH, [id("king_01")]).set("king_01", "status", json!("deceased")),
        )
        .unwrap();
    chronicle
        .submit_occurrence(
            Occurrence::new(RELATIONSHIP_CHANGE, [id("king_01"), id("heir")])
                .set("heir", "title", json!("regent"))
                .at_turn(2),
        )
        .unwrap();

    writer.handle().flush().await;
    let persisted = persistence.load_events_since(None).unwrap();
    assert_eq!(persisted.len(), chronicle.event_count());

    let mut restored = orchestrator(SUCCESSION);
    assert_eq!(restored.rehydrate(persisted).unwrap(), chronicle.event_count());
    for entity in chronicle.entity_ids() {
        let original = chronicle.query_state(&entity, None).unwrap();
        let rebuilt = restored.query_state(&entity, None).unwrap();
        assert_eq!(original.version, rebuilt.version);
        assert_eq!(original.state, rebuilt.state);
    }

    // Numbering resumes after the last persisted id.
    let next = restored
        .submit_occurrence(
            Occurrence::new(RELATIONSHIP_CHANGE, [id("heir")])
                .set("heir", "age", json!(17))
                .at_turn(3),
        )
        .unwrap();
    assert_eq!(next.event_id.get(), chronicle.event_count() as u64 + 1);

    assert!(matches!(
        restored.rehydrate(Vec::new()),
        Err(ChronicleError::AlreadyPopulated { .. })
    ));

    drop(chronicle);
    assert_eq!(writer.finish().await, persistence.len() as u64);
}

#[test]
fn failed_rehydration_leaves_the_orchestrator_empty() {
    let chronicle = orchestrator("events:\n  dedupe_source_refs: true\n");
    chronicle.register_entity("k", EntityState::new(), 0).unwrap();
    chronicle
        .submit_occurrence(
            Occurrence::new(ENTITY_DEATH, [id("k")])
                .set("k", "status", json!("deceased"))
                .source_ref("scene-1"),
        )
        .unwrap();
    let good: Vec<Event> = chronicle.events_since(None).iter().map(|event| (**event).clone()).collect();

    // A second registration of the same entity cannot be replayed.
    let mut corrupt = good.clone();
    let mut again = good[0].clone();
    again.id = EventId::new(3);
    corrupt.push(again);

    let mut restored = orchestrator("events:\n  dedupe_source_refs: true\n");
    assert!(matches!(
        restored.rehydrate(corrupt),
        Err(ChronicleError::Store(StoreError::AlreadyExists { .. }))
    ));
    assert_eq!(restored.event_count(), 0);
    assert!(restored.entity_ids().is_empty());

    assert_eq!(restored.rehydrate(good).unwrap(), 2);
    assert_eq!(restored.query_state(&id("k"), None).unwrap().version, Version::new(2));
    let resubmitted = restored
        .submit_occurrence(Occurrence::new(ENTITY_DEATH, [id("k")]).source_ref("scene-1"))
        .unwrap();
    assert!(resubmitted.duplicate);
}

#[test]
fn failed_sourced_submit_releases_its_source_ref() {
    let chronicle = orchestrator("events:\n  dedupe_source_refs: true\n");
    chronicle.register_entity("gate", EntityState::new(), 0).unwrap();
    let breach = || {
        Occurrence::new("ResourceDepleted", [id("gate")])
            .set("gate", "intact", json!(false))
            .source_ref("siege/breach")
    };

    let failed = chronicle.submit_occurrence(breach().expect_version("gate", Version::new(9)));
    assert!(failed.unwrap_err().is_retryable());

    let recorded = chronicle.submit_occurrence(breach()).unwrap();
    assert!(!recorded.duplicate);
    assert_eq!(chronicle.submit_occurrence(breach()).unwrap().event_id, recorded.event_id);
}

#[test]
fn racing_resubmissions_record_one_event() {
    const WRITERS: usize = 12;
    let chronicle = orchestrator("events:\n  dedupe_source_refs: true\n");
    chronicle.register_entity("bell", EntityState::new(), 0).unwrap();
    let recorded = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..WRITERS {
            let (chronicle, recorded) = (&chronicle, &recorded);
            scope.spawn(move || {
                loop {
                    let result = chronicle.submit_occurrence(
                        Occurrence::new(RELATIONSHIP_CHANGE, [id("bell")])
                            .set("bell", "rung", json!(true))
                            .source_ref("midnight"),
                    );
                    match result {
                        Ok(receipt) => {
                            if !receipt.duplicate {
                                recorded.fetch_add(1, Ordering::SeqCst);
                            }
                            break;
                        }
                        Err(ChronicleError::SourceInFlight { .. }) => std::thread::yield_now(),
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            });
        }
    });

    assert_eq!(recorded.load(Ordering::SeqCst), 1);
    assert_eq!(chronicle.query_state(&id("bell"), None).unwrap().version, Version::new(2));
}

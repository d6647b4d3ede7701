use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use sheetwright_core::{CanonicalState, DerivedFields, EntityId, FieldValue};
use sheetwright_engine::{
    DerivedRule, EngineConfig, EngineError, Recalculator, SessionStatus, StagedPatch,
};
use sheetwright_harness::{TestBench, fixtures, init_tracing};

// ============================================================================
// Per-entity serialization
// ============================================================================

#[test]
fn concurrent_plans_on_one_entity_serialize() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let passes = bench.passes();

    let revisions: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = &bench.engine;
                scope.spawn(move || {
                    engine
                        .acquire_item(
                            hero,
                            "gear",
                            vec![("name", FieldValue::Text(format!("arrow bundle {i}")))],
                            vec![fixtures::untyped("ammunition", 1)],
                        )
                        .map(|(_, receipt)| receipt.revision)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<Result<_, EngineError>>()
    })?;

    let distinct: BTreeSet<u64> = revisions.iter().copied().collect();
    assert_eq!(distinct, (2..=9).collect());
    let sheet = bench.sheet(hero)?;
    assert_eq!(sheet.revision, 9);
    assert_eq!(sheet.derived.value("ammunition"), Some(8));
    assert_eq!(bench.passes(), passes + 8);
    Ok(())
}

#[test]
fn sessions_on_different_entities_commit_in_parallel() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let heroes: Vec<EntityId> = (0..4)
        .map(|_| bench.create_character(vec![]))
        .collect::<Result<_, _>>()?;

    thread::scope(|scope| {
        let handles: Vec<_> = heroes
            .iter()
            .enumerate()
            .map(|(i, &hero)| {
                let engine = &bench.engine;
                scope.spawn(move || -> Result<(), EngineError> {
                    let mut session = engine.open_session(hero)?;
                    session.stage(StagedPatch::new("level").set("level", i as i64 + 1))?;
                    session.commit()?;
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .try_for_each(|h| h.join().expect("worker panicked"))
    })?;

    for (i, &hero) in heroes.iter().enumerate() {
        let sheet = bench.sheet(hero)?;
        assert_eq!(sheet.revision, 2);
        assert_eq!(sheet.canonical.integer("level"), Some(i as i64 + 1));
    }
    assert_eq!(bench.engine.sessions().open_sessions(), 0);
    Ok(())
}

// ============================================================================
// Commit events
// ============================================================================

#[test]
fn commit_publishes_one_event() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let events = bench.engine.subscribe();

    let mut session = bench.open(hero)?;
    session.stage(StagedPatch::new("name").set("name", "Rook"))?;
    let receipt = session.commit()?;

    let event = events.try_recv()?;
    assert_eq!(event.entity_id, hero);
    assert_eq!(event.session_id, Some(session.id()));
    assert_eq!(event.revision, receipt.revision);
    assert_eq!(event.operation, "character.build");
    assert_eq!(*event.snapshot, receipt.snapshot);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[test]
fn failed_commit_publishes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let events = bench.engine.subscribe();

    let mut session = bench.open(hero)?;
    session.stage(StagedPatch::new("name").set("name", "Rook"))?;
    bench.faults.fail_write(1);
    assert!(session.commit().is_err());
    assert!(events.try_recv().is_err());
    Ok(())
}

#[test]
fn full_subscriber_never_fails_commit() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::with_config(EngineConfig {
        event_capacity: 1,
        ..Default::default()
    })?;
    let hero = bench.create_character(vec![])?;
    let stalled = bench.engine.subscribe();
    let gone = bench.engine.subscribe();
    drop(gone);

    for n in 0..3i64 {
        let mut session = bench.open(hero)?;
        session.stage(StagedPatch::new("xp").set("experience", n * 100))?;
        session.commit()?;
        assert_eq!(session.status(), SessionStatus::Committed);
    }

    assert_eq!(bench.engine.events().dropped(), 2);
    assert_eq!(bench.engine.events().subscriber_count(), 1);
    assert_eq!(stalled.try_recv()?.revision, 2);
    assert_eq!(bench.sheet(hero)?.revision, 4);
    Ok(())
}

// ============================================================================
// Recalculation guard
// ============================================================================

/// Tries to run a nested pass for the entity it is deriving.
struct Echo {
    recalc: Arc<OnceLock<Weak<Recalculator>>>,
    entity_id: Arc<OnceLock<EntityId>>,
    nested: Arc<Mutex<Vec<bool>>>,
}

impl DerivedRule for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn derive(&self, canonical: &CanonicalState, derived: &mut DerivedFields) {
        let (Some(recalc), Some(entity_id)) = (
            self.recalc.get().and_then(Weak::upgrade),
            self.entity_id.get(),
        ) else {
            return;
        };
        if let Ok(result) = recalc.recompute(*entity_id, canonical) {
            self.nested.lock().expect("poisoned").push(result.is_some());
        }
        derived.values.insert("echo".into(), 1);
    }
}

#[test]
fn nested_recalculation_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
    let recalc_slot = Arc::new(OnceLock::new());
    let entity_slot = Arc::new(OnceLock::new());
    let nested = Arc::new(Mutex::new(Vec::new()));
    let bench = TestBench::with_recalculator(Recalculator::standard().with_rule(Box::new(Echo {
        recalc: Arc::clone(&recalc_slot),
        entity_id: Arc::clone(&entity_slot),
        nested: Arc::clone(&nested),
    })))?;
    let recalc = bench.engine.gateway().recalculator();
    recalc_slot
        .set(Arc::downgrade(recalc))
        .map_err(|_| "recalculator slot already set")?;

    let hero = bench.create_character(vec![])?;
    entity_slot.set(hero).map_err(|_| "entity slot already set")?;
    let passes = bench.passes();

    let mut session = bench.open(hero)?;
    session.stage(StagedPatch::new("name").set("name", "Mirror"))?;
    let receipt = session.commit()?;

    assert_eq!(*nested.lock().expect("poisoned"), vec![false]);
    assert_eq!(bench.passes(), passes + 1);
    assert_eq!(receipt.recalculations, 1);
    assert_eq!(receipt.snapshot.derived.value("echo"), Some(1));
    Ok(())
}

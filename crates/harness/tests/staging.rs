use sheetwright_core::{Condition, FieldValue};
use sheetwright_engine::{EngineError, IssueKind, SessionStatus, StageOutcome, StagedPatch};
use sheetwright_harness::{TestBench, fixtures, init_tracing};

// ============================================================================
// Overlay and dependency invalidation
// ============================================================================

#[test]
fn restaging_species_drops_class_and_skills() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![("name", FieldValue::Text("Ansel".into()))])?;
    let mut session = bench.open(hero)?;

    session.stage(StagedPatch::new("species").set("species", "elf"))?;
    session.stage(
        StagedPatch::new("class")
            .depends_on("species")
            .set("class", "ranger"),
    )?;
    session.stage(
        StagedPatch::new("skills")
            .depends_on("class")
            .set("favored_terrain", "forest"),
    )?;
    assert_eq!(session.draft().len(), 3);

    let outcome = session.stage(StagedPatch::new("species").set("species", "dwarf"))?;
    assert_eq!(
        outcome,
        StageOutcome::Replaced {
            invalidated: vec!["class".into(), "skills".into()]
        }
    );

    let preview = session.preview()?;
    assert_eq!(preview.state.field("species"), Some(&FieldValue::from("dwarf")));
    assert_eq!(preview.state.field("class"), None);
    assert_eq!(preview.state.field("favored_terrain"), None);
    let changed: Vec<&str> = preview.changes.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(changed, vec!["species"]);
    assert_eq!(preview.invalidated.len(), 2);
    Ok(())
}

#[test]
fn same_value_twice_keeps_downstream() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let mut session = bench.open(hero)?;

    session.stage(StagedPatch::new("species").set("species", "halfling"))?;
    session.stage(
        StagedPatch::new("class")
            .depends_on("species")
            .set("class", "rogue"),
    )?;
    let outcome = session.stage(StagedPatch::new("species").set("species", "halfling"))?;
    assert_eq!(outcome, StageOutcome::Unchanged);
    assert_eq!(session.draft().len(), 2);
    assert_eq!(
        session.preview()?.state.field("class"),
        Some(&FieldValue::from("rogue"))
    );
    Ok(())
}

#[test]
fn staged_sub_entities_follow_their_decision() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let mut session = bench.open(hero)?;

    session.stage(StagedPatch::new("class").set("class", "fighter"))?;
    session.stage(
        StagedPatch::new("bonus_feat")
            .depends_on("class")
            .add_sub_entity(
                "feats",
                vec![("name", "weapon focus".into())],
                vec![fixtures::untyped("attack", 1)],
            ),
    )?;
    assert_eq!(session.preview()?.bonuses.get("attack"), Some(&1));

    session.stage(StagedPatch::new("class").set("class", "wizard"))?;
    let preview = session.preview()?;
    assert!(preview.added.is_empty());
    assert_eq!(preview.bonuses.get("attack"), None);
    Ok(())
}

// ============================================================================
// Preview, rollback, session lifecycle
// ============================================================================

#[test]
fn preview_never_persists() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![("level", FieldValue::Integer(1))])?;
    let before = bench.sheet(hero)?;
    let writes = bench.faults.writes();

    let mut session = bench.open(hero)?;
    session.stage(StagedPatch::new("level").set("level", 2i64))?;
    session.stage(StagedPatch::new("gear").add_sub_entity(
        "gear",
        vec![("name", "lantern".into())],
        vec![],
    ))?;
    let preview = session.preview()?;
    assert_eq!(preview.added.len(), 1);
    assert_eq!(preview.state.integer("level"), Some(2));

    assert_eq!(bench.faults.writes(), writes);
    assert_eq!(bench.sheet(hero)?, before);
    Ok(())
}

#[test]
fn rollback_restores_base_after_many_patches() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![("name", FieldValue::Text("Corvin".into()))])?;
    let before = bench.sheet(hero)?;
    let passes = bench.passes();

    let mut session = bench.open(hero)?;
    for i in 0..20i64 {
        session.stage(StagedPatch::new(format!("step{i}").as_str()).set("counter", i))?;
    }
    session.stage(StagedPatch::new("name").clear("name"))?;
    session.rollback()?;

    assert_eq!(session.status(), SessionStatus::RolledBack);
    assert!(session.draft().is_empty());
    assert_eq!(bench.sheet(hero)?, before);
    assert_eq!(bench.passes(), passes);
    assert!(bench.engine.sessions().holder(hero).is_none());
    Ok(())
}

#[test]
fn second_session_conflicts_and_first_is_unaffected() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let mut first = bench.open(hero)?;
    first.stage(StagedPatch::new("alignment").set("alignment", "neutral"))?;

    let err = bench.engine.open_session(hero).err().ok_or("second open succeeded")?;
    match err {
        EngineError::Conflict { entity_id, holder } => {
            assert_eq!(entity_id, hero);
            assert_eq!(holder, first.id());
        }
        other => return Err(other.into()),
    }

    assert_eq!(first.status(), SessionStatus::Open);
    assert_eq!(first.draft().len(), 1);
    let receipt = first.commit()?;
    assert_eq!(receipt.revision, 2);
    assert!(bench.open(hero).is_ok());
    Ok(())
}

#[test]
fn other_entities_open_independently() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let a = bench.create_character(vec![])?;
    let b = bench.create_character(vec![])?;
    let _sa = bench.open(a)?;
    let _sb = bench.open(b)?;
    assert_eq!(bench.engine.sessions().open_sessions(), 2);
    Ok(())
}

#[test]
fn dropped_session_frees_the_entity() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    {
        let mut session = bench.open(hero)?;
        session.stage(StagedPatch::new("name").set("name", "Wren"))?;
    }
    assert!(bench.engine.sessions().holder(hero).is_none());
    assert_eq!(bench.sheet(hero)?.field("name"), None);
    Ok(())
}

#[test]
fn committed_session_is_terminal() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let mut session = bench.open(hero)?;
    session.stage(StagedPatch::new("name").set("name", "Wren"))?;
    session.commit()?;
    assert_eq!(session.status(), SessionStatus::Committed);

    assert!(matches!(
        session.rollback(),
        Err(EngineError::SessionClosed {
            status: SessionStatus::Committed,
            ..
        })
    ));
    assert!(matches!(session.commit(), Err(EngineError::SessionClosed { .. })));
    assert!(session.preview().is_err());
    Ok(())
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn unmet_prerequisite_blocks_commit() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![("strength", FieldValue::Integer(11))])?;
    let before = bench.sheet(hero)?;
    let mut session = bench.open(hero)?;

    session.stage(StagedPatch::new("feat").add_sub_entity(
        "feats",
        vec![("name", "power attack".into())],
        vec![
            fixtures::prerequisite(
                Condition::FieldAtLeast {
                    field: "strength".into(),
                    min: 13,
                },
                "power attack requires strength 13",
            ),
            fixtures::ability("power_attack"),
        ],
    ))?;

    match session.commit() {
        Err(EngineError::Validation(issues)) => {
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].kind, IssueKind::Prerequisite);
            assert_eq!(issues[0].message, "power attack requires strength 13");
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(session.status(), SessionStatus::Open);
    assert_eq!(bench.sheet(hero)?, before);

    session.stage(StagedPatch::new("strength").set("strength", 13i64))?;
    let receipt = session.commit()?;
    assert!(receipt.snapshot.derived.abilities.contains("power_attack"));
    Ok(())
}

#[test]
fn unknown_dependency_is_rejected_at_stage_time() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::new()?;
    let hero = bench.create_character(vec![])?;
    let mut session = bench.open(hero)?;
    let err = session
        .stage(
            StagedPatch::new("class")
                .depends_on("species")
                .set("class", "cleric"),
        )
        .err()
        .ok_or("stage succeeded")?;
    let EngineError::Validation(issues) = err else {
        return Err(err.into());
    };
    assert_eq!(issues[0].kind, IssueKind::UnknownDependency);
    assert!(session.draft().is_empty());
    Ok(())
}

#[test]
fn overlay_size_is_capped_by_config() -> Result<(), Box<dyn std::error::Error>> {
    let bench = TestBench::with_config(sheetwright_engine::EngineConfig {
        max_staged_patches: 2,
        ..Default::default()
    })?;
    let hero = bench.create_character(vec![])?;
    let mut session = bench.open(hero)?;
    session.stage(StagedPatch::new("a").set("a", 1i64))?;
    session.stage(StagedPatch::new("b").set("b", 1i64))?;
    // Replacing an existing tag is still allowed at the cap.
    session.stage(StagedPatch::new("b").set("b", 2i64))?;
    assert!(matches!(
        session.stage(StagedPatch::new("c").set("c", 1i64)),
        Err(EngineError::Validation(ref issues)) if issues[0].kind == IssueKind::TooManyPatches
    ));
    Ok(())
}

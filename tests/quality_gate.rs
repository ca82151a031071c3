use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use persona_pipeline::error::ValidationReason;
use persona_pipeline::facts::{Counter, FactKey, Role};
use persona_pipeline::jobs::validate_batch_job;
use persona_pipeline::quality_gate::{validate_batch, validate_row};
use persona_pipeline::riot_match::parse_match_json;
use persona_pipeline::store::{
    count_facts, insert_facts, load_quarantine, open_db, open_in_memory, persist_gate_outcome,
    record_quarantine,
};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

#[test]
fn sample_match_splits_into_accepted_and_quarantined() {
    let rows = parse_match_json(&read_fixture("riot_match_sample.json")).expect("fixture should parse");
    assert_eq!(rows.len(), 4);

    let outcome = validate_batch(rows, &HashMap::<FactKey, String>::new()).unwrap();
    assert_eq!(outcome.accepted.len(), 2);
    assert_eq!(outcome.quarantined.len(), 2);

    let alpha = &outcome.accepted[0];
    assert_eq!(alpha.player_id, "p-alpha");
    assert_eq!(alpha.role, Role::Top);
    assert_eq!(alpha.counter(Counter::Cs), 210);
    assert_eq!(alpha.duration_secs, 1800);

    let charlie = &outcome.quarantined[0];
    assert_eq!(charlie.row.player_id.as_deref(), Some("p-charlie"));
    assert_eq!(charlie.reason, ValidationReason::InvalidRange);
    assert_eq!(outcome.quarantined[1].reason, ValidationReason::MissingKey);
}

#[test]
fn negative_kills_are_quarantined_with_invalid_range() {
    let mut rows = parse_match_json(&read_fixture("riot_match_sample.json")).unwrap();
    rows.truncate(1);
    rows[0].kills = Some(-1.0);
    let outcome = validate_batch(rows, &HashMap::<FactKey, String>::new()).unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.quarantined[0].reason.code(), "INVALID_RANGE");
}

#[test]
fn resubmitted_batch_is_recognised_against_stored_facts() {
    let mut conn = open_in_memory().unwrap();
    let rows = parse_match_json(&read_fixture("riot_match_sample.json")).unwrap();

    let first = validate_batch(rows.clone(), &conn).unwrap();
    assert_eq!(insert_facts(&mut conn, &first.accepted).unwrap().inserted, 2);
    record_quarantine(&mut conn, &first.quarantined, Some("rk-1")).unwrap();

    let second = validate_batch(rows.clone(), &conn).unwrap();
    assert_eq!(second.accepted.len(), 2);
    assert_eq!(second.already_ingested, 2);
    assert_eq!(insert_facts(&mut conn, &second.accepted).unwrap().inserted, 0);
    assert_eq!(
        record_quarantine(&mut conn, &second.quarantined, Some("rk-2")).unwrap(),
        0
    );

    let mut changed = rows;
    changed[0].gold_earned = Some(99_999.0);
    let third = validate_batch(changed, &conn).unwrap();
    assert_eq!(third.accepted.len(), 1);
    assert_eq!(
        third.reason_counts().get(&ValidationReason::ConflictingDuplicate),
        Some(&1)
    );

    let stored = load_quarantine(&conn, ValidationReason::InvalidRange).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0.player_id.as_deref(), Some("p-charlie"));
}

#[test]
fn concurrent_batch_with_other_content_is_quarantined_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("facts.sqlite");
    let mut conn_a = open_db(&db).unwrap();
    let mut conn_b = open_db(&db).unwrap();

    let mut original = parse_match_json(&read_fixture("riot_match_sample.json")).unwrap();
    original.truncate(1);
    let mut changed = original.clone();
    changed[0].gold_earned = Some(99_999.0);

    // Batch b passes the gate before batch a stores its version of the key.
    let mut late = validate_batch(changed, &conn_b).unwrap();
    assert_eq!(late.accepted.len(), 1);
    let first = validate_batch_job(&mut conn_a, "rk-a", original).unwrap();
    assert_eq!(first.newly_stored, 1);

    let raced = insert_facts(&mut conn_b, &late.accepted).unwrap();
    assert_eq!(raced.inserted, 0);
    assert_eq!(raced.conflicts.len(), 1);

    let tx = conn_b.transaction().unwrap();
    let stored = persist_gate_outcome(&tx, &mut late, Some("rk-b")).unwrap();
    tx.commit().unwrap();
    assert_eq!(stored, 0);
    assert!(late.accepted.is_empty());
    assert_eq!(late.quarantined[0].reason, ValidationReason::ConflictingDuplicate);

    let conflicts = load_quarantine(&conn_a, ValidationReason::ConflictingDuplicate).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].0.gold_earned, Some(99_999.0));
    assert_eq!(count_facts(&conn_a).unwrap(), 1);
}

#[test]
fn non_finite_quarantined_row_reloads_with_its_values() {
    let mut conn = open_in_memory().unwrap();
    let mut rows = parse_match_json(&read_fixture("riot_match_sample.json")).unwrap();
    rows.truncate(1);
    rows[0].deaths = Some(f64::NAN);
    rows[0].gold_earned = Some(f64::NEG_INFINITY);

    let outcome = validate_batch(rows, &conn).unwrap();
    assert_eq!(outcome.quarantined[0].reason, ValidationReason::NonFinite);
    record_quarantine(&mut conn, &outcome.quarantined, Some("rk-nan")).unwrap();

    let stored = load_quarantine(&conn, ValidationReason::NonFinite).unwrap();
    let reloaded = &stored[0].0;
    assert!(reloaded.deaths.is_some_and(f64::is_nan));
    assert_eq!(reloaded.gold_earned, Some(f64::NEG_INFINITY));
    assert_eq!(reloaded.digest(), outcome.quarantined[0].row.digest());
    let verdict = validate_row(reloaded).unwrap_err();
    assert_eq!(verdict.0, ValidationReason::NonFinite);
}

use std::sync::{Arc, Barrier};
use std::thread;

use persona_pipeline::feature_store::{
    UpsertOutcome, latest_vectors, load_vector, register_schema, upsert_vector,
};
use persona_pipeline::features::{FeatureSchema, FeatureValue, FeatureVector, Window};
use persona_pipeline::store::{open_db, open_in_memory};

fn vector(player_id: &str, window: Window, dmg: f64) -> FeatureVector {
    FeatureVector {
        player_id: player_id.to_string(),
        window,
        schema_version: "lol-v1".to_string(),
        values: vec![
            FeatureValue {
                name: "dmg_per_min".to_string(),
                value: dmg,
            },
            FeatureValue {
                name: "win_rate".to_string(),
                value: 0.5,
            },
        ],
        match_count: 4,
    }
}

fn june() -> Window {
    Window::from_dates("2024-06-01", "2024-07-01").unwrap()
}

#[test]
fn identical_resubmission_keeps_revision() {
    let mut conn = open_in_memory().unwrap();
    let v = vector("p1", june(), 600.0);
    assert_eq!(upsert_vector(&mut conn, &v, None).unwrap(), UpsertOutcome::Inserted);
    assert_eq!(upsert_vector(&mut conn, &v, None).unwrap(), UpsertOutcome::Unchanged);
    let stored = load_vector(&conn, "p1", &june(), "lol-v1").unwrap().unwrap();
    assert_eq!(stored.revision, 1);
    assert_eq!(stored.vector, v);
}

#[test]
fn changed_vector_overwrites_and_bumps_revision() {
    let mut conn = open_in_memory().unwrap();
    upsert_vector(&mut conn, &vector("p1", june(), 600.0), None).unwrap();
    let outcome = upsert_vector(&mut conn, &vector("p1", june(), 610.0), None).unwrap();
    assert_eq!(outcome, UpsertOutcome::Updated { revision: 2 });
    let stored = load_vector(&conn, "p1", &june(), "lol-v1").unwrap().unwrap();
    assert_eq!(stored.vector.value("dmg_per_min"), Some(610.0));
}

#[test]
fn latest_vectors_pick_the_most_recent_window_per_player() {
    let mut conn = open_in_memory().unwrap();
    let may = Window::from_dates("2024-05-01", "2024-06-01").unwrap();
    upsert_vector(&mut conn, &vector("p2", may, 100.0), None).unwrap();
    upsert_vector(&mut conn, &vector("p2", june(), 200.0), None).unwrap();
    upsert_vector(&mut conn, &vector("p1", may, 300.0), None).unwrap();

    let latest = latest_vectors(&conn, "lol-v1").unwrap();
    let summary = latest
        .iter()
        .map(|s| (s.vector.player_id.as_str(), s.vector.value("dmg_per_min")))
        .collect::<Vec<_>>();
    assert_eq!(summary, vec![("p1", Some(300.0)), ("p2", Some(200.0))]);
    assert!(latest_vectors(&conn, "other").unwrap().is_empty());
}

#[test]
fn schema_version_cannot_be_redefined() {
    let conn = open_in_memory().unwrap();
    let schema = FeatureSchema::default_lol();
    register_schema(&conn, &schema).unwrap();
    register_schema(&conn, &schema).unwrap();
    let mut altered = schema.clone();
    altered.features.pop();
    assert!(register_schema(&conn, &altered).is_err());
}

#[test]
fn concurrent_writers_produce_one_row_and_one_revision_per_change() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.sqlite");
    open_db(&db_path).unwrap();

    let writers = 4;
    let barrier = Arc::new(Barrier::new(writers));
    let handles = (0..writers)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let db_path = db_path.clone();
            thread::spawn(move || {
                let mut conn = open_db(&db_path).unwrap();
                barrier.wait();
                let mut outcomes = Vec::new();
                for dmg in [600.0, 610.0] {
                    outcomes.push(upsert_vector(&mut conn, &vector("p1", june(), dmg), None).unwrap());
                }
                outcomes
            })
        })
        .collect::<Vec<_>>();
    let outcomes = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    let inserted = outcomes
        .iter()
        .filter(|o| **o == UpsertOutcome::Inserted)
        .count();
    assert_eq!(inserted, 1);

    let conn = open_db(&db_path).unwrap();
    let stored = load_vector(&conn, "p1", &june(), "lol-v1").unwrap().unwrap();
    let updates = outcomes
        .iter()
        .filter(|o| matches!(o, UpsertOutcome::Updated { .. }))
        .count() as i64;
    assert_eq!(stored.revision, 1 + updates);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM feature_vectors", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

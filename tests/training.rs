use persona_pipeline::config::PipelineConfig;
use persona_pipeline::error::{PipelineError, TrainingError};
use persona_pipeline::feature_store::upsert_vector;
use persona_pipeline::features::{FeatureValue, FeatureVector, Window};
use persona_pipeline::model_registry::{
    acquire_training_lock, active_model_version, list_models, load_model,
};
use persona_pipeline::persona_trainer::{fit_persona_model, train_model};
use persona_pipeline::snapshot::{create_snapshot, load_snapshot};
use persona_pipeline::store::open_in_memory;
use rusqlite::Connection;

const SCHEMA: &str = "test-v1";

fn vector(player_id: &str, dmg: f64, vision: f64) -> FeatureVector {
    FeatureVector {
        player_id: player_id.to_string(),
        window: Window::from_dates("2024-06-01", "2024-07-01").unwrap(),
        schema_version: SCHEMA.to_string(),
        values: vec![
            FeatureValue {
                name: "dmg_per_min".to_string(),
                value: dmg,
            },
            FeatureValue {
                name: "vision_per_min".to_string(),
                value: vision,
            },
        ],
        match_count: 10,
    }
}

/// Thirty players in three well separated groups.
fn seeded_store() -> Connection {
    let mut conn = open_in_memory().unwrap();
    let centers = [(900.0, 0.4), (300.0, 2.5), (550.0, 1.2)];
    for (g, (dmg, vision)) in centers.iter().enumerate() {
        for i in 0..10 {
            let v = vector(
                &format!("g{g}-p{i:02}"),
                dmg + i as f64 * 2.0,
                vision + i as f64 * 0.01,
            );
            upsert_vector(&mut conn, &v, None).unwrap();
        }
    }
    conn
}

fn cfg() -> PipelineConfig {
    PipelineConfig {
        candidate_k: vec![2, 3, 4],
        ..PipelineConfig::default()
    }
}

#[test]
fn training_publishes_incrementing_immutable_versions() {
    let mut conn = seeded_store();
    let snap = create_snapshot(&mut conn, SCHEMA).unwrap();
    assert_eq!(snap.member_count, 30);

    let first = train_model(&mut conn, &cfg(), SCHEMA, &snap.snapshot_id, &[2, 3, 4]).unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.k, 3);
    assert_eq!(first.centroids.iter().map(|c| c.member_count).sum::<usize>(), 30);
    let mut labels = first.labels();
    labels.sort();
    labels.dedup();
    assert_eq!(labels.len(), 3);

    let second = train_model(&mut conn, &cfg(), SCHEMA, &snap.snapshot_id, &[2, 3, 4]).unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(active_model_version(&conn, SCHEMA).unwrap(), Some(2));
    assert_eq!(load_model(&conn, 1).unwrap().unwrap(), first);
    assert_eq!(list_models(&conn, SCHEMA).unwrap().len(), 2);
}

#[test]
fn fitting_is_deterministic_for_a_snapshot_and_seed() {
    let mut conn = seeded_store();
    let snap = create_snapshot(&mut conn, SCHEMA).unwrap();
    let snapshot = load_snapshot(&conn, &snap.snapshot_id).unwrap().unwrap();
    let a = fit_persona_model(&snapshot, None, &cfg(), &[2, 3, 4]).unwrap();
    let b = fit_persona_model(&snapshot, None, &cfg(), &[4, 3, 2]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn same_population_reuses_the_snapshot() {
    let mut conn = seeded_store();
    let a = create_snapshot(&mut conn, SCHEMA).unwrap();
    let b = create_snapshot(&mut conn, SCHEMA).unwrap();
    assert_eq!(a, b);
    upsert_vector(&mut conn, &vector("late-joiner", 700.0, 1.0), None).unwrap();
    let c = create_snapshot(&mut conn, SCHEMA).unwrap();
    assert_ne!(a.snapshot_id, c.snapshot_id);
    assert_eq!(c.member_count, 31);
}

#[test]
fn undersized_snapshot_fails_and_keeps_active_model() {
    let mut conn = seeded_store();
    let snap = create_snapshot(&mut conn, SCHEMA).unwrap();
    train_model(&mut conn, &cfg(), SCHEMA, &snap.snapshot_id, &[3]).unwrap();

    let strict = PipelineConfig {
        min_snapshot_size: 100,
        ..cfg()
    };
    let err = train_model(&mut conn, &strict, SCHEMA, &snap.snapshot_id, &[3]).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Training(TrainingError::InsufficientSnapshot {
            found: 30,
            required: 100
        })
    ));
    assert_eq!(active_model_version(&conn, SCHEMA).unwrap(), Some(1));
    assert!(load_model(&conn, 2).unwrap().is_none());
}

#[test]
fn identical_vectors_are_degenerate() {
    let mut conn = open_in_memory().unwrap();
    for i in 0..25 {
        upsert_vector(&mut conn, &vector(&format!("p{i:02}"), 500.0, 1.0), None).unwrap();
    }
    let snap = create_snapshot(&mut conn, SCHEMA).unwrap();
    let err = train_model(&mut conn, &cfg(), SCHEMA, &snap.snapshot_id, &[2, 3]).unwrap_err();
    assert_eq!(err.reason_code(), "DEGENERATE_CLUSTERING");
    assert_eq!(active_model_version(&conn, SCHEMA).unwrap(), None);
}

#[test]
fn unknown_snapshot_and_held_lock_are_reported() {
    let mut conn = seeded_store();
    let err = train_model(&mut conn, &cfg(), SCHEMA, "snap-missing", &[3]).unwrap_err();
    assert_eq!(err.reason_code(), "SNAPSHOT_NOT_FOUND");

    let snap = create_snapshot(&mut conn, SCHEMA).unwrap();
    let now_ms = chrono::Utc::now().timestamp_millis();
    acquire_training_lock(&mut conn, SCHEMA, "other-trainer", 3600, now_ms).unwrap();
    let err = train_model(&mut conn, &cfg(), SCHEMA, &snap.snapshot_id, &[3]).unwrap_err();
    assert_eq!(err.reason_code(), "TRAINING_LOCK_HELD");
    assert_eq!(active_model_version(&conn, SCHEMA).unwrap(), None);
}

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use persona_pipeline::config::PipelineConfig;
use persona_pipeline::error::PipelineError;
use persona_pipeline::features::{ClipRange, FeatureSchema, Window};
use persona_pipeline::jobs::validate_batch_job;
use persona_pipeline::model_registry::publish_model;
use persona_pipeline::persona_model::{Centroid, FeatureScaler, PersonaModel};
use persona_pipeline::pipeline::{RunRequest, RunStage, RunStatus, load_run, run_pipeline};
use persona_pipeline::riot_match::parse_match_json;
use persona_pipeline::store::{count_facts, open_in_memory};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn request(run_key: &str, model_version: Option<i64>) -> RunRequest {
    request_from(
        run_key,
        model_version,
        &["riot_match_sample.json", "riot_match_followup.json"],
    )
}

fn request_from(run_key: &str, model_version: Option<i64>, fixtures: &[&str]) -> RunRequest {
    let rows = fixtures
        .iter()
        .flat_map(|name| parse_match_json(&read_fixture(name)).unwrap())
        .collect();
    RunRequest {
        run_key: run_key.to_string(),
        rows,
        window: Window::from_dates("2024-06-01", "2024-07-01").unwrap(),
        schema: FeatureSchema::default_lol(),
        model_version,
    }
}

/// One centroid at the population origin for every default feature.
fn flat_model() -> PersonaModel {
    let schema = FeatureSchema::default_lol();
    let n = schema.features.len();
    PersonaModel {
        version: 0,
        schema_version: schema.version.clone(),
        feature_names: schema.feature_names(),
        scalers: vec![
            FeatureScaler {
                mean: 0.0,
                scale: 1.0,
            };
            n
        ],
        clip: vec![
            ClipRange {
                low: f64::MIN,
                high: f64::MAX,
            };
            n
        ],
        centroids: vec![Centroid {
            cluster_id: 0,
            label: "generalist".to_string(),
            values: vec![0.0; n],
            member_count: 10,
            spread: 1.0,
        }],
        snapshot_id: "snap-manual".to_string(),
        k: 1,
        validation_score: 0.0,
        seed: 0,
        published_at: String::new(),
    }
}

#[test]
fn run_without_model_stops_after_features() {
    let mut conn = open_in_memory().unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = PipelineConfig::default();
    let report = run_pipeline(&mut conn, &cfg, &request("run-1", None), &cancel).unwrap();

    assert_eq!(report.rows_received, 5);
    let validation = report.validation.as_ref().unwrap();
    assert_eq!(validation.accepted, 3);
    assert_eq!(validation.reason_counts.get("INVALID_RANGE"), Some(&1));
    let build = report.build.as_ref().unwrap();
    assert_eq!(build.built.len(), 2);
    assert_eq!(report.model_version, None);
    assert!(report.assignments.is_empty());

    let record = load_run(&conn, "run-1").unwrap().unwrap();
    assert_eq!(record.status(), RunStatus::At(RunStage::Persisted));
}

#[test]
fn completed_run_returns_its_stored_report() {
    let mut conn = open_in_memory().unwrap();
    publish_model(&mut conn, flat_model()).unwrap();
    let cfg = PipelineConfig::default();
    let cancel = AtomicBool::new(false);

    let first = run_pipeline(&mut conn, &cfg, &request("run-1", None), &cancel).unwrap();
    assert_eq!(first.model_version, Some(1));
    assert_eq!(first.persisted, 2);
    assert!(first.assignments.iter().all(|a| a.persona_label == "generalist"));

    let again = run_pipeline(&mut conn, &cfg, &request("run-1", None), &cancel).unwrap();
    assert_eq!(again, first);
    assert_eq!(count_facts(&conn).unwrap(), 3);
}

#[test]
fn failed_run_resumes_at_the_failed_stage() {
    let mut conn = open_in_memory().unwrap();
    let cfg = PipelineConfig::default();
    let cancel = AtomicBool::new(false);

    // Version 1 does not exist yet, so applying it fails.
    let err = run_pipeline(&mut conn, &cfg, &request("run-2", Some(1)), &cancel).unwrap_err();
    assert_eq!(err.reason_code(), "MODEL_NOT_FOUND");
    let record = load_run(&conn, "run-2").unwrap().unwrap();
    assert_eq!(record.stage, Some(RunStage::FeaturesBuilt));
    assert!(matches!(
        record.status(),
        RunStatus::Failed {
            stage: RunStage::ModelApplied,
            ..
        }
    ));

    publish_model(&mut conn, flat_model()).unwrap();
    let report = run_pipeline(&mut conn, &cfg, &request("run-2", Some(1)), &cancel).unwrap();
    assert_eq!(report.persisted, 2);
    assert_eq!(report.validation.as_ref().unwrap().accepted, 3);
    assert_eq!(count_facts(&conn).unwrap(), 3);
}

#[test]
fn cancelled_run_keeps_progress_and_resumes() {
    let mut conn = open_in_memory().unwrap();
    let cfg = PipelineConfig::default();
    let cancel = AtomicBool::new(true);

    let err = run_pipeline(&mut conn, &cfg, &request("run-3", None), &cancel).unwrap_err();
    assert!(matches!(err, PipelineError::Aborted { .. }));
    assert!(load_run(&conn, "run-3").unwrap().is_none());

    let cancel = AtomicBool::new(false);
    let report = run_pipeline(&mut conn, &cfg, &request("run-3", None), &cancel).unwrap();
    assert_eq!(report.build.as_ref().unwrap().built.len(), 2);
}

#[test]
fn validation_job_replays_by_run_key() {
    let mut conn = open_in_memory().unwrap();
    let rows = parse_match_json(&read_fixture("riot_match_sample.json")).unwrap();
    let first = validate_batch_job(&mut conn, "batch-1", rows.clone()).unwrap();
    let second = validate_batch_job(&mut conn, "batch-1", rows.clone()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.newly_stored, 2);

    let other_key = validate_batch_job(&mut conn, "batch-2", rows).unwrap();
    assert_eq!(other_key.newly_stored, 0);
    assert_eq!(other_key.already_ingested, 2);
}

#[test]
fn assignments_track_the_vector_revision() {
    let mut conn = open_in_memory().unwrap();
    publish_model(&mut conn, flat_model()).unwrap();
    let cfg = PipelineConfig::default();
    let cancel = AtomicBool::new(false);

    let early = request_from("run-4", None, &["riot_match_sample.json"]);
    let report = run_pipeline(&mut conn, &cfg, &early, &cancel).unwrap();
    let revisions = |report: &persona_pipeline::pipeline::PipelineReport| {
        report
            .assignments
            .iter()
            .map(|a| (a.player_id.clone(), a.feature_revision))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        revisions(&report),
        vec![("p-alpha".to_string(), 1), ("p-bravo".to_string(), 1)]
    );

    let late = request("run-5", None);
    let report = run_pipeline(&mut conn, &cfg, &late, &cancel).unwrap();
    assert_eq!(
        revisions(&report),
        vec![("p-alpha".to_string(), 2), ("p-bravo".to_string(), 1)]
    );
}

#[test]
fn backfill_run_assigns_the_window_it_built() {
    let mut conn = open_in_memory().unwrap();
    publish_model(&mut conn, flat_model()).unwrap();
    let cfg = PipelineConfig::default();
    let cancel = AtomicBool::new(false);

    let month = request("run-6", None);
    run_pipeline(&mut conn, &cfg, &month, &cancel).unwrap();

    let mut first_day = request_from("run-7", None, &["riot_match_sample.json"]);
    first_day.window = Window::from_dates("2024-06-01", "2024-06-02").unwrap();
    let report = run_pipeline(&mut conn, &cfg, &first_day, &cancel).unwrap();
    assert_eq!(report.assignments.len(), 2);
    assert!(report.assignments.iter().all(|a| a.window == first_day.window));
    assert!(report.assignment_failures.is_empty());
}

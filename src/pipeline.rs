use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{AssignError, PipelineError, PipelineResult};
use crate::facts::RawFactRow;
use crate::feature_store::load_vector;
use crate::features::{FeatureSchema, Window};
use crate::jobs::{BuildReport, UnitFailure, ValidationReport, build_features_job, validate_batch_job};
use crate::model_registry::{active_model_version, load_model};
use crate::persona_assigner::{PersonaAssignment, assign_many, save_assignment};
use crate::store::now_rfc3339;
use crate::workers::{build_pool, with_pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    Ingested,
    Validated,
    FeaturesBuilt,
    ModelApplied,
    Persisted,
}

impl RunStage {
    pub const ORDER: [RunStage; 5] = [
        RunStage::Ingested,
        RunStage::Validated,
        RunStage::FeaturesBuilt,
        RunStage::ModelApplied,
        RunStage::Persisted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Ingested => "INGESTED",
            RunStage::Validated => "VALIDATED",
            RunStage::FeaturesBuilt => "FEATURES_BUILT",
            RunStage::ModelApplied => "MODEL_APPLIED",
            RunStage::Persisted => "PERSISTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|s| s.as_str() == raw)
    }

    pub fn next(self) -> Option<Self> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run stands. `Failed` names the stage that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    At(RunStage),
    Failed { stage: RunStage, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_key: String,
    pub rows_received: usize,
    pub validation: Option<ValidationReport>,
    pub build: Option<BuildReport>,
    pub model_version: Option<i64>,
    pub assignments: Vec<PersonaAssignment>,
    pub assignment_failures: Vec<UnitFailure>,
    pub persisted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_key: String,
    /// Last completed stage, if any.
    pub stage: Option<RunStage>,
    pub failed_stage: Option<RunStage>,
    pub failure_reason: Option<String>,
    pub model_version: Option<i64>,
    pub report: PipelineReport,
    pub updated_at: String,
}

impl RunRecord {
    pub fn status(&self) -> RunStatus {
        match (self.failed_stage, self.stage) {
            (Some(stage), _) => RunStatus::Failed {
                stage,
                reason: self.failure_reason.clone().unwrap_or_default(),
            },
            (None, Some(stage)) => RunStatus::At(stage),
            (None, None) => RunStatus::Pending,
        }
    }

    fn next_stage(&self) -> Option<RunStage> {
        match self.stage {
            None => Some(RunStage::Ingested),
            Some(stage) => stage.next(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_key: String,
    pub rows: Vec<RawFactRow>,
    pub window: Window,
    pub schema: FeatureSchema,
    /// Model to apply; the schema's active model when `None`.
    pub model_version: Option<i64>,
}

pub fn load_run(conn: &Connection, run_key: &str) -> anyhow::Result<Option<RunRecord>> {
    let row = conn
        .query_row(
            "SELECT run_key, stage, failed_stage, failure_reason, model_version, report_json, updated_at
             FROM pipeline_runs WHERE run_key = ?1",
            params![run_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()
        .context("query pipeline run")?;
    let Some((run_key, stage, failed_stage, failure_reason, model_version, report_json, updated_at)) =
        row
    else {
        return Ok(None);
    };
    let report = serde_json::from_str(&report_json).context("decode pipeline report")?;
    Ok(Some(RunRecord {
        stage: RunStage::parse(&stage),
        failed_stage: failed_stage.as_deref().and_then(RunStage::parse),
        run_key,
        failure_reason,
        model_version,
        report,
        updated_at,
    }))
}

fn save_run(conn: &Connection, record: &RunRecord) -> anyhow::Result<()> {
    let report_json = serde_json::to_string(&record.report).context("serialize pipeline report")?;
    conn.execute(
        r#"
        INSERT INTO pipeline_runs (
            run_key, stage, failed_stage, failure_reason, model_version, report_json, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(run_key) DO UPDATE SET
            stage = excluded.stage,
            failed_stage = excluded.failed_stage,
            failure_reason = excluded.failure_reason,
            model_version = excluded.model_version,
            report_json = excluded.report_json,
            updated_at = excluded.updated_at
        "#,
        params![
            record.run_key,
            record.stage.map(RunStage::as_str).unwrap_or("PENDING"),
            record.failed_stage.map(RunStage::as_str),
            record.failure_reason,
            record.model_version,
            report_json,
            now_rfc3339(),
        ],
    )
    .context("write pipeline run")?;
    Ok(())
}

/// Drives one run through every stage, persisting progress after each.
///
/// A run that already reached `PERSISTED` returns its stored report. A
/// failed or aborted run picks up at the first stage it did not complete.
/// `cancel` is checked before each stage.
pub fn run_pipeline(
    conn: &mut Connection,
    cfg: &PipelineConfig,
    req: &RunRequest,
    cancel: &AtomicBool,
) -> PipelineResult<PipelineReport> {
    let mut record = match load_run(conn, &req.run_key)? {
        Some(existing) => existing,
        None => RunRecord {
            run_key: req.run_key.clone(),
            stage: None,
            failed_stage: None,
            failure_reason: None,
            model_version: None,
            report: PipelineReport {
                run_key: req.run_key.clone(),
                ..Default::default()
            },
            updated_at: String::new(),
        },
    };
    if let RunStatus::Failed { stage, reason } = record.status() {
        info!(run_key = %req.run_key, stage = %stage, reason = %reason, "resuming failed run");
    }

    while let Some(stage) = record.next_stage() {
        if cancel.load(Ordering::SeqCst) {
            let at = record.stage.map(RunStage::as_str).unwrap_or("PENDING");
            warn!(run_key = %req.run_key, stage = at, "run aborted");
            return Err(PipelineError::Aborted {
                run_key: req.run_key.clone(),
                stage: at.to_string(),
            });
        }
        match run_stage(conn, cfg, req, &mut record, stage) {
            Ok(()) => {
                record.stage = Some(stage);
                record.failed_stage = None;
                record.failure_reason = None;
                save_run(conn, &record)?;
                info!(run_key = %req.run_key, stage = %stage, "stage completed");
            }
            Err(err) => {
                record.failed_stage = Some(stage);
                record.failure_reason = Some(format!("{}: {err}", err.reason_code()));
                save_run(conn, &record)?;
                warn!(
                    run_key = %req.run_key,
                    stage = %stage,
                    reason_code = err.reason_code(),
                    error = %err,
                    "stage failed"
                );
                return Err(err);
            }
        }
    }
    Ok(record.report)
}

fn run_stage(
    conn: &mut Connection,
    cfg: &PipelineConfig,
    req: &RunRequest,
    record: &mut RunRecord,
    stage: RunStage,
) -> PipelineResult<()> {
    let run_key = &req.run_key;
    match stage {
        RunStage::Ingested => {
            record.report.rows_received = req.rows.len();
        }
        RunStage::Validated => {
            let report = validate_batch_job(conn, &format!("{run_key}/validate"), req.rows.clone())?;
            record.report.validation = Some(report);
        }
        RunStage::FeaturesBuilt => {
            let players = req
                .rows
                .iter()
                .filter_map(|r| r.player_id.clone())
                .filter(|p| !p.trim().is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();
            if players.is_empty() {
                record.report.build = Some(BuildReport {
                    window: Some(req.window),
                    schema_version: req.schema.version.clone(),
                    ..Default::default()
                });
                return Ok(());
            }
            let report = build_features_job(
                conn,
                &format!("{run_key}/features"),
                &players,
                req.window,
                &req.schema,
                cfg.parallelism,
            )?;
            record.report.build = Some(report);
        }
        RunStage::ModelApplied => apply_model(conn, cfg, req, record)?,
        RunStage::Persisted => {
            let mut persisted = Vec::with_capacity(record.report.assignments.len());
            for assignment in std::mem::take(&mut record.report.assignments) {
                persisted.push(save_assignment(conn, assignment)?);
            }
            record.report.persisted = persisted.len();
            record.report.assignments = persisted;
        }
    }
    Ok(())
}

fn apply_model(
    conn: &Connection,
    cfg: &PipelineConfig,
    req: &RunRequest,
    record: &mut RunRecord,
) -> PipelineResult<()> {
    // The version is pinned on first use so a resumed run applies the same model.
    let version = match record.model_version.or(req.model_version) {
        Some(v) => Some(v),
        None => active_model_version(conn, &req.schema.version)?,
    };
    let Some(version) = version else {
        info!(
            run_key = %req.run_key,
            schema_version = %req.schema.version,
            "no published model; skipping assignment"
        );
        return Ok(());
    };
    record.model_version = Some(version);
    record.report.model_version = Some(version);

    let model = load_model(conn, version)?.ok_or(AssignError::ModelNotFound(version))?;
    if model.schema_version != req.schema.version {
        return Err(AssignError::SchemaMismatch {
            vector: req.schema.version.clone(),
            model: model.schema_version,
        }
        .into());
    }

    let players = record
        .report
        .build
        .as_ref()
        .map(|b| b.built.iter().map(|e| e.player_id.clone()).collect::<Vec<_>>())
        .unwrap_or_default();
    let mut vectors = Vec::with_capacity(players.len());
    let mut failures = Vec::new();
    for player_id in players {
        match load_vector(conn, &player_id, &req.window, &model.schema_version)? {
            Some(stored) => vectors.push(stored),
            None => failures.push(UnitFailure {
                reason_code: "FEATURE_VECTOR_NOT_FOUND".to_string(),
                detail: format!("no vector for {player_id} in {}", req.window),
                player_id,
            }),
        }
    }

    let assigned_at = now_rfc3339();
    let pool = build_pool(cfg.parallelism);
    let results = with_pool(&pool, || {
        assign_many(&vectors, &model, cfg.low_confidence_multiple, &assigned_at)
    });
    let mut assignments = Vec::with_capacity(results.len());
    for (player_id, result) in results {
        match result {
            Ok(a) => assignments.push(a),
            Err(err) => failures.push(UnitFailure {
                player_id,
                reason_code: err.reason_code().to_string(),
                detail: err.to_string(),
            }),
        }
    }
    record.report.assignments = assignments;
    record.report.assignment_failures = failures;
    Ok(())
}

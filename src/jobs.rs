use std::collections::BTreeMap;

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::facts::RawFactRow;
use crate::feature_store::{UpsertOutcome, load_state, register_schema, upsert_vector};
use crate::features::{FeatureSchema, UnitInput, UnitOutcome, Window, build_units};
use crate::persona_assigner::{PersonaAssignment, assign_persona};
use crate::persona_trainer::train_model;
use crate::quality_gate::{FactLedger, validate_batch};
use crate::store::{load_player_facts, now_rfc3339, persist_gate_outcome, players_in_window};
use crate::workers::{build_pool, with_pool};

pub const JOB_VALIDATE: &str = "validate_batch";
pub const JOB_BUILD_FEATURES: &str = "build_features";
pub const JOB_TRAIN: &str = "train_model";
pub const JOB_ASSIGN: &str = "assign_persona";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub run_key: String,
    pub job: String,
    pub status: JobStatus,
    pub output_json: Option<String>,
    pub error_code: Option<String>,
    pub updated_at: String,
}

pub fn load_job(conn: &Connection, run_key: &str) -> anyhow::Result<Option<JobRecord>> {
    let row = conn
        .query_row(
            "SELECT run_key, job, status, output_json, error_code, updated_at
             FROM job_runs WHERE run_key = ?1",
            params![run_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .context("query job run")?;
    row.map(|(run_key, job, status, output_json, error_code, updated_at)| {
        let status = JobStatus::parse(&status)
            .with_context(|| format!("job run {run_key} has unknown status {status}"))?;
        Ok(JobRecord {
            run_key,
            job,
            status,
            output_json,
            error_code,
            updated_at,
        })
    })
    .transpose()
}

fn write_job(
    conn: &Connection,
    run_key: &str,
    job: &str,
    status: JobStatus,
    output_json: Option<&str>,
    error_code: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO job_runs(run_key, job, status, output_json, error_code, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(run_key) DO UPDATE SET
            status = excluded.status,
            output_json = excluded.output_json,
            error_code = excluded.error_code,
            updated_at = excluded.updated_at",
        params![run_key, job, status.as_str(), output_json, error_code, now_rfc3339()],
    )
    .context("write job run")?;
    Ok(())
}

/// Runs `action` at most once to success under `run_key`. Failed runs are
/// retried; a run key that belongs to a different job is refused.
pub fn run_job<T, F>(conn: &mut Connection, run_key: &str, job: &str, action: F) -> PipelineResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut Connection) -> PipelineResult<T>,
{
    if let Some(existing) = load_job(conn, run_key)? {
        if existing.job != job {
            return Err(PipelineError::RunKeyReused {
                run_key: run_key.to_string(),
                existing_job: existing.job,
            });
        }
        if existing.status == JobStatus::Succeeded
            && let Some(output) = existing.output_json.as_deref()
        {
            info!(run_key, job, "job already completed; returning stored output");
            let stored = serde_json::from_str(output).context("decode stored job output")?;
            return Ok(stored);
        }
    }

    write_job(conn, run_key, job, JobStatus::Running, None, None)?;
    match action(conn) {
        Ok(output) => {
            let json = serde_json::to_string(&output).context("serialize job output")?;
            write_job(conn, run_key, job, JobStatus::Succeeded, Some(&json), None)?;
            Ok(output)
        }
        Err(err) => {
            let code = err.reason_code();
            warn!(run_key, job, reason_code = code, error = %err, "job failed");
            write_job(conn, run_key, job, JobStatus::Failed, None, Some(code))?;
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub match_id: Option<String>,
    pub player_id: Option<String>,
    pub reason_code: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub received: usize,
    pub accepted: usize,
    pub newly_stored: usize,
    pub already_ingested: usize,
    pub quarantined: Vec<QuarantineEntry>,
    pub reason_counts: BTreeMap<String, usize>,
}

pub fn validate_batch_job(
    conn: &mut Connection,
    run_key: &str,
    rows: Vec<RawFactRow>,
) -> PipelineResult<ValidationReport> {
    run_job(conn, run_key, JOB_VALIDATE, |conn| {
        let received = rows.len();
        // Gate and insert share one write transaction so another batch cannot
        // store a different version of a key in between.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin validation transaction")?;
        let mut outcome = validate_batch(rows, &*tx as &dyn FactLedger)?;
        let newly_stored = persist_gate_outcome(&tx, &mut outcome, Some(run_key))?;
        tx.commit().context("commit validation transaction")?;

        let reason_counts = outcome
            .reason_counts()
            .into_iter()
            .map(|(reason, n)| (reason.code().to_string(), n))
            .collect::<BTreeMap<_, _>>();
        let quarantined = outcome
            .quarantined
            .iter()
            .map(|q| QuarantineEntry {
                match_id: q.row.match_id.clone(),
                player_id: q.row.player_id.clone(),
                reason_code: q.reason.code().to_string(),
                detail: q.detail.clone(),
            })
            .collect::<Vec<_>>();
        info!(
            run_key,
            received,
            accepted = outcome.accepted.len(),
            newly_stored,
            quarantined = quarantined.len(),
            "batch validated"
        );
        Ok(ValidationReport {
            received,
            accepted: outcome.accepted.len(),
            newly_stored,
            already_ingested: outcome.already_ingested,
            quarantined,
            reason_counts,
        })
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltEntry {
    pub player_id: String,
    pub outcome: UpsertOutcome,
    pub match_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub player_id: String,
    pub reason_code: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub window: Option<Window>,
    pub schema_version: String,
    pub built: Vec<BuiltEntry>,
    /// Players with no qualifying match in the window.
    pub absent: Vec<String>,
    pub failed: Vec<UnitFailure>,
}

/// An empty `player_ids` builds every player with a fact in the window.
pub fn build_features_job(
    conn: &mut Connection,
    run_key: &str,
    player_ids: &[String],
    window: Window,
    schema: &FeatureSchema,
    parallelism: usize,
) -> PipelineResult<BuildReport> {
    run_job(conn, run_key, JOB_BUILD_FEATURES, |conn| {
        build_features(conn, player_ids, window, schema, parallelism)
    })
}

pub fn build_features(
    conn: &mut Connection,
    player_ids: &[String],
    window: Window,
    schema: &FeatureSchema,
    parallelism: usize,
) -> PipelineResult<BuildReport> {
    register_schema(conn, schema)?;
    let players = if player_ids.is_empty() {
        players_in_window(conn, &window)?
    } else {
        let mut ids = player_ids.to_vec();
        ids.sort();
        ids.dedup();
        ids
    };

    let mut inputs = Vec::with_capacity(players.len());
    for player_id in &players {
        let prior = load_state(conn, player_id, &window, &schema.version)?;
        let mut facts = load_player_facts(conn, player_id, &window)?;
        if let Some(prior) = prior.as_ref() {
            facts.retain(|f| !prior.match_ids.contains(&f.match_id));
        }
        inputs.push(UnitInput {
            player_id: player_id.clone(),
            prior,
            facts,
        });
    }

    let pool = build_pool(parallelism);
    let outcomes = with_pool(&pool, || build_units(&inputs, window, schema));

    let mut report = BuildReport {
        window: Some(window),
        schema_version: schema.version.clone(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            UnitOutcome::Built { vector, state } => {
                let upserted = upsert_vector(conn, &vector, Some(&state))?;
                report.built.push(BuiltEntry {
                    player_id: vector.player_id.clone(),
                    outcome: upserted,
                    match_count: vector.match_count,
                });
            }
            UnitOutcome::Absent { player_id } => report.absent.push(player_id),
            UnitOutcome::Failed { player_id, error } => report.failed.push(UnitFailure {
                player_id,
                reason_code: error.reason_code().to_string(),
                detail: error.to_string(),
            }),
        }
    }
    info!(
        window = %window,
        schema_version = %schema.version,
        built = report.built.len(),
        absent = report.absent.len(),
        failed = report.failed.len(),
        "features built"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub model_version: i64,
    pub schema_version: String,
    pub snapshot_id: String,
    pub k: usize,
    pub validation_score: f64,
    pub labels: Vec<String>,
}

pub fn train_model_job(
    conn: &mut Connection,
    run_key: &str,
    cfg: &PipelineConfig,
    schema_version: &str,
    snapshot_id: &str,
    candidate_k: &[usize],
) -> PipelineResult<TrainReport> {
    run_job(conn, run_key, JOB_TRAIN, |conn| {
        let model = train_model(conn, cfg, schema_version, snapshot_id, candidate_k)?;
        Ok(TrainReport {
            model_version: model.version,
            schema_version: model.schema_version.clone(),
            snapshot_id: model.snapshot_id.clone(),
            k: model.k,
            validation_score: model.validation_score,
            labels: model.labels().into_iter().map(str::to_string).collect(),
        })
    })
}

pub fn assign_persona_job(
    conn: &mut Connection,
    run_key: &str,
    cfg: &PipelineConfig,
    player_id: &str,
    model_version: i64,
) -> PipelineResult<PersonaAssignment> {
    run_job(conn, run_key, JOB_ASSIGN, |conn| {
        assign_persona(conn, player_id, model_version, cfg.low_confidence_multiple)
    })
}

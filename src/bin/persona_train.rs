use std::path::PathBuf;

use anyhow::{Context, Result};

use persona_pipeline::{config, jobs, snapshot, store, telemetry};

fn main() -> Result<()> {
    telemetry::init_tracing();
    let cfg = config::global();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let run_key = arg_value(&args, "--run-key").context("missing --run-key")?;
    let db_path = match arg_value(&args, "--db") {
        Some(path) => PathBuf::from(path),
        None => cfg.resolved_db_path()?,
    };
    let schema_version = match arg_value(&args, "--schema") {
        Some(version) => version,
        None => cfg.feature_schema()?.version,
    };
    let candidate_k = match arg_value(&args, "--k") {
        Some(raw) => raw
            .split(',')
            .map(|k| k.trim().parse::<usize>().with_context(|| format!("invalid k `{k}`")))
            .collect::<Result<Vec<_>>>()?,
        None => cfg.candidate_k.clone(),
    };

    let mut conn = store::open_db(&db_path)?;
    let snapshot_id = match arg_value(&args, "--snapshot") {
        Some(id) => id,
        None => snapshot::create_snapshot(&mut conn, &schema_version)?.snapshot_id,
    };
    let report = jobs::train_model_job(
        &mut conn,
        &run_key,
        cfg,
        &schema_version,
        &snapshot_id,
        &candidate_k,
    )?;

    println!("Training complete");
    println!("Model version: {}", report.model_version);
    println!("Snapshot: {}", report.snapshot_id);
    println!("k = {} (score {:.3})", report.k, report.validation_score);
    for (idx, label) in report.labels.iter().enumerate() {
        println!(" - cluster {idx}: {label}");
    }
    Ok(())
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}

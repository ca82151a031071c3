use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};

use persona_pipeline::features::Window;
use persona_pipeline::pipeline::{self, RunRequest};
use persona_pipeline::{config, fact_source, store, telemetry};

fn main() -> Result<()> {
    telemetry::init_tracing();
    let cfg = config::global();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let run_key = arg_value(&args, "--run-key").context("missing --run-key")?;
    let input = arg_value(&args, "--input")
        .map(PathBuf::from)
        .context("missing --input <dir|file.json|file.parquet>")?;
    let start = arg_value(&args, "--start").context("missing --start YYYY-MM-DD")?;
    let end = arg_value(&args, "--end").context("missing --end YYYY-MM-DD")?;
    let model_version = arg_value(&args, "--model-version")
        .map(|raw| raw.parse::<i64>().context("invalid --model-version"))
        .transpose()?;
    let db_path = match arg_value(&args, "--db") {
        Some(path) => PathBuf::from(path),
        None => cfg.resolved_db_path()?,
    };

    let req = RunRequest {
        run_key,
        rows: fact_source::load_raw_rows(&input)?,
        window: Window::from_dates(&start, &end)?,
        schema: cfg.feature_schema()?,
        model_version,
    };
    let mut conn = store::open_db(&db_path)?;
    let cancel = AtomicBool::new(false);
    let report = pipeline::run_pipeline(&mut conn, cfg, &req, &cancel)?;

    println!("Run {} complete", report.run_key);
    println!("Rows received: {}", report.rows_received);
    if let Some(v) = report.validation.as_ref() {
        println!("Accepted: {}  Quarantined: {}", v.accepted, v.quarantined.len());
    }
    if let Some(b) = report.build.as_ref() {
        println!(
            "Vectors built: {}  absent: {}  failed: {}",
            b.built.len(),
            b.absent.len(),
            b.failed.len()
        );
    }
    match report.model_version {
        Some(version) => println!(
            "Model v{version}: {} assignments persisted, {} failed",
            report.persisted,
            report.assignment_failures.len()
        ),
        None => println!("No published model; assignment skipped"),
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

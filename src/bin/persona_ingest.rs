use std::path::PathBuf;

use anyhow::{Context, Result};

use persona_pipeline::{config, fact_source, jobs, store, telemetry};

fn main() -> Result<()> {
    telemetry::init_tracing();
    let cfg = config::global();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let input = arg_value(&args, "--input")
        .map(PathBuf::from)
        .context("missing --input <dir|file.json|file.parquet>")?;
    let run_key = arg_value(&args, "--run-key").context("missing --run-key")?;
    let db_path = match arg_value(&args, "--db") {
        Some(path) => PathBuf::from(path),
        None => cfg.resolved_db_path()?,
    };

    let rows = fact_source::load_raw_rows(&input)?;
    let mut conn = store::open_db(&db_path)?;
    let report = jobs::validate_batch_job(&mut conn, &run_key, rows)?;

    println!("Ingest complete");
    println!("DB: {}", db_path.display());
    println!("Rows received: {}", report.received);
    println!(
        "Accepted: {} (new {}, already stored {})",
        report.accepted, report.newly_stored, report.already_ingested
    );
    println!("Quarantined: {}", report.quarantined.len());
    for (code, n) in &report.reason_counts {
        println!(" - {code}: {n}");
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

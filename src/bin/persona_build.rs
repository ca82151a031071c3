use std::path::PathBuf;

use anyhow::{Context, Result};

use persona_pipeline::features::Window;
use persona_pipeline::{config, jobs, store, telemetry};

fn main() -> Result<()> {
    telemetry::init_tracing();
    let cfg = config::global();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let run_key = arg_value(&args, "--run-key").context("missing --run-key")?;
    let start = arg_value(&args, "--start").context("missing --start YYYY-MM-DD")?;
    let end = arg_value(&args, "--end").context("missing --end YYYY-MM-DD")?;
    let window = Window::from_dates(&start, &end)?;
    let players = arg_value(&args, "--players")
        .map(|raw| {
            raw.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let db_path = match arg_value(&args, "--db") {
        Some(path) => PathBuf::from(path),
        None => cfg.resolved_db_path()?,
    };
    let schema = cfg.feature_schema()?;

    let mut conn = store::open_db(&db_path)?;
    let report =
        jobs::build_features_job(&mut conn, &run_key, &players, window, &schema, cfg.parallelism)?;

    println!("Feature build complete");
    println!("Window: {window}");
    println!("Schema: {}", report.schema_version);
    println!("Vectors built: {}", report.built.len());
    println!("Players without matches: {}", report.absent.len());
    if !report.failed.is_empty() {
        println!("Failed units: {}", report.failed.len());
        for failure in report.failed.iter().take(8) {
            println!(" - {} [{}] {}", failure.player_id, failure.reason_code, failure.detail);
        }
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

use std::path::PathBuf;

use anyhow::{Context, Result};

use persona_pipeline::{config, jobs, store, telemetry};

fn main() -> Result<()> {
    telemetry::init_tracing();
    let cfg = config::global();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let run_key = arg_value(&args, "--run-key").context("missing --run-key")?;
    let player_id = arg_value(&args, "--player").context("missing --player")?;
    let model_version = arg_value(&args, "--model-version")
        .context("missing --model-version")?
        .parse::<i64>()
        .context("invalid --model-version")?;
    let db_path = match arg_value(&args, "--db") {
        Some(path) => PathBuf::from(path),
        None => cfg.resolved_db_path()?,
    };

    let mut conn = store::open_db(&db_path)?;
    let assignment = jobs::assign_persona_job(&mut conn, &run_key, cfg, &player_id, model_version)?;

    println!("Player: {}", assignment.player_id);
    println!("Model version: {}", assignment.model_version);
    println!("Persona: {}", assignment.persona_label);
    println!(
        "Distance: {:.4} ({} confidence)",
        assignment.distance, assignment.confidence_flag
    );
    println!("Assigned at: {}", assignment.assigned_at);
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

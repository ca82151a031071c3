use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use tracing::{debug, warn};

use crate::facts::{Counter, RawFactRow};
use crate::riot_match;

/// Loads raw fact rows from a directory of match documents, a Parquet
/// player-level export, or a JSON array of rows.
pub fn load_raw_rows(path: &Path) -> Result<Vec<RawFactRow>> {
    if path.is_dir() {
        return riot_match::load_match_dir(path);
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "parquet" => read_parquet_rows(path),
        _ => read_json_rows(path),
    }
}

pub fn read_json_rows(path: &Path) -> Result<Vec<RawFactRow>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str::<Vec<RawFactRow>>(raw.trim())
        .with_context(|| format!("parse raw rows {}", path.display()))
}

pub fn read_parquet_rows(path: &Path) -> Result<Vec<RawFactRow>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file).context("open parquet reader fact rows")?;
    let iter = reader.get_row_iter(None).context("iterate fact rows")?;

    let mut out = Vec::new();
    let mut skipped = 0usize;
    for row in iter {
        let Ok(row) = row else {
            skipped += 1;
            continue;
        };
        let mut fact = RawFactRow::default();
        for (name, field) in row.get_column_iter() {
            apply_column(&mut fact, name, field);
        }
        out.push(fact);
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "unreadable parquet rows skipped");
    }
    debug!(path = %path.display(), rows = out.len(), "parquet fact rows loaded");
    Ok(out)
}

fn apply_column(fact: &mut RawFactRow, name: &str, field: &Field) {
    match name {
        "match_id" => fact.match_id = field_str(field),
        "player_id" | "puuid" => fact.player_id = field_str(field),
        "game_mode" => fact.game_mode = field_str(field),
        "queue_id" => {
            if fact.game_mode.is_none() {
                fact.game_mode = field_i64(field).and_then(mode_for_queue).map(str::to_string);
            }
        }
        "game_creation" | "game_creation_ms" => fact.game_creation_ms = field_i64(field),
        "game_duration" | "duration_secs" => fact.duration_secs = field_f64(field),
        "team_id" => fact.team_id = field_i64(field),
        "role" | "team_position" => {
            if fact.role.is_none() || name == "team_position" {
                fact.role = field_str(field).filter(|s| !s.trim().is_empty());
            }
        }
        "champion_name" => fact.champion_name = field_str(field),
        "win" => fact.win = field_bool(field),
        "kills" => fact.set_counter(Counter::Kills, field_f64(field)),
        "deaths" => fact.set_counter(Counter::Deaths, field_f64(field)),
        "assists" => fact.set_counter(Counter::Assists, field_f64(field)),
        "damage_to_champions" => fact.set_counter(Counter::DamageToChampions, field_f64(field)),
        "damage_to_objectives" => {
            fact.set_counter(Counter::DamageToObjectives, field_f64(field))
        }
        "gold_earned" => fact.set_counter(Counter::GoldEarned, field_f64(field)),
        "cs" | "total_cs" => fact.set_counter(Counter::Cs, field_f64(field)),
        "vision_score" => fact.set_counter(Counter::VisionScore, field_f64(field)),
        "wards_placed" => fact.set_counter(Counter::WardsPlaced, field_f64(field)),
        _ => {}
    }
}

/// Maps the queue ids of the common Summoner's Rift and rotating queues to a mode.
fn mode_for_queue(queue_id: i64) -> Option<&'static str> {
    let mode = match queue_id {
        400 | 420 | 430 | 440 | 490 | 700 => "CLASSIC",
        450 | 100 => "ARAM",
        900 => "ARURF",
        1020 => "ONEFORALL",
        1300 => "NEXUSBLITZ",
        1400 => "ULTBOOK",
        1700 | 1710 => "CHERRY",
        _ => return None,
    };
    Some(mode)
}

fn field_str(field: &Field) -> Option<String> {
    match field {
        Field::Str(s) => Some(s.clone()),
        Field::Null => None,
        other => field_i64(other).map(|n| n.to_string()),
    }
}

fn field_bool(field: &Field) -> Option<bool> {
    match field {
        Field::Bool(b) => Some(*b),
        Field::Str(s) => s.trim().parse::<bool>().ok(),
        other => field_i64(other).map(|n| n != 0),
    }
}

fn field_i64(field: &Field) -> Option<i64> {
    match field {
        Field::Byte(v) => Some(i64::from(*v)),
        Field::Short(v) => Some(i64::from(*v)),
        Field::Int(v) => Some(i64::from(*v)),
        Field::Long(v) => Some(*v),
        Field::UByte(v) => Some(i64::from(*v)),
        Field::UShort(v) => Some(i64::from(*v)),
        Field::UInt(v) => Some(i64::from(*v)),
        Field::ULong(v) => i64::try_from(*v).ok(),
        Field::TimestampMillis(v) => Some(*v),
        Field::Str(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn field_f64(field: &Field) -> Option<f64> {
    match field {
        Field::Float(v) => Some(f64::from(*v)),
        Field::Double(v) => Some(*v),
        Field::Str(s) => s.trim().parse::<f64>().ok(),
        other => field_i64(other).map(|n| n as f64),
    }
}

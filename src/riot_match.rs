use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::warn;

use crate::facts::{Counter, RawFactRow};

/// Converts one match-v5 document into one raw row per participant.
///
/// Missing values become `None` and odd values pass through unchanged; the
/// quality gate decides what to quarantine.
pub fn parse_match_json(raw: &str) -> Result<Vec<RawFactRow>> {
    let value = serde_json::from_str::<Value>(raw.trim()).context("invalid match json")?;
    rows_from_match_value(&value)
}

pub fn rows_from_match_value(value: &Value) -> Result<Vec<RawFactRow>> {
    let info = value.get("info").ok_or_else(|| anyhow!("missing info section"))?;
    let participants = info
        .get("participants")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("missing info.participants array"))?;

    let match_id = value
        .get("metadata")
        .and_then(|m| m.get("matchId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let game_mode = info
        .get("gameMode")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let game_creation_ms = info.get("gameCreation").and_then(as_i64_any);
    let duration_secs = info.get("gameDuration").and_then(as_f64_any).map(|d| {
        // Pre-11.20 payloads report milliseconds and carry no gameEndTimestamp.
        if info.get("gameEndTimestamp").is_none() && d > 100_000.0 {
            d / 1000.0
        } else {
            d
        }
    });

    let mut out = Vec::with_capacity(participants.len());
    for participant in participants {
        out.push(row_from_participant(
            participant,
            match_id.clone(),
            game_mode.clone(),
            game_creation_ms,
            duration_secs,
        ));
    }
    Ok(out)
}

fn row_from_participant(
    p: &Value,
    match_id: Option<String>,
    game_mode: Option<String>,
    game_creation_ms: Option<i64>,
    duration_secs: Option<f64>,
) -> RawFactRow {
    let role = p
        .get("teamPosition")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            p.get("individualPosition")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
        })
        .map(|s| s.to_string())
        .or_else(|| Some("NONE".to_string()));

    let cs = match (
        p.get("totalMinionsKilled").and_then(as_f64_any),
        p.get("neutralMinionsKilled").and_then(as_f64_any),
    ) {
        (None, None) => None,
        (lane, jungle) => Some(lane.unwrap_or(0.0) + jungle.unwrap_or(0.0)),
    };

    let mut row = RawFactRow {
        match_id,
        player_id: p
            .get("puuid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        game_mode,
        game_creation_ms,
        duration_secs,
        team_id: p.get("teamId").and_then(as_i64_any),
        role,
        champion_name: p
            .get("championName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        win: p.get("win").and_then(|v| v.as_bool()),
        ..Default::default()
    };
    row.set_counter(Counter::Kills, p.get("kills").and_then(as_f64_any));
    row.set_counter(Counter::Deaths, p.get("deaths").and_then(as_f64_any));
    row.set_counter(Counter::Assists, p.get("assists").and_then(as_f64_any));
    row.set_counter(
        Counter::DamageToChampions,
        p.get("totalDamageDealtToChampions").and_then(as_f64_any),
    );
    row.set_counter(
        Counter::DamageToObjectives,
        p.get("damageDealtToObjectives").and_then(as_f64_any),
    );
    row.set_counter(Counter::GoldEarned, p.get("goldEarned").and_then(as_f64_any));
    row.set_counter(Counter::Cs, cs);
    row.set_counter(Counter::VisionScore, p.get("visionScore").and_then(as_f64_any));
    row.set_counter(Counter::WardsPlaced, p.get("wardsPlaced").and_then(as_f64_any));
    row
}

/// Reads every `*.json` match document under `dir`, sorted by file name.
/// Unreadable or malformed files are logged and skipped.
pub fn load_match_dir(dir: &Path) -> Result<Vec<RawFactRow>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("read match dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<PathBuf>>();
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable match file");
                continue;
            }
        };
        match parse_match_json(&raw) {
            Ok(rows) => out.extend(rows),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed match file");
            }
        }
    }
    Ok(out)
}

fn as_i64_any(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    v.as_str()?.trim().parse::<i64>().ok()
}

fn as_f64_any(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str()?.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::parse_match_json;

    #[test]
    fn cs_sums_lane_and_jungle_minions() {
        let raw = r#"{
            "metadata": {"matchId": "KR_1"},
            "info": {
                "gameMode": "CLASSIC", "gameDuration": 1800, "gameCreation": 1700000000000,
                "gameEndTimestamp": 1700001800000,
                "participants": [{
                    "puuid": "p1", "teamId": 100, "teamPosition": "", "individualPosition": "JUNGLE",
                    "championName": "LeeSin", "win": true, "kills": 7, "deaths": 2, "assists": 9,
                    "totalMinionsKilled": 30, "neutralMinionsKilled": 140
                }]
            }
        }"#;
        let rows = parse_match_json(raw).expect("match should parse");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cs, Some(170.0));
        assert_eq!(rows[0].role.as_deref(), Some("JUNGLE"));
        assert_eq!(rows[0].gold_earned, None);
    }

    #[test]
    fn legacy_millisecond_durations_are_converted() {
        let raw = r#"{"metadata":{"matchId":"KR_2"},"info":{"gameDuration":1500000,"participants":[{"puuid":"p2"}]}}"#;
        let rows = parse_match_json(raw).expect("legacy match should parse");
        assert_eq!(rows[0].duration_secs, Some(1500.0));
        assert_eq!(rows[0].role.as_deref(), Some("NONE"));
    }

    #[test]
    fn missing_info_is_an_error() {
        assert!(parse_match_json(r#"{"metadata":{}}"#).is_err());
    }
}

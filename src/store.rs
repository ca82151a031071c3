use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;

use crate::error::ValidationReason;
use crate::facts::{COUNTER_COUNT, FactKey, GameMode, MatchFact, RawFactRow, Role};
use crate::features::Window;
use crate::quality_gate::{FactLedger, GateOutcome, QuarantinedRow};

const BUSY_TIMEOUT_SECS: u64 = 5;

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
        .context("set busy timeout")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS match_facts (
            match_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            game_mode TEXT NOT NULL,
            game_creation_ms INTEGER NOT NULL,
            duration_secs INTEGER NOT NULL,
            team_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            champion_name TEXT NOT NULL,
            win INTEGER NOT NULL,
            counters_json TEXT NOT NULL,
            content_digest TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            PRIMARY KEY (match_id, player_id)
        );
        CREATE INDEX IF NOT EXISTS idx_facts_player_time ON match_facts(player_id, game_creation_ms);

        CREATE TABLE IF NOT EXISTS quarantine (
            row_digest TEXT NOT NULL,
            reason_code TEXT NOT NULL,
            match_id TEXT NULL,
            player_id TEXT NULL,
            detail TEXT NOT NULL,
            raw_json TEXT NOT NULL,
            run_key TEXT NULL,
            quarantined_at TEXT NOT NULL,
            PRIMARY KEY (row_digest, reason_code)
        );
        CREATE INDEX IF NOT EXISTS idx_quarantine_reason ON quarantine(reason_code);

        CREATE TABLE IF NOT EXISTS feature_schemas (
            schema_version TEXT PRIMARY KEY,
            definition_json TEXT NOT NULL,
            definition_digest TEXT NOT NULL,
            registered_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feature_vectors (
            player_id TEXT NOT NULL,
            window_start_ms INTEGER NOT NULL,
            window_end_ms INTEGER NOT NULL,
            schema_version TEXT NOT NULL,
            values_json TEXT NOT NULL,
            match_count INTEGER NOT NULL,
            content_digest TEXT NOT NULL,
            state_json TEXT NULL,
            revision INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (player_id, window_start_ms, window_end_ms, schema_version)
        );
        CREATE INDEX IF NOT EXISTS idx_vectors_schema ON feature_vectors(schema_version, player_id);

        CREATE TABLE IF NOT EXISTS feature_snapshots (
            snapshot_id TEXT PRIMARY KEY,
            schema_version TEXT NOT NULL,
            member_count INTEGER NOT NULL,
            taken_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshot_members (
            snapshot_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            window_start_ms INTEGER NOT NULL,
            window_end_ms INTEGER NOT NULL,
            revision INTEGER NOT NULL,
            match_count INTEGER NOT NULL,
            values_json TEXT NOT NULL,
            PRIMARY KEY (snapshot_id, player_id, window_start_ms, window_end_ms)
        );

        CREATE TABLE IF NOT EXISTS persona_models (
            version INTEGER PRIMARY KEY,
            schema_version TEXT NOT NULL,
            snapshot_id TEXT NOT NULL,
            model_json TEXT NOT NULL,
            published_at TEXT NOT NULL
        );
        CREATE TRIGGER IF NOT EXISTS persona_models_immutable
            BEFORE UPDATE ON persona_models
            BEGIN
                SELECT RAISE(ABORT, 'persona models are immutable');
            END;

        CREATE TABLE IF NOT EXISTS active_models (
            schema_version TEXT PRIMARY KEY,
            model_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS training_locks (
            schema_version TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS persona_assignments (
            player_id TEXT NOT NULL,
            model_version INTEGER NOT NULL,
            persona_label TEXT NOT NULL,
            cluster_id INTEGER NOT NULL,
            distance REAL NOT NULL,
            confidence TEXT NOT NULL,
            window_start_ms INTEGER NOT NULL,
            window_end_ms INTEGER NOT NULL,
            feature_revision INTEGER NOT NULL,
            assigned_at TEXT NOT NULL,
            PRIMARY KEY (player_id, model_version)
        );

        CREATE TABLE IF NOT EXISTS job_runs (
            run_key TEXT PRIMARY KEY,
            job TEXT NOT NULL,
            status TEXT NOT NULL,
            output_json TEXT NULL,
            error_code TEXT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_key TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            failed_stage TEXT NULL,
            failure_reason TEXT NULL,
            model_version INTEGER NULL,
            report_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

impl FactLedger for Connection {
    fn fact_digest(&self, key: &FactKey) -> Result<Option<String>> {
        self.query_row(
            "SELECT content_digest FROM match_facts WHERE match_id = ?1 AND player_id = ?2",
            params![key.match_id, key.player_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("query fact digest")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactInsert {
    pub inserted: usize,
    /// Facts whose key is already stored with different content.
    pub conflicts: Vec<MatchFact>,
}

pub fn insert_facts(conn: &mut Connection, facts: &[MatchFact]) -> Result<FactInsert> {
    let tx = conn.transaction().context("begin fact transaction")?;
    let out = store_facts(&tx, facts)?;
    tx.commit().context("commit fact transaction")?;
    Ok(out)
}

/// Inserts facts on an open connection or transaction. A key that is
/// already stored with the same digest is skipped; a different digest is
/// returned as a conflict and nothing is written for it.
pub fn store_facts(conn: &Connection, facts: &[MatchFact]) -> Result<FactInsert> {
    let ingested_at = Utc::now().to_rfc3339();
    let mut out = FactInsert::default();
    for fact in facts {
        let digest = fact.content_digest();
        let counters_json =
            serde_json::to_string(&fact.counters).context("serialize fact counters")?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO match_facts (
                    match_id, player_id, game_mode, game_creation_ms, duration_secs,
                    team_id, role, champion_name, win, counters_json, content_digest, ingested_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(match_id, player_id) DO NOTHING
                "#,
                params![
                    fact.match_id,
                    fact.player_id,
                    fact.game_mode.as_str(),
                    fact.game_creation_ms,
                    i64::from(fact.duration_secs),
                    fact.team_id,
                    fact.role.as_str(),
                    fact.champion_name,
                    bool_to_i64(fact.win),
                    counters_json,
                    digest,
                    ingested_at,
                ],
            )
            .context("insert match fact")?;
        if inserted > 0 {
            out.inserted += inserted;
            continue;
        }
        if conn.fact_digest(&fact.key())?.as_deref() != Some(digest.as_str()) {
            out.conflicts.push(fact.clone());
        }
    }
    Ok(out)
}

/// Stores a gate outcome in one go. Accepted facts that lost a race against
/// a different stored version move to the quarantine as
/// `CONFLICTING_DUPLICATE`. Returns how many facts were newly stored.
pub fn persist_gate_outcome(
    conn: &Connection,
    outcome: &mut GateOutcome,
    run_key: Option<&str>,
) -> Result<usize> {
    let insert = store_facts(conn, &outcome.accepted)?;
    if !insert.conflicts.is_empty() {
        let lost = insert.conflicts.iter().map(MatchFact::key).collect::<HashSet<_>>();
        outcome.accepted.retain(|fact| !lost.contains(&fact.key()));
        for fact in insert.conflicts {
            warn!(
                match_id = %fact.match_id,
                player_id = %fact.player_id,
                "fact conflicts with a concurrently stored version"
            );
            outcome.quarantined.push(QuarantinedRow {
                row: fact.to_raw_row(),
                reason: ValidationReason::ConflictingDuplicate,
                detail: "stored fact has different content".to_string(),
            });
        }
    }
    store_quarantine(conn, &outcome.quarantined, run_key)?;
    Ok(insert.inserted)
}

pub fn load_player_facts(
    conn: &Connection,
    player_id: &str,
    window: &Window,
) -> Result<Vec<MatchFact>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                match_id, player_id, game_mode, game_creation_ms, duration_secs,
                team_id, role, champion_name, win, counters_json
            FROM match_facts
            WHERE player_id = ?1
              AND game_creation_ms >= ?2
              AND game_creation_ms < ?3
            ORDER BY match_id ASC
            "#,
        )
        .context("prepare load facts query")?;

    let rows = stmt
        .query_map(params![player_id, window.start_ms, window.end_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)? != 0,
                row.get::<_, String>(9)?,
            ))
        })
        .context("query load facts")?;

    let mut out = Vec::new();
    for row in rows {
        let (match_id, player_id, mode, created, duration, team_id, role, champion, win, counters) =
            row.context("decode fact row")?;
        let game_mode = GameMode::parse(&mode)
            .ok_or_else(|| anyhow!("stored fact {match_id} has unknown mode {mode}"))?;
        let role = Role::parse(&role)
            .ok_or_else(|| anyhow!("stored fact {match_id} has unknown role {role}"))?;
        let counters: [u64; COUNTER_COUNT] =
            serde_json::from_str(&counters).context("decode fact counters")?;
        out.push(MatchFact {
            match_id,
            player_id,
            game_mode,
            game_creation_ms: created,
            duration_secs: u32::try_from(duration).context("stored duration out of range")?,
            team_id,
            role,
            champion_name: champion,
            win,
            counters,
        });
    }
    Ok(out)
}

/// Distinct players with at least one fact inside `window`.
pub fn players_in_window(conn: &Connection, window: &Window) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT player_id FROM match_facts
             WHERE game_creation_ms >= ?1 AND game_creation_ms < ?2
             ORDER BY player_id ASC",
        )
        .context("prepare players query")?;
    let rows = stmt
        .query_map(params![window.start_ms, window.end_ms], |row| {
            row.get::<_, String>(0)
        })
        .context("query players")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode player row")?);
    }
    Ok(out)
}

/// Persists quarantined rows. Re-quarantining the same raw row for the same
/// reason is a no-op, so retried batches do not duplicate reports.
pub fn record_quarantine(
    conn: &mut Connection,
    rows: &[QuarantinedRow],
    run_key: Option<&str>,
) -> Result<usize> {
    let tx = conn.transaction().context("begin quarantine transaction")?;
    let inserted = store_quarantine(&tx, rows, run_key)?;
    tx.commit().context("commit quarantine transaction")?;
    Ok(inserted)
}

pub fn store_quarantine(
    conn: &Connection,
    rows: &[QuarantinedRow],
    run_key: Option<&str>,
) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let mut inserted = 0usize;
    for q in rows {
        let raw_json = serde_json::to_string(&q.row).context("serialize quarantined row")?;
        inserted += conn
            .execute(
                r#"
                INSERT INTO quarantine (
                    row_digest, reason_code, match_id, player_id, detail, raw_json, run_key, quarantined_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(row_digest, reason_code) DO NOTHING
                "#,
                params![
                    q.row.digest(),
                    q.reason.code(),
                    q.row.match_id,
                    q.row.player_id,
                    q.detail,
                    raw_json,
                    run_key,
                    now,
                ],
            )
            .context("insert quarantined row")?;
    }
    Ok(inserted)
}

/// Quarantined rows with a given reason, for filtering and re-processing.
pub fn load_quarantine(
    conn: &Connection,
    reason: ValidationReason,
) -> Result<Vec<(RawFactRow, String)>> {
    let mut stmt = conn
        .prepare(
            "SELECT raw_json, detail FROM quarantine WHERE reason_code = ?1
             ORDER BY quarantined_at ASC, row_digest ASC",
        )
        .context("prepare quarantine query")?;
    let rows = stmt
        .query_map(params![reason.code()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("query quarantine")?;
    let mut out = Vec::new();
    for row in rows {
        let (raw_json, detail) = row.context("decode quarantine row")?;
        let raw = serde_json::from_str::<RawFactRow>(&raw_json)
            .context("decode quarantined raw row")?;
        out.push((raw, detail));
    }
    Ok(out)
}

pub fn count_facts(conn: &Connection) -> Result<usize> {
    let n = conn
        .query_row("SELECT COUNT(*) FROM match_facts", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("count facts")?;
    Ok(usize::try_from(n).unwrap_or(0))
}

pub fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

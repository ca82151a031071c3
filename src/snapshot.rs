use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::digest::ContentHasher;
use crate::feature_store::latest_vectors;
use crate::features::{FeatureValue, FeatureVector, Window};
use crate::store::now_rfc3339;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub schema_version: String,
    pub member_count: usize,
    pub taken_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub info: SnapshotInfo,
    /// Members ordered by player id, then window.
    pub members: Vec<FeatureVector>,
}

/// Freezes the latest vectors of `schema_version` into a snapshot.
///
/// The id is derived from the frozen content, so taking a snapshot of an
/// unchanged population returns the existing snapshot and its original
/// `taken_at`.
pub fn create_snapshot(conn: &mut Connection, schema_version: &str) -> Result<SnapshotInfo> {
    let latest = latest_vectors(conn, schema_version)?;

    let mut h = ContentHasher::new("snapshot/v1");
    h.push_str(schema_version).push_u64(latest.len() as u64);
    for stored in &latest {
        h.push_str(&stored.vector.content_digest())
            .push_i64(stored.revision);
    }
    let digest = h.finish();
    let snapshot_id = format!("snap-{}", &digest[..16]);

    let tx = conn.transaction().context("begin snapshot transaction")?;
    let created = tx
        .execute(
            "INSERT INTO feature_snapshots(snapshot_id, schema_version, member_count, taken_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(snapshot_id) DO NOTHING",
            params![snapshot_id, schema_version, latest.len() as i64, now_rfc3339()],
        )
        .context("insert snapshot")?;
    if created > 0 {
        for stored in &latest {
            let v = &stored.vector;
            let values_json =
                serde_json::to_string(&v.values).context("serialize snapshot values")?;
            tx.execute(
                r#"
                INSERT INTO snapshot_members (
                    snapshot_id, player_id, window_start_ms, window_end_ms, revision, match_count, values_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    snapshot_id,
                    v.player_id,
                    v.window.start_ms,
                    v.window.end_ms,
                    stored.revision,
                    v.match_count as i64,
                    values_json,
                ],
            )
            .context("insert snapshot member")?;
        }
    }
    tx.commit().context("commit snapshot transaction")?;

    let info = load_snapshot_info(conn, &snapshot_id)?
        .context("snapshot missing right after creation")?;
    if created > 0 {
        info!(
            snapshot_id = %info.snapshot_id,
            schema_version,
            members = info.member_count,
            "snapshot created"
        );
    }
    Ok(info)
}

pub fn load_snapshot_info(conn: &Connection, snapshot_id: &str) -> Result<Option<SnapshotInfo>> {
    conn.query_row(
        "SELECT snapshot_id, schema_version, member_count, taken_at
         FROM feature_snapshots WHERE snapshot_id = ?1",
        params![snapshot_id],
        |row| {
            Ok(SnapshotInfo {
                snapshot_id: row.get(0)?,
                schema_version: row.get(1)?,
                member_count: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                taken_at: row.get(3)?,
            })
        },
    )
    .optional()
    .context("query snapshot")
}

pub fn load_snapshot(conn: &Connection, snapshot_id: &str) -> Result<Option<Snapshot>> {
    let Some(info) = load_snapshot_info(conn, snapshot_id)? else {
        return Ok(None);
    };
    let mut stmt = conn
        .prepare(
            "SELECT player_id, window_start_ms, window_end_ms, match_count, values_json
             FROM snapshot_members WHERE snapshot_id = ?1
             ORDER BY player_id ASC, window_start_ms ASC, window_end_ms ASC",
        )
        .context("prepare snapshot members query")?;
    let rows = stmt
        .query_map(params![snapshot_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .context("query snapshot members")?;

    let mut members = Vec::new();
    for row in rows {
        let (player_id, start_ms, end_ms, match_count, values_json) =
            row.context("decode snapshot member")?;
        let values: Vec<FeatureValue> =
            serde_json::from_str(&values_json).context("decode snapshot values")?;
        members.push(FeatureVector {
            player_id,
            window: Window { start_ms, end_ms },
            schema_version: info.schema_version.clone(),
            values,
            match_count: u64::try_from(match_count).unwrap_or(0),
        });
    }
    Ok(Some(Snapshot { info, members }))
}

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::{FeatureAccumulator, FeatureSchema, FeatureValue, FeatureVector, Window};
use crate::store::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Unchanged,
    Updated { revision: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub vector: FeatureVector,
    pub revision: i64,
    pub updated_at: String,
}

/// A known version may only be re-registered with the same definition.
pub fn register_schema(conn: &Connection, schema: &FeatureSchema) -> Result<()> {
    schema.validate()?;
    let digest = schema.definition_digest();
    let existing = conn
        .query_row(
            "SELECT definition_digest FROM feature_schemas WHERE schema_version = ?1",
            params![schema.version],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("query feature schema")?;
    match existing {
        Some(d) if d == digest => Ok(()),
        Some(_) => Err(anyhow!(
            "feature schema {} is already registered with a different definition",
            schema.version
        )),
        None => {
            let json = serde_json::to_string(schema).context("serialize feature schema")?;
            conn.execute(
                "INSERT INTO feature_schemas(schema_version, definition_json, definition_digest, registered_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(schema_version) DO NOTHING",
                params![schema.version, json, digest, now_rfc3339()],
            )
            .context("insert feature schema")?;
            Ok(())
        }
    }
}

pub fn load_schema(conn: &Connection, version: &str) -> Result<Option<FeatureSchema>> {
    let raw = conn
        .query_row(
            "SELECT definition_json FROM feature_schemas WHERE schema_version = ?1",
            params![version],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("query feature schema")?;
    raw.map(|json| serde_json::from_str(&json).context("decode feature schema"))
        .transpose()
}

/// Identical content never bumps the revision; each distinct change bumps
/// it exactly once, also across connections.
pub fn upsert_vector(
    conn: &mut Connection,
    vector: &FeatureVector,
    state: Option<&FeatureAccumulator>,
) -> Result<UpsertOutcome> {
    let digest = vector.content_digest();
    let values_json = serde_json::to_string(&vector.values).context("serialize feature values")?;
    let state_json = state
        .map(serde_json::to_string)
        .transpose()
        .context("serialize feature state")?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin vector upsert")?;
    let existing = tx
        .query_row(
            "SELECT content_digest, revision FROM feature_vectors
             WHERE player_id = ?1 AND window_start_ms = ?2 AND window_end_ms = ?3 AND schema_version = ?4",
            params![
                vector.player_id,
                vector.window.start_ms,
                vector.window.end_ms,
                vector.schema_version
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .context("query existing vector")?;

    let outcome = match existing {
        None => {
            tx.execute(
                r#"
                INSERT INTO feature_vectors (
                    player_id, window_start_ms, window_end_ms, schema_version,
                    values_json, match_count, content_digest, state_json, revision, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
                "#,
                params![
                    vector.player_id,
                    vector.window.start_ms,
                    vector.window.end_ms,
                    vector.schema_version,
                    values_json,
                    vector.match_count as i64,
                    digest,
                    state_json,
                    now_rfc3339(),
                ],
            )
            .context("insert feature vector")?;
            UpsertOutcome::Inserted
        }
        Some((existing_digest, _)) if existing_digest == digest => {
            if let Some(state_json) = state_json.as_ref() {
                tx.execute(
                    "UPDATE feature_vectors SET state_json = ?5
                     WHERE player_id = ?1 AND window_start_ms = ?2 AND window_end_ms = ?3 AND schema_version = ?4
                       AND (state_json IS NULL OR state_json <> ?5)",
                    params![
                        vector.player_id,
                        vector.window.start_ms,
                        vector.window.end_ms,
                        vector.schema_version,
                        state_json
                    ],
                )
                .context("refresh feature state")?;
            }
            UpsertOutcome::Unchanged
        }
        Some((_, revision)) => {
            let next = revision + 1;
            tx.execute(
                r#"
                UPDATE feature_vectors SET
                    values_json = ?5,
                    match_count = ?6,
                    content_digest = ?7,
                    state_json = COALESCE(?8, state_json),
                    revision = ?9,
                    updated_at = ?10
                WHERE player_id = ?1 AND window_start_ms = ?2 AND window_end_ms = ?3 AND schema_version = ?4
                "#,
                params![
                    vector.player_id,
                    vector.window.start_ms,
                    vector.window.end_ms,
                    vector.schema_version,
                    values_json,
                    vector.match_count as i64,
                    digest,
                    state_json,
                    next,
                    now_rfc3339(),
                ],
            )
            .context("update feature vector")?;
            UpsertOutcome::Updated { revision: next }
        }
    };
    tx.commit().context("commit vector upsert")?;
    debug!(
        player_id = %vector.player_id,
        window = %vector.window,
        schema_version = %vector.schema_version,
        outcome = ?outcome,
        "feature vector upserted"
    );
    Ok(outcome)
}

pub fn load_vector(
    conn: &Connection,
    player_id: &str,
    window: &Window,
    schema_version: &str,
) -> Result<Option<StoredVector>> {
    conn.query_row(
        &format!(
            "{SELECT_VECTOR} WHERE player_id = ?1 AND window_start_ms = ?2 AND window_end_ms = ?3 AND schema_version = ?4"
        ),
        params![player_id, window.start_ms, window.end_ms, schema_version],
        decode_vector_row,
    )
    .optional()
    .context("query feature vector")?
    .map(finish_vector)
    .transpose()
}

pub fn load_state(
    conn: &Connection,
    player_id: &str,
    window: &Window,
    schema_version: &str,
) -> Result<Option<FeatureAccumulator>> {
    let raw = conn
        .query_row(
            "SELECT state_json FROM feature_vectors
             WHERE player_id = ?1 AND window_start_ms = ?2 AND window_end_ms = ?3 AND schema_version = ?4",
            params![player_id, window.start_ms, window.end_ms, schema_version],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .context("query feature state")?
        .flatten();
    raw.map(|json| serde_json::from_str(&json).context("decode feature state"))
        .transpose()
}

/// Latest vector per player for one schema version: the window with the
/// greatest end, ties broken by the greatest start. Ordered by player id.
pub fn latest_vectors(conn: &Connection, schema_version: &str) -> Result<Vec<StoredVector>> {
    let mut stmt = conn
        .prepare(&format!(
            "{SELECT_VECTOR} WHERE schema_version = ?1
             ORDER BY player_id ASC, window_end_ms DESC, window_start_ms DESC"
        ))
        .context("prepare latest vectors query")?;
    let rows = stmt
        .query_map(params![schema_version], decode_vector_row)
        .context("query latest vectors")?;

    let mut out: Vec<StoredVector> = Vec::new();
    for row in rows {
        let stored = finish_vector(row.context("decode vector row")?)?;
        if out
            .last()
            .is_some_and(|prev| prev.vector.player_id == stored.vector.player_id)
        {
            continue;
        }
        out.push(stored);
    }
    Ok(out)
}

pub fn latest_vector_for_player(
    conn: &Connection,
    player_id: &str,
    schema_version: &str,
) -> Result<Option<StoredVector>> {
    conn.query_row(
        &format!(
            "{SELECT_VECTOR} WHERE player_id = ?1 AND schema_version = ?2
             ORDER BY window_end_ms DESC, window_start_ms DESC LIMIT 1"
        ),
        params![player_id, schema_version],
        decode_vector_row,
    )
    .optional()
    .context("query latest player vector")?
    .map(finish_vector)
    .transpose()
}

const SELECT_VECTOR: &str = "SELECT player_id, window_start_ms, window_end_ms, schema_version,
    values_json, match_count, revision, updated_at FROM feature_vectors";

type VectorRow = (String, i64, i64, String, String, i64, i64, String);

fn decode_vector_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_vector(row: VectorRow) -> Result<StoredVector> {
    let (player_id, start_ms, end_ms, schema_version, values_json, match_count, revision, updated_at) =
        row;
    let values: Vec<FeatureValue> =
        serde_json::from_str(&values_json).context("decode feature values")?;
    Ok(StoredVector {
        vector: FeatureVector {
            player_id,
            window: Window { start_ms, end_ms },
            schema_version,
            values,
            match_count: u64::try_from(match_count).unwrap_or(0),
        },
        revision,
        updated_at,
    })
}

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineResult, TrainingError};
use crate::persona_model::PersonaModel;
use crate::store::now_rfc3339;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub version: i64,
    pub schema_version: String,
    pub snapshot_id: String,
    pub published_at: String,
    pub active: bool,
}

/// Stores `model` under the next version and moves the schema's active
/// pointer to it, both in one transaction. The version is assigned here;
/// whatever `model.version` held on input is ignored.
pub fn publish_model(conn: &mut Connection, mut model: PersonaModel) -> Result<PersonaModel> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin model publish")?;
    let last: i64 = tx
        .query_row("SELECT COALESCE(MAX(version), 0) FROM persona_models", [], |row| {
            row.get(0)
        })
        .context("query latest model version")?;
    model.version = last + 1;
    model.published_at = now_rfc3339();

    let model_json = serde_json::to_string(&model).context("serialize persona model")?;
    tx.execute(
        "INSERT INTO persona_models(version, schema_version, snapshot_id, model_json, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            model.version,
            model.schema_version,
            model.snapshot_id,
            model_json,
            model.published_at
        ],
    )
    .context("insert persona model")?;
    tx.execute(
        "INSERT INTO active_models(schema_version, model_version, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(schema_version) DO UPDATE SET
            model_version = excluded.model_version,
            updated_at = excluded.updated_at",
        params![model.schema_version, model.version, model.published_at],
    )
    .context("advance active model pointer")?;
    tx.commit().context("commit model publish")?;

    info!(
        model_version = model.version,
        schema_version = %model.schema_version,
        k = model.k,
        snapshot_id = %model.snapshot_id,
        "persona model published"
    );
    Ok(model)
}

pub fn load_model(conn: &Connection, version: i64) -> Result<Option<PersonaModel>> {
    let raw = conn
        .query_row(
            "SELECT model_json FROM persona_models WHERE version = ?1",
            params![version],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("query persona model")?;
    raw.map(|json| serde_json::from_str(&json).context("decode persona model"))
        .transpose()
}

pub fn active_model_version(conn: &Connection, schema_version: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT model_version FROM active_models WHERE schema_version = ?1",
        params![schema_version],
        |row| row.get(0),
    )
    .optional()
    .context("query active model pointer")
}

pub fn list_models(conn: &Connection, schema_version: &str) -> Result<Vec<ModelSummary>> {
    let active = active_model_version(conn, schema_version)?;
    let mut stmt = conn
        .prepare(
            "SELECT version, schema_version, snapshot_id, published_at FROM persona_models
             WHERE schema_version = ?1 ORDER BY version ASC",
        )
        .context("prepare model list query")?;
    let rows = stmt
        .query_map(params![schema_version], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context("query model list")?;
    let mut out = Vec::new();
    for row in rows {
        let (version, schema_version, snapshot_id, published_at) =
            row.context("decode model row")?;
        out.push(ModelSummary {
            active: active == Some(version),
            version,
            schema_version,
            snapshot_id,
            published_at,
        });
    }
    Ok(out)
}

/// Advisory single-writer lock for training one schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingLock {
    pub schema_version: String,
    pub holder: String,
}

/// Takes the training lock for `schema_version`. A lock older than
/// `ttl_secs` is treated as abandoned and taken over. Re-acquiring a lock
/// already held by `holder` refreshes it.
pub fn acquire_training_lock(
    conn: &mut Connection,
    schema_version: &str,
    holder: &str,
    ttl_secs: i64,
    now_ms: i64,
) -> PipelineResult<TrainingLock> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin lock acquisition")?;
    let current = tx
        .query_row(
            "SELECT holder, acquired_at_ms FROM training_locks WHERE schema_version = ?1",
            params![schema_version],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .context("query training lock")?;

    if let Some((current_holder, acquired_at_ms)) = current {
        let age_ms = now_ms.saturating_sub(acquired_at_ms);
        if current_holder != holder && age_ms < ttl_secs.saturating_mul(1000) {
            return Err(TrainingError::LockHeld {
                schema_version: schema_version.to_string(),
                holder: current_holder,
            }
            .into());
        }
        if current_holder != holder {
            warn!(
                schema_version,
                stale_holder = %current_holder,
                age_ms,
                "taking over expired training lock"
            );
        }
    }

    tx.execute(
        "INSERT INTO training_locks(schema_version, holder, acquired_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(schema_version) DO UPDATE SET
            holder = excluded.holder,
            acquired_at_ms = excluded.acquired_at_ms",
        params![schema_version, holder, now_ms],
    )
    .context("write training lock")?;
    tx.commit().context("commit lock acquisition")?;
    Ok(TrainingLock {
        schema_version: schema_version.to_string(),
        holder: holder.to_string(),
    })
}

/// Releases `lock` if it is still ours. Returns false when another holder
/// took it over in the meantime.
pub fn release_training_lock(conn: &Connection, lock: &TrainingLock) -> Result<bool> {
    let removed = conn
        .execute(
            "DELETE FROM training_locks WHERE schema_version = ?1 AND holder = ?2",
            params![lock.schema_version, lock.holder],
        )
        .context("release training lock")?;
    Ok(removed > 0)
}

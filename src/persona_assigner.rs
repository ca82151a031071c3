use std::fmt;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clustering::euclidean;
use crate::error::{AssignError, PipelineResult};
use crate::feature_store::{StoredVector, latest_vector_for_player};
use crate::features::{FeatureVector, Window};
use crate::model_registry::load_model;
use crate::persona_model::PersonaModel;
use crate::store::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "high" => Some(Confidence::High),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaAssignment {
    pub player_id: String,
    pub model_version: i64,
    pub persona_label: String,
    pub cluster_id: usize,
    pub distance: f64,
    pub confidence_flag: Confidence,
    pub window: Window,
    pub feature_revision: i64,
    pub assigned_at: String,
}

/// Nearest-centroid assignment of one vector. Reads the model only.
///
/// The vector is clipped with the model's bounds and standardized with its
/// scalers; the flag is `Low` when the distance exceeds
/// `low_confidence_multiple` times the winning cluster's training spread.
pub fn assign(
    vector: &FeatureVector,
    model: &PersonaModel,
    low_confidence_multiple: f64,
    assigned_at: &str,
) -> Result<PersonaAssignment, AssignError> {
    let raw = model.aligned_values(vector)?;
    let point = model.preprocess(&raw);
    if model.centroids.is_empty() {
        return Err(AssignError::FeatureMismatch {
            detail: format!("model {} has no centroids", model.version),
        });
    }

    let mut best = 0usize;
    let mut best_d = f64::INFINITY;
    for (idx, c) in model.centroids.iter().enumerate() {
        let d = euclidean(&point, &c.values);
        if d < best_d {
            best_d = d;
            best = idx;
        }
    }
    if !best_d.is_finite() {
        return Err(AssignError::FeatureMismatch {
            detail: format!("player {} has a non-finite feature", vector.player_id),
        });
    }
    let centroid = &model.centroids[best];
    let confidence_flag = if best_d > low_confidence_multiple * centroid.spread {
        Confidence::Low
    } else {
        Confidence::High
    };

    Ok(PersonaAssignment {
        player_id: vector.player_id.clone(),
        model_version: model.version,
        persona_label: centroid.label.clone(),
        cluster_id: centroid.cluster_id,
        distance: best_d,
        confidence_flag,
        window: vector.window,
        feature_revision: 0,
        assigned_at: assigned_at.to_string(),
    })
}

/// Assigns one player's latest vector against an explicit model version and
/// persists the result. An unknown version is an error, never a fallback.
pub fn assign_persona(
    conn: &Connection,
    player_id: &str,
    model_version: i64,
    low_confidence_multiple: f64,
) -> PipelineResult<PersonaAssignment> {
    let model = load_model(conn, model_version)?.ok_or(AssignError::ModelNotFound(model_version))?;
    assign_with_model(conn, player_id, &model, low_confidence_multiple)
}

pub fn assign_with_model(
    conn: &Connection,
    player_id: &str,
    model: &PersonaModel,
    low_confidence_multiple: f64,
) -> PipelineResult<PersonaAssignment> {
    let stored = latest_vector_for_player(conn, player_id, &model.schema_version)?.ok_or_else(
        || AssignError::FeatureVectorNotFound {
            player_id: player_id.to_string(),
            schema_version: model.schema_version.clone(),
        },
    )?;
    let mut assignment = assign(
        &stored.vector,
        model,
        low_confidence_multiple,
        &now_rfc3339(),
    )?;
    assignment.feature_revision = stored.revision;
    let assignment = save_assignment(conn, assignment)?;
    debug!(
        player_id,
        model_version = model.version,
        persona = %assignment.persona_label,
        distance = assignment.distance,
        confidence = %assignment.confidence_flag,
        "persona assigned"
    );
    Ok(assignment)
}

/// Assigns preloaded vectors in parallel against one model. Each player's
/// outcome is reported separately so one bad vector does not stop the rest.
pub fn assign_many(
    vectors: &[StoredVector],
    model: &PersonaModel,
    low_confidence_multiple: f64,
    assigned_at: &str,
) -> Vec<(String, Result<PersonaAssignment, AssignError>)> {
    let out = vectors
        .par_iter()
        .map(|stored| {
            let result = assign(&stored.vector, model, low_confidence_multiple, assigned_at)
                .map(|mut assignment| {
                    assignment.feature_revision = stored.revision;
                    assignment
                });
            (stored.vector.player_id.clone(), result)
        })
        .collect::<Vec<_>>();
    info!(
        model_version = model.version,
        players = vectors.len(),
        assigned = out.iter().filter(|(_, r)| r.is_ok()).count(),
        "assignment batch finished"
    );
    out
}

/// Upserts an assignment. When label and distance are unchanged the stored
/// row, including its `assigned_at`, is kept and returned.
pub fn save_assignment(conn: &Connection, assignment: PersonaAssignment) -> Result<PersonaAssignment> {
    if let Some(existing) = load_assignment(conn, &assignment.player_id, assignment.model_version)?
        && existing.persona_label == assignment.persona_label
        && existing.distance.to_bits() == assignment.distance.to_bits()
        && existing.window == assignment.window
    {
        return Ok(existing);
    }
    conn.execute(
        r#"
        INSERT INTO persona_assignments (
            player_id, model_version, persona_label, cluster_id, distance, confidence,
            window_start_ms, window_end_ms, feature_revision, assigned_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(player_id, model_version) DO UPDATE SET
            persona_label = excluded.persona_label,
            cluster_id = excluded.cluster_id,
            distance = excluded.distance,
            confidence = excluded.confidence,
            window_start_ms = excluded.window_start_ms,
            window_end_ms = excluded.window_end_ms,
            feature_revision = excluded.feature_revision,
            assigned_at = excluded.assigned_at
        "#,
        params![
            assignment.player_id,
            assignment.model_version,
            assignment.persona_label,
            assignment.cluster_id as i64,
            assignment.distance,
            assignment.confidence_flag.as_str(),
            assignment.window.start_ms,
            assignment.window.end_ms,
            assignment.feature_revision,
            assignment.assigned_at,
        ],
    )
    .context("upsert persona assignment")?;
    Ok(assignment)
}

pub fn load_assignment(
    conn: &Connection,
    player_id: &str,
    model_version: i64,
) -> Result<Option<PersonaAssignment>> {
    conn.query_row(
        "SELECT player_id, model_version, persona_label, cluster_id, distance, confidence,
                window_start_ms, window_end_ms, feature_revision, assigned_at
         FROM persona_assignments WHERE player_id = ?1 AND model_version = ?2",
        params![player_id, model_version],
        |row| {
            let confidence: String = row.get(5)?;
            Ok(PersonaAssignment {
                player_id: row.get(0)?,
                model_version: row.get(1)?,
                persona_label: row.get(2)?,
                cluster_id: usize::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                distance: row.get(4)?,
                confidence_flag: Confidence::parse(&confidence).unwrap_or(Confidence::Low),
                window: Window {
                    start_ms: row.get(6)?,
                    end_ms: row.get(7)?,
                },
                feature_revision: row.get(8)?,
                assigned_at: row.get(9)?,
            })
        },
    )
    .optional()
    .context("query persona assignment")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{ClipRange, FeatureValue};
    use crate::persona_model::{Centroid, FeatureScaler};

    fn model() -> PersonaModel {
        PersonaModel {
            version: 3,
            schema_version: "s".to_string(),
            feature_names: vec!["x".to_string()],
            scalers: vec![FeatureScaler {
                mean: 0.0,
                scale: 1.0,
            }],
            clip: vec![ClipRange {
                low: -10.0,
                high: 10.0,
            }],
            centroids: vec![
                Centroid {
                    cluster_id: 0,
                    label: "near".to_string(),
                    values: vec![1.0],
                    member_count: 5,
                    spread: 1.0,
                },
                Centroid {
                    cluster_id: 1,
                    label: "far".to_string(),
                    values: vec![4.3],
                    member_count: 5,
                    spread: 1.0,
                },
            ],
            snapshot_id: "snap".to_string(),
            k: 2,
            validation_score: 1.0,
            seed: 1,
            published_at: String::new(),
        }
    }

    fn vector(x: f64) -> FeatureVector {
        FeatureVector {
            player_id: "p".to_string(),
            window: Window {
                start_ms: 0,
                end_ms: 10,
            },
            schema_version: "s".to_string(),
            values: vec![FeatureValue {
                name: "x".to_string(),
                value: x,
            }],
            match_count: 3,
        }
    }

    #[test]
    fn nearest_centroid_wins_with_high_confidence() {
        let m = model();
        let a = assign(&vector(1.2), &m, 2.5, "t").unwrap();
        assert_eq!(a.persona_label, "near");
        assert!((a.distance - 0.2).abs() < 1e-12);
        assert_eq!(a.confidence_flag, Confidence::High);
    }

    #[test]
    fn clipping_bounds_apply_before_distance() {
        let m = model();
        let a = assign(&vector(1e9), &m, 2.5, "t").unwrap();
        assert_eq!(a.persona_label, "far");
        assert!((a.distance - 5.7).abs() < 1e-12);
        assert_eq!(a.confidence_flag, Confidence::Low);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let mut v = vector(1.0);
        v.schema_version = "other".to_string();
        assert!(matches!(
            assign(&v, &model(), 2.5, "t"),
            Err(AssignError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn assignment_does_not_touch_the_model() {
        let m = model();
        let before = m.clone();
        assign(&vector(3.0), &m, 2.5, "t").unwrap();
        assert_eq!(m, before);
    }

    #[test]
    fn batch_assignment_keeps_order_and_isolates_failures() {
        let m = model();
        let mut foreign = vector(2.0);
        foreign.player_id = "q".to_string();
        foreign.schema_version = "other".to_string();
        let stored = [(vector(1.2), 4), (foreign, 1), (vector(4.0), 2)]
            .into_iter()
            .map(|(vector, revision)| StoredVector {
                vector,
                revision,
                updated_at: String::new(),
            })
            .collect::<Vec<_>>();

        let out = assign_many(&stored, &m, 2.5, "t");
        assert_eq!(out.len(), 3);
        let first = out[0].1.as_ref().unwrap();
        assert_eq!(first.persona_label, "near");
        assert_eq!(first.feature_revision, 4);
        assert_eq!(out[1].0, "q");
        assert!(matches!(out[1].1, Err(AssignError::SchemaMismatch { .. })));
        assert_eq!(out[2].1.as_ref().unwrap().persona_label, "far");
    }
}

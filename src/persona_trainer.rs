use std::collections::BTreeSet;

use chrono::Utc;
use rayon::prelude::*;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::clustering::{KMeansConfig, KMeansFit, calinski_harabasz, kmeans};
use crate::config::PipelineConfig;
use crate::error::{PipelineResult, TrainingError};
use crate::feature_store::load_schema;
use crate::features::{FeatureSchema, clip_ranges};
use crate::model_registry::{acquire_training_lock, publish_model, release_training_lock};
use crate::persona_model::{Centroid, FeatureScaler, PersonaModel};
use crate::snapshot::{Snapshot, load_snapshot};
use crate::workers::{build_pool, with_pool};

/// Trains on `snapshot_id` and publishes the result as the new active model
/// for `schema_version`. Any failure leaves the previous active model in
/// place.
pub fn train_model(
    conn: &mut Connection,
    cfg: &PipelineConfig,
    schema_version: &str,
    snapshot_id: &str,
    candidate_k: &[usize],
) -> PipelineResult<PersonaModel> {
    let holder = format!("pid{}-{:?}", std::process::id(), std::thread::current().id());
    let lock = acquire_training_lock(
        conn,
        schema_version,
        &holder,
        cfg.training_lock_ttl_secs,
        Utc::now().timestamp_millis(),
    )?;
    let result = train_locked(conn, cfg, schema_version, snapshot_id, candidate_k);
    if let Err(err) = release_training_lock(conn, &lock) {
        warn!(schema_version, error = %err, "failed to release training lock");
    }
    if let Err(err) = &result {
        warn!(
            schema_version,
            snapshot_id,
            reason_code = err.reason_code(),
            error = %err,
            "training failed; active model unchanged"
        );
    }
    result
}

fn train_locked(
    conn: &mut Connection,
    cfg: &PipelineConfig,
    schema_version: &str,
    snapshot_id: &str,
    candidate_k: &[usize],
) -> PipelineResult<PersonaModel> {
    let snapshot = load_snapshot(conn, snapshot_id)?.ok_or_else(|| {
        TrainingError::SnapshotNotFound {
            snapshot_id: snapshot_id.to_string(),
        }
    })?;
    if snapshot.info.schema_version != schema_version {
        return Err(TrainingError::SnapshotSchemaMismatch {
            snapshot_id: snapshot_id.to_string(),
            expected: schema_version.to_string(),
            found: snapshot.info.schema_version.clone(),
        }
        .into());
    }
    let schema = load_schema(conn, schema_version)?;
    let model = fit_persona_model(&snapshot, schema.as_ref(), cfg, candidate_k)?;
    Ok(publish_model(conn, model)?)
}

/// Fits a model from a snapshot without touching storage. The returned
/// model carries version 0 until it is published.
pub fn fit_persona_model(
    snapshot: &Snapshot,
    schema: Option<&FeatureSchema>,
    cfg: &PipelineConfig,
    candidate_k: &[usize],
) -> Result<PersonaModel, TrainingError> {
    let members = &snapshot.members;
    if members.len() < cfg.min_snapshot_size.max(1) {
        return Err(TrainingError::InsufficientSnapshot {
            found: members.len(),
            required: cfg.min_snapshot_size.max(1),
        });
    }

    let feature_names = members[0]
        .names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    if feature_names.is_empty() {
        return Err(TrainingError::InconsistentFeatures {
            detail: "snapshot vectors carry no features".to_string(),
        });
    }
    for member in members {
        if member.names() != feature_names.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(TrainingError::InconsistentFeatures {
                detail: format!("player {} has a different feature layout", member.player_id),
            });
        }
    }

    let raw = members.iter().map(|m| m.raw_values()).collect::<Vec<_>>();
    if let Some((row, _)) = raw
        .iter()
        .enumerate()
        .find(|(_, r)| r.iter().any(|x| !x.is_finite()))
    {
        return Err(TrainingError::InconsistentFeatures {
            detail: format!("player {} has a non-finite feature", members[row].player_id),
        });
    }

    let clip = clip_ranges(&raw, cfg.clip_low, cfg.clip_high);
    let clipped = raw
        .iter()
        .map(|r| r.iter().zip(&clip).map(|(x, c)| c.apply(*x)).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let scalers = (0..feature_names.len())
        .map(|col| FeatureScaler::fit(&clipped.iter().map(|r| r[col]).collect::<Vec<_>>()))
        .collect::<Vec<_>>();
    let points = clipped
        .iter()
        .map(|r| r.iter().zip(&scalers).map(|(x, s)| s.standardize(*x)).collect())
        .collect::<Vec<Vec<f64>>>();

    let ks = candidate_k
        .iter()
        .copied()
        .filter(|k| *k >= 2)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let pool = build_pool(cfg.parallelism);
    let evaluated = with_pool(&pool, || {
        ks.par_iter()
            .map(|&k| (k, evaluate_candidate(&points, k, cfg)))
            .collect::<Vec<_>>()
    });

    let mut best: Option<(usize, KMeansFit, f64)> = None;
    let mut rejected = Vec::new();
    for (k, outcome) in evaluated {
        match outcome {
            Ok((fit, score)) => {
                debug!(k, score, inertia = fit.inertia, "candidate evaluated");
                // Ascending k, strict comparison: ties keep the smaller k.
                if best.as_ref().is_none_or(|(_, _, s)| score > *s) {
                    best = Some((k, fit, score));
                }
            }
            Err(reason) => {
                debug!(k, reason = %reason, "candidate rejected");
                rejected.push(format!("k={k}: {reason}"));
            }
        }
    }

    let Some((k, fit, score)) = best else {
        if rejected.is_empty() {
            return Err(TrainingError::NoCandidateK {
                candidates: candidate_k.to_vec(),
            });
        }
        return Err(TrainingError::Degenerate {
            detail: rejected.join("; "),
        });
    };

    let sizes = fit.cluster_sizes();
    let spreads = fit.cluster_spreads(&points);
    let labels = derive_labels(&fit.centroids, &feature_names, schema);
    let centroids = fit
        .centroids
        .into_iter()
        .enumerate()
        .map(|(idx, values)| Centroid {
            cluster_id: idx,
            label: labels[idx].clone(),
            values,
            member_count: sizes[idx],
            spread: spreads[idx],
        })
        .collect::<Vec<_>>();

    info!(
        snapshot_id = %snapshot.info.snapshot_id,
        members = members.len(),
        k,
        score,
        labels = ?labels,
        "persona model fitted"
    );
    Ok(PersonaModel {
        version: 0,
        schema_version: snapshot.info.schema_version.clone(),
        feature_names,
        scalers,
        clip,
        centroids,
        snapshot_id: snapshot.info.snapshot_id.clone(),
        k,
        validation_score: score,
        seed: cfg.kmeans_seed,
        published_at: String::new(),
    })
}

fn evaluate_candidate(
    points: &[Vec<f64>],
    k: usize,
    cfg: &PipelineConfig,
) -> Result<(KMeansFit, f64), String> {
    let kcfg = KMeansConfig {
        k,
        max_iters: cfg.kmeans_max_iters,
        restarts: cfg.kmeans_restarts,
        seed: cfg.kmeans_seed,
    };
    let fit = kmeans(points, &kcfg)
        .ok_or_else(|| format!("population of {} is too small", points.len()))?
        .canonicalize();
    if let Some(smallest) = fit.cluster_sizes().into_iter().min()
        && smallest < cfg.min_cluster_members
    {
        return Err(format!(
            "cluster with {smallest} members, minimum is {}",
            cfg.min_cluster_members
        ));
    }
    let gap = fit.min_centroid_gap();
    if gap <= cfg.centroid_tolerance {
        return Err(format!("centroids within {gap:e} of each other"));
    }
    let score = calinski_harabasz(points, &fit);
    if !score.is_finite() {
        return Err("validation score is not finite".to_string());
    }
    Ok((fit, score))
}

/// Names each centroid after its dominant standardized feature, using the
/// schema's label hints when present. Repeated names get a numeric suffix.
pub fn derive_labels(
    centroids: &[Vec<f64>],
    feature_names: &[String],
    schema: Option<&FeatureSchema>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    centroids
        .iter()
        .map(|values| {
            let mut dominant = 0usize;
            for (idx, v) in values.iter().enumerate() {
                if v.abs() > values[dominant].abs() {
                    dominant = idx;
                }
            }
            let name = feature_names
                .get(dominant)
                .map(String::as_str)
                .unwrap_or("feature");
            let high = values.get(dominant).copied().unwrap_or(0.0) >= 0.0;
            let hint = schema.and_then(|s| s.spec(name)).and_then(|spec| {
                if high {
                    spec.high_label.clone()
                } else {
                    spec.low_label.clone()
                }
            });
            let base = hint.unwrap_or_else(|| {
                if high {
                    format!("high_{name}")
                } else {
                    format!("low_{name}")
                }
            });
            let mut label = base.clone();
            let mut n = 2;
            while !seen.insert(label.clone()) {
                label = format!("{base}_{n}");
                n += 1;
            }
            label
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_dominant_feature_and_dedupe() {
        let names = vec!["a".to_string(), "b".to_string()];
        let centroids = vec![vec![2.0, 0.5], vec![-0.1, -3.0], vec![1.5, 1.0]];
        let labels = derive_labels(&centroids, &names, None);
        assert_eq!(labels, vec!["high_a", "low_b", "high_a_2"]);
    }

    #[test]
    fn labels_use_schema_hints() {
        let schema = FeatureSchema::default_lol();
        let names = schema.feature_names();
        let idx = names.iter().position(|n| n == "dmg_per_min").unwrap();
        let mut centroid = vec![0.0; names.len()];
        centroid[idx] = 2.0;
        let hint = schema.spec("dmg_per_min").unwrap().high_label.clone().unwrap();
        assert_eq!(derive_labels(&[centroid], &names, Some(&schema)), vec![hint]);
    }
}

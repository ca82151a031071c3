use serde::{Deserialize, Serialize};

use crate::error::AssignError;
use crate::features::{ClipRange, FeatureVector};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: f64,
    pub scale: f64,
}

impl FeatureScaler {
    /// Population mean and standard deviation; a constant column gets scale 1.
    pub fn fit(column: &[f64]) -> Self {
        if column.is_empty() {
            return Self {
                mean: 0.0,
                scale: 1.0,
            };
        }
        let n = column.len() as f64;
        let mean = column.iter().sum::<f64>() / n;
        let var = column.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        let std = var.sqrt();
        let scale = if std.is_finite() && std > 1e-12 { std } else { 1.0 };
        Self { mean, scale }
    }

    pub fn standardize(&self, value: f64) -> f64 {
        (value - self.mean) / self.scale
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub cluster_id: usize,
    pub label: String,
    /// Coordinates in standardized feature space.
    pub values: Vec<f64>,
    pub member_count: usize,
    /// RMS distance of training members to this centroid.
    pub spread: f64,
}

/// Published clustering of one snapshot. Never modified after publication;
/// retraining produces a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaModel {
    pub version: i64,
    pub schema_version: String,
    pub feature_names: Vec<String>,
    pub scalers: Vec<FeatureScaler>,
    pub clip: Vec<ClipRange>,
    pub centroids: Vec<Centroid>,
    pub snapshot_id: String,
    pub k: usize,
    pub validation_score: f64,
    pub seed: u64,
    pub published_at: String,
}

impl PersonaModel {
    /// Clips then standardizes raw feature values into the model's space.
    pub fn preprocess(&self, raw: &[f64]) -> Vec<f64> {
        raw.iter()
            .zip(self.clip.iter().zip(&self.scalers))
            .map(|(x, (clip, scaler))| scaler.standardize(clip.apply(*x)))
            .collect()
    }

    /// Raw values of `vector` in the model's feature order, after checking
    /// that the vector was built with the same schema and feature layout.
    pub fn aligned_values(&self, vector: &FeatureVector) -> Result<Vec<f64>, AssignError> {
        if vector.schema_version != self.schema_version {
            return Err(AssignError::SchemaMismatch {
                vector: vector.schema_version.clone(),
                model: self.schema_version.clone(),
            });
        }
        if vector.values.len() != self.feature_names.len() {
            return Err(AssignError::FeatureMismatch {
                detail: format!(
                    "vector has {} features, model has {}",
                    vector.values.len(),
                    self.feature_names.len()
                ),
            });
        }
        let mut out = Vec::with_capacity(self.feature_names.len());
        for (expected, got) in self.feature_names.iter().zip(&vector.values) {
            if &got.name != expected {
                return Err(AssignError::FeatureMismatch {
                    detail: format!("expected `{expected}`, found `{}`", got.name),
                });
            }
            out.push(got.value);
        }
        Ok(out)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.centroids.iter().map(|c| c.label.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaler_uses_population_std() {
        let s = FeatureScaler::fit(&[1.0, 3.0]);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.scale, 1.0);
        let s = FeatureScaler::fit(&[0.0, 4.0]);
        assert_eq!(s.scale, 2.0);
        assert_eq!(s.standardize(4.0), 1.0);
    }

    #[test]
    fn constant_column_keeps_unit_scale() {
        let s = FeatureScaler::fit(&[7.0, 7.0, 7.0]);
        assert_eq!(s.scale, 1.0);
        assert_eq!(s.standardize(7.0), 0.0);
    }
}

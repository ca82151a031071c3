use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;

use crate::features::FeatureSchema;

const APP_DIR: &str = "persona_pipeline";
const DB_FILE: &str = "persona.sqlite";

static CONFIG: OnceCell<PipelineConfig> = OnceCell::new();

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub db_path: Option<PathBuf>,
    pub feature_schema_path: Option<PathBuf>,
    /// Percentile range (0..=1) applied to features before training and assignment.
    pub clip_low: f64,
    pub clip_high: f64,
    pub min_snapshot_size: usize,
    pub min_cluster_members: usize,
    pub centroid_tolerance: f64,
    pub candidate_k: Vec<usize>,
    pub kmeans_seed: u64,
    pub kmeans_max_iters: usize,
    pub kmeans_restarts: usize,
    pub low_confidence_multiple: f64,
    pub training_lock_ttl_secs: i64,
    pub parallelism: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            feature_schema_path: None,
            clip_low: 0.01,
            clip_high: 0.99,
            min_snapshot_size: 20,
            min_cluster_members: 3,
            centroid_tolerance: 1e-6,
            candidate_k: vec![3, 4, 5, 6],
            kmeans_seed: 42,
            kmeans_max_iters: 100,
            kmeans_restarts: 4,
            low_confidence_multiple: 2.5,
            training_lock_ttl_secs: 3600,
            parallelism: 6,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unparseable values fall
    /// back to defaults; numeric values are clamped into sane ranges.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (clip_low, clip_high) = get("CLIP_PERCENTILES")
            .and_then(|raw| parse_pair(&raw))
            .filter(|(lo, hi)| (0.0..=1.0).contains(lo) && (0.0..=1.0).contains(hi) && lo < hi)
            .unwrap_or((d.clip_low, d.clip_high));

        let candidate_k = get("CANDIDATE_K")
            .map(|raw| parse_usize_list(&raw))
            .filter(|ks| !ks.is_empty())
            .unwrap_or(d.candidate_k);

        Self {
            db_path: get("PERSONA_DB_PATH").map(PathBuf::from),
            feature_schema_path: get("FEATURE_SCHEMA_PATH").map(PathBuf::from),
            clip_low,
            clip_high,
            min_snapshot_size: parse_or(get("MIN_SNAPSHOT_SIZE"), d.min_snapshot_size).max(2),
            min_cluster_members: parse_or(get("MIN_CLUSTER_MEMBERS"), d.min_cluster_members)
                .max(1),
            centroid_tolerance: parse_or(get("CENTROID_TOLERANCE"), d.centroid_tolerance)
                .abs()
                .max(1e-12),
            candidate_k,
            kmeans_seed: parse_or(get("KMEANS_SEED"), d.kmeans_seed),
            kmeans_max_iters: parse_or(get("KMEANS_MAX_ITERS"), d.kmeans_max_iters)
                .clamp(1, 10_000),
            kmeans_restarts: parse_or(get("KMEANS_RESTARTS"), d.kmeans_restarts).clamp(1, 64),
            low_confidence_multiple: parse_or(
                get("LOW_CONFIDENCE_MULTIPLE"),
                d.low_confidence_multiple,
            )
            .max(0.0),
            training_lock_ttl_secs: parse_or(
                get("TRAINING_LOCK_TTL_SECS"),
                d.training_lock_ttl_secs,
            )
            .max(1),
            parallelism: parse_or(get("PIPELINE_PARALLELISM"), d.parallelism).clamp(1, 32),
        }
    }

    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        if let Some(path) = self.db_path.as_ref() {
            return Ok(path.clone());
        }
        default_db_path().context("unable to resolve sqlite path (set PERSONA_DB_PATH)")
    }

    /// The configured feature schema, or the built-in default when no file is set.
    pub fn feature_schema(&self) -> Result<FeatureSchema> {
        match self.feature_schema_path.as_deref() {
            Some(path) => load_schema_file(path),
            None => Ok(FeatureSchema::default_lol()),
        }
    }
}

/// Loads `.env.local` / `.env` once and returns the process-wide config.
pub fn global() -> &'static PipelineConfig {
    CONFIG.get_or_init(|| {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");
        PipelineConfig::from_env()
    })
}

pub fn app_data_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

pub fn default_db_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join(DB_FILE))
}

fn load_schema_file(path: &Path) -> Result<FeatureSchema> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read feature schema {}", path.display()))?;
    let schema: FeatureSchema = serde_json::from_str(&raw)
        .with_context(|| format!("parse feature schema {}", path.display()))?;
    if schema.features.is_empty() {
        return Err(anyhow!("feature schema {} defines no features", path.display()));
    }
    Ok(schema)
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

fn parse_pair(raw: &str) -> Option<(f64, f64)> {
    let mut parts = raw
        .split([',', ';', ' '])
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().parse::<f64>());
    let lo = parts.next()?.ok()?;
    let hi = parts.next()?.ok()?;
    Some((lo, hi))
}

fn parse_usize_list(raw: &str) -> Vec<usize> {
    let mut out = raw
        .split([',', ';', ' '])
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .filter(|k| *k >= 2)
        .collect::<Vec<_>>();
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::PipelineConfig;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(config_from(&[]), PipelineConfig::default());
    }

    #[test]
    fn values_are_parsed_and_clamped() {
        let cfg = config_from(&[
            ("CLIP_PERCENTILES", "0.05, 0.95"),
            ("CANDIDATE_K", "6,2,4,4,1"),
            ("PIPELINE_PARALLELISM", "500"),
            ("MIN_SNAPSHOT_SIZE", "0"),
            ("LOW_CONFIDENCE_MULTIPLE", "3.0"),
        ]);
        assert_eq!((cfg.clip_low, cfg.clip_high), (0.05, 0.95));
        assert_eq!(cfg.candidate_k, vec![2, 4, 6]);
        assert_eq!(cfg.parallelism, 32);
        assert_eq!(cfg.min_snapshot_size, 2);
        assert_eq!(cfg.low_confidence_multiple, 3.0);
    }

    #[test]
    fn inverted_clip_range_is_ignored() {
        let cfg = config_from(&[("CLIP_PERCENTILES", "0.9,0.1")]);
        assert_eq!((cfg.clip_low, cfg.clip_high), (0.01, 0.99));
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable reason codes attached to quarantined rows. The string form is what
/// gets persisted and filtered on, so existing values must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationReason {
    MissingKey,
    MissingField,
    NonFinite,
    InvalidRange,
    InvalidDuration,
    UnknownEnum,
    DuplicateInBatch,
    ConflictingDuplicate,
}

impl ValidationReason {
    pub fn code(self) -> &'static str {
        match self {
            ValidationReason::MissingKey => "MISSING_KEY",
            ValidationReason::MissingField => "MISSING_FIELD",
            ValidationReason::NonFinite => "NON_FINITE",
            ValidationReason::InvalidRange => "INVALID_RANGE",
            ValidationReason::InvalidDuration => "INVALID_DURATION",
            ValidationReason::UnknownEnum => "UNKNOWN_ENUM",
            ValidationReason::DuplicateInBatch => "DUPLICATE_IN_BATCH",
            ValidationReason::ConflictingDuplicate => "CONFLICTING_DUPLICATE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let reason = match code {
            "MISSING_KEY" => ValidationReason::MissingKey,
            "MISSING_FIELD" => ValidationReason::MissingField,
            "NON_FINITE" => ValidationReason::NonFinite,
            "INVALID_RANGE" => ValidationReason::InvalidRange,
            "INVALID_DURATION" => ValidationReason::InvalidDuration,
            "UNKNOWN_ENUM" => ValidationReason::UnknownEnum,
            "DUPLICATE_IN_BATCH" => ValidationReason::DuplicateInBatch,
            "CONFLICTING_DUPLICATE" => ValidationReason::ConflictingDuplicate,
            _ => return None,
        };
        Some(reason)
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure of a single player-window aggregation unit.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ComputationError {
    #[error("feature `{feature}` is not finite for player {player_id} in {window}")]
    NonFiniteFeature {
        player_id: String,
        window: String,
        feature: String,
    },
    #[error("fact {match_id} belongs to player {found}, expected {expected}")]
    ForeignFact {
        expected: String,
        found: String,
        match_id: String,
    },
}

impl ComputationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ComputationError::NonFiniteFeature { .. } => "NON_FINITE_FEATURE",
            ComputationError::ForeignFact { .. } => "FOREIGN_FACT",
        }
    }
}

/// Failure of one training run. None of these move the active model pointer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("snapshot {snapshot_id} not found")]
    SnapshotNotFound { snapshot_id: String },
    #[error("snapshot {snapshot_id} is for schema {found}, expected {expected}")]
    SnapshotSchemaMismatch {
        snapshot_id: String,
        expected: String,
        found: String,
    },
    #[error("snapshot has {found} feature vectors, at least {required} required")]
    InsufficientSnapshot { found: usize, required: usize },
    #[error("no usable cluster count among candidates {candidates:?}")]
    NoCandidateK { candidates: Vec<usize> },
    #[error("degenerate clustering: {detail}")]
    Degenerate { detail: String },
    #[error("training for schema {schema_version} already in progress (held by {holder})")]
    LockHeld {
        schema_version: String,
        holder: String,
    },
    #[error("inconsistent feature layout in snapshot: {detail}")]
    InconsistentFeatures { detail: String },
}

impl TrainingError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            TrainingError::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            TrainingError::SnapshotSchemaMismatch { .. } => "SNAPSHOT_SCHEMA_MISMATCH",
            TrainingError::InsufficientSnapshot { .. } => "INSUFFICIENT_SNAPSHOT",
            TrainingError::NoCandidateK { .. } => "NO_CANDIDATE_K",
            TrainingError::Degenerate { .. } => "DEGENERATE_CLUSTERING",
            TrainingError::LockHeld { .. } => "TRAINING_LOCK_HELD",
            TrainingError::InconsistentFeatures { .. } => "INCONSISTENT_FEATURES",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssignError {
    #[error("persona model version {0} not found")]
    ModelNotFound(i64),
    #[error("no feature vector for player {player_id} under schema {schema_version}")]
    FeatureVectorNotFound {
        player_id: String,
        schema_version: String,
    },
    #[error("vector schema {vector} does not match model schema {model}")]
    SchemaMismatch { vector: String, model: String },
    #[error("vector features do not match model features: {detail}")]
    FeatureMismatch { detail: String },
}

impl AssignError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            AssignError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            AssignError::FeatureVectorNotFound { .. } => "FEATURE_VECTOR_NOT_FOUND",
            AssignError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            AssignError::FeatureMismatch { .. } => "FEATURE_MISMATCH",
        }
    }
}

/// Error surfaced by the job-level operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Assign(#[from] AssignError),
    #[error(transparent)]
    Computation(#[from] ComputationError),
    #[error("run key {run_key} was already used for job `{existing_job}`")]
    RunKeyReused { run_key: String, existing_job: String },
    #[error("run {run_key} was aborted after stage {stage}")]
    Aborted { run_key: String, stage: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::Training(err) => err.reason_code(),
            PipelineError::Assign(err) => err.reason_code(),
            PipelineError::Computation(err) => err.reason_code(),
            PipelineError::RunKeyReused { .. } => "RUN_KEY_REUSED",
            PipelineError::Aborted { .. } => "ABORTED",
            PipelineError::Storage(_) => "STORAGE",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_round_trip_through_their_string_form() {
        for reason in [
            ValidationReason::MissingKey,
            ValidationReason::MissingField,
            ValidationReason::NonFinite,
            ValidationReason::InvalidRange,
            ValidationReason::InvalidDuration,
            ValidationReason::UnknownEnum,
            ValidationReason::DuplicateInBatch,
            ValidationReason::ConflictingDuplicate,
        ] {
            assert_eq!(ValidationReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(ValidationReason::from_code("nope"), None);
    }

    #[test]
    fn serde_form_matches_code() {
        let json = serde_json::to_string(&ValidationReason::InvalidRange).unwrap();
        assert_eq!(json, "\"INVALID_RANGE\"");
    }

    #[test]
    fn pipeline_error_exposes_nested_reason() {
        let err: PipelineError = AssignError::ModelNotFound(7).into();
        assert_eq!(err.reason_code(), "MODEL_NOT_FOUND");
        assert_eq!(err.to_string(), "persona model version 7 not found");
    }
}

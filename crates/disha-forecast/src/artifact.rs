//! Persisted model artefacts.
//!
//! The trained booster, its feature column order, the category label
//! encoders, and the bias-calibration shift travel together as one
//! versioned JSON document. Retraining replaces the artefact atomically
//! (write to a sibling temp file, then rename) so a reader never observes
//! a half-written model.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use disha_core::{Error, Result};

use crate::features::LabelEncoder;
use crate::gbm::GradientBoostedRegressor;

/// Evaluation metrics captured at training time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// R² of growth predictions on the held-out transition.
    pub growth_r2_test: f64,
    /// Mean absolute error of growth predictions on the held-out
    /// transition.
    pub growth_mae_test: f64,
    /// Mean absolute error in enrolment units on the held-out transition.
    pub enrolment_mae_test: f64,
    /// Mean absolute percentage error in enrolment units.
    pub enrolment_mape_test: f64,
    /// Growth MAE of the WMA baseline on the same rows, for comparison.
    pub growth_mae_wma: f64,
    /// Training rows used.
    pub n_train: usize,
    /// Test rows used.
    pub n_test: usize,
}

/// A complete, versioned model artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Version tag, written alongside every forecast row.
    pub model_version: String,
    /// When training completed.
    pub trained_at: DateTime<Utc>,
    /// Feature column order the model expects.
    pub feature_columns: Vec<String>,
    /// District label encoder fitted at training time.
    pub district_encoder: LabelEncoder,
    /// Management-type label encoder fitted at training time.
    pub management_encoder: LabelEncoder,
    /// Additive correction applied to raw predictions before clipping.
    pub bias_shift: f64,
    /// The fitted booster.
    pub model: GradientBoostedRegressor,
    /// Evaluation metrics from the training run.
    pub metrics: EvalMetrics,
}

impl ModelArtifact {
    /// Writes the artefact atomically next to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Artifact`] on serialization or filesystem
    /// failures.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| artifact_error("serialize artefact", &e))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| artifact_error("create artefact directory", &e))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| artifact_error("write artefact temp", &e))?;
        std::fs::rename(&tmp, path).map_err(|e| artifact_error("publish artefact", &e))?;
        Ok(())
    }

    /// Loads an artefact from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Artifact`] when the file is missing or does not
    /// parse as a model artefact.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read(path).map_err(|e| artifact_error("read artefact", &e))?;
        serde_json::from_slice(&raw).map_err(|e| artifact_error("parse artefact", &e))
    }
}

fn artifact_error(context: &str, cause: &impl std::fmt::Display) -> Error {
    Error::Artifact {
        message: format!("{context}: {cause}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disha_core::config::MlConfig;
    use crate::features::FEATURE_COLUMNS;

    fn tiny_artifact() -> ModelArtifact {
        let features = vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0];
        let targets = vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let config = MlConfig {
            n_estimators: 5,
            min_samples_leaf: 1,
            validation_fraction: 0.0,
            ..MlConfig::default()
        };
        let model = GradientBoostedRegressor::fit(&features, 1, &targets, &config);
        ModelArtifact {
            model_version: "v1.0".to_string(),
            trained_at: Utc::now(),
            feature_columns: FEATURE_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
            district_encoder: LabelEncoder::fit(["D1", "D2"].into_iter()),
            management_encoder: LabelEncoder::fit(["GOVT"].into_iter()),
            bias_shift: 0.001,
            model,
            metrics: EvalMetrics::default(),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growth_model.json");
        let artifact = tiny_artifact();
        artifact.save(&path).unwrap();
        let back = ModelArtifact::load(&path).unwrap();
        assert_eq!(back, artifact);
        // No temp file left behind after the atomic publish.
        assert!(!dir.path().join("growth_model.json.tmp").exists());
    }

    #[test]
    fn retrain_replaces_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growth_model.json");
        let mut artifact = tiny_artifact();
        artifact.save(&path).unwrap();
        artifact.bias_shift = -0.004;
        artifact.save(&path).unwrap();
        let back = ModelArtifact::load(&path).unwrap();
        assert!((back.bias_shift + 0.004).abs() < 1e-12);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growth_model.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(ModelArtifact::load(&path).is_err());
    }
}

//! Pipeline configuration.
//!
//! Every policy constant in the pipeline lives here with its fixed default,
//! so there is exactly one place to audit thresholds and one way to override
//! them (a TOML file passed via `--config`). Values that form part of the
//! I/O contract (norm tables, risk weights, bands, the proposal noise range)
//! must not be changed casually; see SPEC_FULL.md.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::{ClassroomNorms, PtrNorms};

/// Weights of the composite risk score. Must sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskWeights {
    /// Weight of the teacher deficit ratio.
    pub teacher: f64,
    /// Weight of the classroom deficit ratio.
    pub classroom: f64,
    /// Weight of the capped absolute enrolment growth.
    pub growth: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            teacher: 0.45,
            classroom: 0.35,
            growth: 0.20,
        }
    }
}

/// Lower cut points of the CRITICAL/HIGH/MODERATE risk tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskBands {
    /// Scores at or above this are CRITICAL.
    pub critical: f64,
    /// Scores at or above this (and below critical) are HIGH.
    pub high: f64,
    /// Scores at or above this (and below high) are MODERATE.
    pub moderate: f64,
}

impl Default for RiskBands {
    fn default() -> Self {
        Self {
            critical: 0.60,
            high: 0.40,
            moderate: 0.20,
        }
    }
}

/// Percentile cut points for priority buckets (strict `<` comparisons).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PriorityCutPoints {
    /// Top-5% cut point.
    pub top_5: f64,
    /// Top-10% cut point.
    pub top_10: f64,
    /// Top-20% cut point.
    pub top_20: f64,
}

impl Default for PriorityCutPoints {
    fn default() -> Self {
        Self {
            top_5: 0.05,
            top_10: 0.10,
            top_20: 0.20,
        }
    }
}

/// Upper cut points of the district compliance letter grades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ComplianceGradeBands {
    /// Average risk at or below this grades A.
    pub a: f64,
    /// Average risk at or below this grades B.
    pub b: f64,
    /// Average risk at or below this grades C.
    pub c: f64,
    /// Average risk at or below this grades D; above it grades F.
    pub d: f64,
}

impl Default for ComplianceGradeBands {
    fn default() -> Self {
        Self {
            a: 0.15,
            b: 0.30,
            c: 0.50,
            d: 0.70,
        }
    }
}

/// Budget allocation simulator caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BudgetConfig {
    /// Monetary classroom-construction cap per academic year.
    pub total_classroom_budget: u64,
    /// Cost of constructing one classroom.
    pub cost_per_classroom: u64,
    /// Teacher posting cap per academic year.
    pub max_teachers: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_classroom_budget: 500_000_000,
            cost_per_classroom: 500_000,
            max_teachers: 10_000,
        }
    }
}

impl BudgetConfig {
    /// The derived classroom cap: `floor(total_budget / cost_per_classroom)`.
    #[must_use]
    pub const fn max_classrooms(&self) -> u64 {
        self.total_classroom_budget / self.cost_per_classroom
    }
}

/// Deterministic noise applied when synthesising demand proposals.
///
/// The factor is `base + (crc32(school_id ∥ year ∥ salt) mod steps) / 100`,
/// giving `[0.70, 1.49]` under the defaults. The derivation is part of the
/// reproducibility contract and uses CRC32 specifically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProposalNoise {
    /// Lower bound of the multiplier.
    pub base: f64,
    /// Number of 0.01 steps above the base.
    pub steps: u32,
}

impl Default for ProposalNoise {
    fn default() -> Self {
        Self {
            base: 0.70,
            steps: 80,
        }
    }
}

/// Risk trend thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrendConfig {
    /// Delta band separating IMPROVING/STABLE/DETERIORATING.
    pub trend_band: f64,
    /// Absolute delta above which a year is volatile.
    pub volatile_threshold: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            trend_band: 0.05,
            volatile_threshold: 0.15,
        }
    }
}

/// Forecasting constants shared by the WMA and ML stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ForecastConfig {
    /// Absolute-value cap on the per-year growth rate.
    pub growth_cap: f64,
    /// Absolute-value cap on the growth term inside the risk score.
    pub growth_cap_risk: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            growth_cap: 0.30,
            growth_cap_risk: 0.50,
        }
    }
}

/// Hyperparameters of the gradient-boosted growth model.
///
/// Fixed by policy (no hyperparameter search); the invariants that matter
/// are the robust loss, shallow trees with large leaves, and early stopping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MlConfig {
    /// Maximum number of boosting rounds.
    pub n_estimators: usize,
    /// Maximum tree depth.
    pub max_depth: usize,
    /// Minimum samples in a leaf.
    pub min_samples_leaf: usize,
    /// Shrinkage applied to each tree's contribution.
    pub learning_rate: f64,
    /// Fraction of training rows sampled per round.
    pub subsample: f64,
    /// Fraction of training rows held out for early stopping.
    pub validation_fraction: f64,
    /// Rounds without validation improvement before stopping.
    pub early_stopping_patience: usize,
    /// Minimum validation improvement that resets the patience counter.
    pub tol: f64,
    /// Quantile of absolute residuals used as the Huber delta.
    pub huber_quantile: f64,
    /// Seed for subsampling and the validation split.
    pub seed: u64,
    /// Schools below this enrolment are excluded from training.
    pub min_enrolment_train: i64,
    /// Version tag written to the output table and the artefact.
    pub model_version: String,
    /// Where the trained model artefact is published.
    pub artifact_path: PathBuf,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            n_estimators: 500,
            max_depth: 4,
            min_samples_leaf: 100,
            learning_rate: 0.03,
            subsample: 0.8,
            validation_fraction: 0.1,
            early_stopping_patience: 30,
            tol: 1e-5,
            huber_quantile: 0.9,
            seed: 42,
            min_enrolment_train: 10,
            model_version: "v1.0".to_string(),
            artifact_path: PathBuf::from("growth_model.json"),
        }
    }
}

/// Store execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    /// Per-batch statement timeout in milliseconds.
    pub statement_timeout_ms: u64,
    /// Transient-error retries per batch beyond the first attempt.
    pub max_retries: u32,
    /// Base of the exponential backoff between retries, in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 120_000,
            max_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

/// The complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    /// Students-per-classroom norms.
    pub classroom_norms: ClassroomNorms,
    /// Pupil-teacher-ratio norms.
    pub ptr_norms: PtrNorms,
    /// Composite risk weights.
    pub risk_weights: RiskWeights,
    /// Risk tier cut points.
    pub risk_bands: RiskBands,
    /// Priority bucket cut points.
    pub priority_buckets: PriorityCutPoints,
    /// District grade cut points.
    pub compliance_grades: ComplianceGradeBands,
    /// Budget simulator caps.
    pub budget: BudgetConfig,
    /// Proposal noise derivation.
    pub proposal_noise: ProposalNoise,
    /// Trend thresholds.
    pub trend: TrendConfig,
    /// Forecast growth caps.
    pub forecast: ForecastConfig,
    /// ML model hyperparameters.
    pub ml: MlConfig,
    /// Store execution limits.
    pub execution: ExecutionConfig,
}

impl PipelineConfig {
    /// Loads configuration from a TOML file layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file cannot be read or parsed, or
    /// when the resulting configuration fails validation.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            Error::config(format!("cannot parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let weight_sum =
            self.risk_weights.teacher + self.risk_weights.classroom + self.risk_weights.growth;
        if (weight_sum - 1.0).abs() > 1e-9 {
            return Err(Error::config(format!(
                "risk weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if !(self.risk_bands.moderate < self.risk_bands.high
            && self.risk_bands.high < self.risk_bands.critical)
        {
            return Err(Error::config("risk bands must be strictly ascending"));
        }
        if !(self.priority_buckets.top_5 < self.priority_buckets.top_10
            && self.priority_buckets.top_10 < self.priority_buckets.top_20)
        {
            return Err(Error::config("priority cut points must be strictly ascending"));
        }
        if !(self.compliance_grades.a < self.compliance_grades.b
            && self.compliance_grades.b < self.compliance_grades.c
            && self.compliance_grades.c < self.compliance_grades.d)
        {
            return Err(Error::config("compliance grade bands must be strictly ascending"));
        }
        if self.budget.cost_per_classroom == 0 {
            return Err(Error::config("cost_per_classroom must be greater than zero"));
        }
        if self.forecast.growth_cap <= 0.0 || self.forecast.growth_cap_risk <= 0.0 {
            return Err(Error::config("growth caps must be positive"));
        }
        if !(0.0..1.0).contains(&self.ml.validation_fraction) {
            return Err(Error::config("validation_fraction must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.ml.subsample) || self.ml.subsample == 0.0 {
            return Err(Error::config("subsample must be in (0, 1]"));
        }
        if self.ml.max_depth == 0 || self.ml.n_estimators == 0 || self.ml.min_samples_leaf == 0 {
            return Err(Error::config("ML tree limits must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn defaults_match_policy_table() {
        let config = PipelineConfig::default();
        assert_eq!(config.risk_weights.teacher, 0.45);
        assert_eq!(config.risk_weights.classroom, 0.35);
        assert_eq!(config.risk_weights.growth, 0.20);
        assert_eq!(config.risk_bands.critical, 0.60);
        assert_eq!(config.trend.trend_band, 0.05);
        assert_eq!(config.trend.volatile_threshold, 0.15);
        assert_eq!(config.budget.max_classrooms(), 1_000);
        assert_eq!(config.forecast.growth_cap, 0.30);
        assert_eq!(config.execution.statement_timeout_ms, 120_000);
    }

    #[test]
    fn rejects_bad_weight_sum() {
        let mut config = PipelineConfig::default();
        config.risk_weights.growth = 0.30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overlay_keeps_unset_defaults() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            [budget]
            max_teachers = 500

            [trend]
            volatile_threshold = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(parsed.budget.max_teachers, 500);
        assert_eq!(parsed.budget.cost_per_classroom, 500_000);
        assert_eq!(parsed.trend.volatile_threshold, 0.25);
        assert_eq!(parsed.trend.trend_band, 0.05);
    }

    #[test]
    fn rejects_unknown_keys() {
        let parsed: std::result::Result<PipelineConfig, _> =
            toml::from_str("[budget]\nmax_tecahers = 500\n");
        assert!(parsed.is_err());
    }
}

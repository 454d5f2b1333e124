//! Stage identity and the engine contract.
//!
//! Stages are nodes of a DAG with explicit `depends_on` metadata; the
//! driver topologically sorts them and supports `--from`/`--to` cuts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use disha_core::{AcademicYear, CancelFlag, Error, PipelineConfig, Result};
use disha_store::{BatchReport, Store};

/// Identity of every pipeline stage, in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Idempotent DDL for all tables and indexes.
    Bootstrap,
    /// Norm-based classroom requirements and gaps.
    InfraGap,
    /// PTR-based teacher requirements and gaps.
    TeacherAdequacy,
    /// Deficit ratios, enrolment growth, composite risk.
    ComplianceRisk,
    /// State/district rankings and priority buckets.
    Prioritisation,
    /// LAG-based risk deltas and chronic/volatile flags.
    RiskTrend,
    /// District aggregates, rankings, letter grades.
    DistrictCompliance,
    /// Synthetic proposals and rule-based validation.
    ProposalValidation,
    /// Weighted-moving-average enrolment forecast.
    WmaForecast,
    /// Gradient-boosted growth-rate forecast.
    MlForecast,
    /// Priority-ordered allocation under fixed caps.
    BudgetAllocation,
}

impl StageId {
    /// All stages in canonical declaration order (a valid topological
    /// order of the dependency graph).
    pub const ALL: &'static [Self] = &[
        Self::Bootstrap,
        Self::InfraGap,
        Self::TeacherAdequacy,
        Self::ComplianceRisk,
        Self::Prioritisation,
        Self::RiskTrend,
        Self::DistrictCompliance,
        Self::ProposalValidation,
        Self::WmaForecast,
        Self::MlForecast,
        Self::BudgetAllocation,
    ];

    /// The stage's canonical CLI name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::InfraGap => "infra-gap",
            Self::TeacherAdequacy => "teacher-adequacy",
            Self::ComplianceRisk => "compliance-risk",
            Self::Prioritisation => "prioritisation",
            Self::RiskTrend => "risk-trend",
            Self::DistrictCompliance => "district-compliance",
            Self::ProposalValidation => "proposal-validation",
            Self::WmaForecast => "wma-forecast",
            Self::MlForecast => "ml-forecast",
            Self::BudgetAllocation => "budget-allocation",
        }
    }

    /// Upstream stages whose outputs this stage reads.
    #[must_use]
    pub const fn depends_on(self) -> &'static [Self] {
        match self {
            Self::Bootstrap => &[],
            Self::InfraGap | Self::TeacherAdequacy => &[Self::Bootstrap],
            Self::ComplianceRisk => &[Self::InfraGap, Self::TeacherAdequacy],
            Self::Prioritisation
            | Self::RiskTrend
            | Self::DistrictCompliance
            | Self::ProposalValidation
            | Self::WmaForecast
            | Self::MlForecast => &[Self::ComplianceRisk],
            Self::BudgetAllocation => &[Self::Prioritisation],
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown stage: {s}")))
    }
}

/// Options shared by every engine invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict per-year engines to this single year batch. Whole-series
    /// passes ignore the restriction (they are inherently cross-year).
    pub year: Option<AcademicYear>,
    /// Cancellation signal, honoured between batches only.
    pub cancel: CancelFlag,
}

/// The narrow interface every stage exposes to the driver.
pub trait Engine {
    /// This engine's stage identity.
    fn id(&self) -> StageId;

    /// Runs the engine's batches against the store.
    ///
    /// # Errors
    ///
    /// Returns the first batch error after attempting the remaining year
    /// batches (committed batches stay committed; re-runs replay them
    /// idempotently).
    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>>;
}

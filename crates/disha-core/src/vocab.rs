//! Closed vocabularies for every tagged column the pipeline writes.
//!
//! Each enum mirrors a `CHECK` constraint in the schema, so a value that
//! round-trips through the store is guaranteed to match exhaustively in
//! code. Band classifiers (`RiskLevel::from_score` and friends) live next
//! to their vocabulary and back the classifier scalars the store
//! registers (`risk_level_of` and friends), so engine SQL never restates
//! a cut point.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{ComplianceGradeBands, PriorityCutPoints, RiskBands};
use crate::error::Error;

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// All variants, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The canonical stored form.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::Internal {
                        message: format!(
                            concat!("unknown ", stringify!($name), " value: {}"),
                            other
                        ),
                    }),
                }
            }
        }
    };
}

/// Four-tier classification of the composite risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Score below the MODERATE band.
    Low,
    /// Score in `[0.20, 0.40)` under default bands.
    Moderate,
    /// Score in `[0.40, 0.60)` under default bands.
    High,
    /// Score at or above the CRITICAL band (default 0.60).
    Critical,
}

str_enum!(RiskLevel {
    Low => "LOW",
    Moderate => "MODERATE",
    High => "HIGH",
    Critical => "CRITICAL",
});

impl RiskLevel {
    /// Classifies a composite risk score against the configured bands.
    ///
    /// Band edges are inclusive on the upper tier: a score exactly at the
    /// CRITICAL cut point is CRITICAL.
    #[must_use]
    pub fn from_score(score: f64, bands: &RiskBands) -> Self {
        if score >= bands.critical {
            Self::Critical
        } else if score >= bands.high {
            Self::High
        } else if score >= bands.moderate {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

/// Percentile-based priority partition of schools within a year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityBucket {
    /// Percentile strictly below the top-5% cut point.
    Top5,
    /// Percentile strictly below the top-10% cut point.
    Top10,
    /// Percentile strictly below the top-20% cut point.
    Top20,
    /// Everything else.
    Standard,
}

str_enum!(PriorityBucket {
    Top5 => "TOP_5",
    Top10 => "TOP_10",
    Top20 => "TOP_20",
    Standard => "STANDARD",
});

impl PriorityBucket {
    /// Buckets a `PERCENT_RANK` value (0 = highest risk) using strict `<`
    /// comparisons at each cut point.
    #[must_use]
    pub fn from_percentile(percentile: f64, cuts: &PriorityCutPoints) -> Self {
        if percentile < cuts.top_5 {
            Self::Top5
        } else if percentile < cuts.top_10 {
            Self::Top10
        } else if percentile < cuts.top_20 {
            Self::Top20
        } else {
            Self::Standard
        }
    }
}

/// Outcome of the budget allocation simulation for one school-year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    /// Both classroom and teacher allocations are positive.
    Funded,
    /// Exactly one of the two allocations is positive.
    PartiallyFunded,
    /// Neither allocation is positive.
    Unfunded,
}

str_enum!(AllocationStatus {
    Funded => "FUNDED",
    PartiallyFunded => "PARTIALLY_FUNDED",
    Unfunded => "UNFUNDED",
});

/// Year-over-year movement of the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendDirection {
    /// First observed year; no predecessor to compare against.
    Baseline,
    /// Risk fell by more than the trend band.
    Improving,
    /// Risk moved within the trend band.
    Stable,
    /// Risk rose by more than the trend band.
    Deteriorating,
}

str_enum!(TrendDirection {
    Baseline => "BASELINE",
    Improving => "IMPROVING",
    Stable => "STABLE",
    Deteriorating => "DETERIORATING",
});

impl TrendDirection {
    /// Classifies a risk delta; `None` means no previous year.
    #[must_use]
    pub fn from_delta(delta: Option<f64>, band: f64) -> Self {
        match delta {
            None => Self::Baseline,
            Some(d) if d < -band => Self::Improving,
            Some(d) if d > band => Self::Deteriorating,
            Some(_) => Self::Stable,
        }
    }
}

/// Verdict on a demand proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    /// Request is consistent with the computed gaps.
    Accepted,
    /// Request deviates enough to warrant review.
    Flagged,
    /// Request is inconsistent with the computed gaps.
    Rejected,
}

str_enum!(DecisionStatus {
    Accepted => "ACCEPTED",
    Flagged => "FLAGGED",
    Rejected => "REJECTED",
});

/// Why a proposal received its decision. One code per validation rule,
/// in rule order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Resources requested with no computed deficit at all.
    NoDeficit,
    /// Classroom request above 1.5× the gap.
    ClassroomOverRequest,
    /// Teacher request above 1.5× the gap.
    TeacherOverRequest,
    /// Classroom request between 1.2× and 1.5× the gap.
    ClassroomModerateOver,
    /// Teacher request between 1.2× and 1.5× the gap.
    TeacherModerateOver,
    /// Classroom request below half the (positive) gap.
    ClassroomUnderRequest,
    /// Teacher request below half the (positive) gap.
    TeacherUnderRequest,
    /// Nothing requested and nothing owed.
    NoRequest,
    /// Request within tolerance of the gaps.
    WithinTolerance,
}

str_enum!(ReasonCode {
    NoDeficit => "NO_DEFICIT",
    ClassroomOverRequest => "CLASSROOM_OVER_REQUEST",
    TeacherOverRequest => "TEACHER_OVER_REQUEST",
    ClassroomModerateOver => "CLASSROOM_MODERATE_OVER",
    TeacherModerateOver => "TEACHER_MODERATE_OVER",
    ClassroomUnderRequest => "CLASSROOM_UNDER_REQUEST",
    TeacherUnderRequest => "TEACHER_UNDER_REQUEST",
    NoRequest => "NO_REQUEST",
    WithinTolerance => "WITHIN_TOLERANCE",
});

/// Letter grade assigned to a district-year by average risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplianceGrade {
    /// Average risk at or below the A band.
    A,
    /// Average risk at or below the B band.
    B,
    /// Average risk at or below the C band.
    C,
    /// Average risk at or below the D band.
    D,
    /// Average risk above the D band.
    F,
}

str_enum!(ComplianceGrade {
    A => "A",
    B => "B",
    C => "C",
    D => "D",
    F => "F",
});

impl ComplianceGrade {
    /// Grades a district's average risk score against the configured bands.
    #[must_use]
    pub fn from_avg_risk(avg_risk: f64, bands: &ComplianceGradeBands) -> Self {
        if avg_risk <= bands.a {
            Self::A
        } else if avg_risk <= bands.b {
            Self::B
        } else if avg_risk <= bands.c {
            Self::C
        } else if avg_risk <= bands.d {
            Self::D
        } else {
            Self::F
        }
    }
}

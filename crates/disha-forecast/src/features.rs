//! Feature engineering.
//!
//! Turns the ordered panel into the 20-column feature matrix and the
//! clipped growth-rate target. All windowed quantities (lags, rolling
//! statistics, the WMA baseline) are computed per school over its own
//! contiguous slice, mirroring the window semantics of the SQL stages.

use serde::{Deserialize, Serialize};

use crate::panel::PanelRow;

/// Number of model features.
pub const N_FEATURES: usize = 20;

/// Feature column order. This is part of the persisted model artefact:
/// inference must feed columns in exactly this order.
pub const FEATURE_COLUMNS: [&str; N_FEATURES] = [
    "total_enrolment",
    "enrolment_lag1",
    "enrolment_lag2",
    "growth_rate",
    "growth_rate_lag1",
    "school_category",
    "total_teachers",
    "total_class_rooms",
    "usable_class_rooms",
    "classroom_gap",
    "teacher_gap",
    "risk_score",
    "teacher_deficit_ratio",
    "classroom_deficit_ratio",
    "district_code",
    "management_code",
    "enrolment_3yr_mean",
    "enrolment_volatility",
    "teacher_per_student",
    "rooms_per_student",
];

/// Rolling enrolment volatility is capped so a single data-entry spike
/// cannot dominate the feature range.
pub const VOLATILITY_CAP: f64 = 500.0;

/// Fallback category feature value for schools with no category.
const CATEGORY_FALLBACK: f64 = 6.0;

/// Deterministic integer encoding of a categorical column: classes are
/// the sorted distinct values, encoded by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Fits the encoder over every value in the iterator.
    pub fn fit<'a>(values: impl Iterator<Item = &'a str>) -> Self {
        let mut classes: Vec<String> = values.map(str::to_string).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    /// Encodes one value; unseen values map to the class count (an index
    /// no training row ever carried).
    #[must_use]
    pub fn encode(&self, value: &str) -> f64 {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(value))
            .map_or(self.classes.len(), |i| i) as f64
    }

    /// The fitted classes, in encoding order.
    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// One engineered observation.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    /// School identity.
    pub school_id: String,
    /// Academic year the features describe.
    pub academic_year: String,
    /// The 20 model features, in [`FEATURE_COLUMNS`] order.
    pub features: [f64; N_FEATURES],
    /// Clipped next-year growth target; `None` on each school's last year.
    pub target_growth: Option<f64>,
    /// Raw next-year enrolment, for evaluation in enrolment units.
    pub target_enrolment: Option<f64>,
    /// Current enrolment (duplicated out of the feature array for
    /// readability at projection time).
    pub total_enrolment: f64,
    /// The WMA growth replica used as the evaluation baseline.
    pub wma_growth: f64,
    /// Category, usable rooms, and teachers carried through for norm
    /// translation at projection time.
    pub school_category: Option<i64>,
    /// Usable classrooms at feature time.
    pub usable_class_rooms: i64,
    /// Teachers on roll at feature time.
    pub total_teachers: i64,
}

/// The full engineered panel plus its fitted encoders.
#[derive(Debug)]
pub struct FeatureSet {
    /// Engineered rows, in panel order.
    pub rows: Vec<FeatureRow>,
    /// District label encoder.
    pub district_encoder: LabelEncoder,
    /// Management-type label encoder.
    pub management_encoder: LabelEncoder,
}

/// Builds features and targets from the ordered panel.
///
/// `growth_cap` clips both the growth features and the target, keeping
/// every growth quantity in the same bounded range.
#[must_use]
pub fn build_features(panel: &[PanelRow], growth_cap: f64) -> FeatureSet {
    let district_encoder = LabelEncoder::fit(panel.iter().map(|r| r.district.as_str()));
    let management_encoder = LabelEncoder::fit(panel.iter().map(|r| r.management_type.as_str()));

    let clip = |g: f64| g.clamp(-growth_cap, growth_cap);
    let mut rows = Vec::with_capacity(panel.len());

    for school in group_by_school(panel) {
        for (i, row) in school.iter().enumerate() {
            let enrolment = row.total_enrolment as f64;
            let lag = |k: usize| {
                i.checked_sub(k)
                    .map(|j| school[j].total_enrolment as f64)
            };
            let lag1 = lag(1);
            let lag2 = lag(2);
            let lag3 = lag(3);

            let safe_lag1 = lag1.map(|v| v.max(1.0));
            let growth_rate = match (lag1, safe_lag1) {
                (Some(prev), Some(safe)) => clip((enrolment - prev) / safe),
                _ => 0.0,
            };
            let growth_rate_lag1 = if i >= 2 {
                let prev = school[i - 1].total_enrolment as f64;
                let prev_prev = school[i - 2].total_enrolment as f64;
                clip((prev - prev_prev) / prev_prev.max(1.0))
            } else {
                0.0
            };

            // WMA replica: 3/2/1-weighted deltas over the trailing window,
            // missing deltas contributing 0.
            let d1 = lag1.map_or(0.0, |v| enrolment - v);
            let d2 = match (lag1, lag2) {
                (Some(a), Some(b)) => a - b,
                _ => 0.0,
            };
            let d3 = match (lag2, lag3) {
                (Some(a), Some(b)) => a - b,
                _ => 0.0,
            };
            let wma_growth = match safe_lag1 {
                Some(safe) => clip((3.0 * d1 + 2.0 * d2 + d3) / (6.0 * safe)),
                None => 0.0,
            };

            let window_start = i.saturating_sub(2);
            let window: Vec<f64> = school[window_start..=i]
                .iter()
                .map(|r| r.total_enrolment as f64)
                .collect();
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let volatility = if window.len() >= 2 {
                sample_std(&window).min(VOLATILITY_CAP)
            } else {
                0.0
            };

            let safe_enrolment = enrolment.max(1.0);
            let category = row
                .school_category
                .map_or(CATEGORY_FALLBACK, |c| c as f64);

            let features = [
                enrolment,
                lag1.unwrap_or(0.0),
                lag2.unwrap_or(0.0),
                growth_rate,
                growth_rate_lag1,
                category,
                row.total_teachers as f64,
                row.total_class_rooms as f64,
                row.usable_class_rooms as f64,
                row.classroom_gap as f64,
                row.teacher_gap as f64,
                row.risk_score,
                row.teacher_deficit_ratio,
                row.classroom_deficit_ratio,
                district_encoder.encode(&row.district),
                management_encoder.encode(&row.management_type),
                mean,
                volatility,
                row.total_teachers as f64 / safe_enrolment,
                row.usable_class_rooms as f64 / safe_enrolment,
            ];

            let next = school.get(i + 1).map(|r| r.total_enrolment as f64);
            let target_growth = next.map(|n| clip((n - enrolment) / safe_enrolment));

            rows.push(FeatureRow {
                school_id: row.school_id.clone(),
                academic_year: row.academic_year.clone(),
                features,
                target_growth,
                target_enrolment: next,
                total_enrolment: enrolment,
                wma_growth,
                school_category: row.school_category,
                usable_class_rooms: row.usable_class_rooms,
                total_teachers: row.total_teachers,
            });
        }
    }

    FeatureSet {
        rows,
        district_encoder,
        management_encoder,
    }
}

/// Splits the ordered panel into per-school contiguous slices.
fn group_by_school(panel: &[PanelRow]) -> Vec<&[PanelRow]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=panel.len() {
        if i == panel.len() || panel[i].school_id != panel[start].school_id {
            groups.push(&panel[start..i]);
            start = i;
        }
    }
    groups
}

/// Sample standard deviation (ddof = 1).
fn sample_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(school: &str, year: &str, enrolment: i64) -> PanelRow {
        PanelRow {
            school_id: school.to_string(),
            academic_year: year.to_string(),
            total_enrolment: enrolment,
            school_category: Some(1),
            district: "D1".to_string(),
            management_type: "GOVT".to_string(),
            total_class_rooms: 4,
            usable_class_rooms: 3,
            classroom_gap: 1,
            risk_score: 0.2,
            teacher_deficit_ratio: 0.1,
            classroom_deficit_ratio: 0.1,
            total_teachers: 4,
            teacher_gap: 0,
        }
    }

    fn feature(row: &FeatureRow, name: &str) -> f64 {
        let idx = FEATURE_COLUMNS.iter().position(|c| *c == name).unwrap();
        row.features[idx]
    }

    #[test]
    fn column_order_is_stable() {
        assert_eq!(FEATURE_COLUMNS.len(), N_FEATURES);
        assert_eq!(FEATURE_COLUMNS[0], "total_enrolment");
        assert_eq!(FEATURE_COLUMNS[N_FEATURES - 1], "rooms_per_student");
    }

    #[test]
    fn lags_and_growth_follow_each_school() {
        let panel = vec![
            row("S1", "2022-23", 100),
            row("S1", "2023-24", 110),
            row("S1", "2024-25", 121),
            row("S2", "2024-25", 50),
        ];
        let set = build_features(&panel, 0.30);
        let s1_last = &set.rows[2];
        assert_eq!(feature(s1_last, "enrolment_lag1"), 110.0);
        assert_eq!(feature(s1_last, "enrolment_lag2"), 100.0);
        assert!((feature(s1_last, "growth_rate") - 0.1).abs() < 1e-9);
        assert!((feature(s1_last, "growth_rate_lag1") - 0.1).abs() < 1e-9);

        // S2 has no history: its lags are 0, not S1's trailing values.
        let s2 = &set.rows[3];
        assert_eq!(feature(s2, "enrolment_lag1"), 0.0);
        assert_eq!(feature(s2, "growth_rate"), 0.0);
    }

    #[test]
    fn target_is_next_year_growth_clipped() {
        let panel = vec![
            row("S1", "2022-23", 100),
            row("S1", "2023-24", 200),
            row("S1", "2024-25", 190),
        ];
        let set = build_features(&panel, 0.30);
        // 100 -> 200 is +100%, clipped to the cap.
        assert!((set.rows[0].target_growth.unwrap() - 0.30).abs() < 1e-12);
        // 200 -> 190 is -5%.
        assert!((set.rows[1].target_growth.unwrap() + 0.05).abs() < 1e-12);
        assert!(set.rows[2].target_growth.is_none());
    }

    #[test]
    fn rolling_stats_use_trailing_window() {
        let panel = vec![
            row("S1", "2021-22", 100),
            row("S1", "2022-23", 110),
            row("S1", "2023-24", 120),
            row("S1", "2024-25", 130),
        ];
        let set = build_features(&panel, 0.30);
        assert_eq!(feature(&set.rows[0], "enrolment_3yr_mean"), 100.0);
        assert_eq!(feature(&set.rows[1], "enrolment_3yr_mean"), 105.0);
        assert_eq!(feature(&set.rows[3], "enrolment_3yr_mean"), 120.0);
        // First year has fewer than two observations: volatility 0.
        assert_eq!(feature(&set.rows[0], "enrolment_volatility"), 0.0);
        // std([110, 120, 130]) = 10.
        assert!((feature(&set.rows[3], "enrolment_volatility") - 10.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_is_capped() {
        let panel = vec![
            row("S1", "2022-23", 0),
            row("S1", "2023-24", 10_000),
        ];
        let set = build_features(&panel, 0.30);
        assert_eq!(feature(&set.rows[1], "enrolment_volatility"), VOLATILITY_CAP);
    }

    #[test]
    fn label_encoding_is_sorted_unique() {
        let encoder = LabelEncoder::fit(["delta", "alpha", "delta", "beta"].into_iter());
        assert_eq!(encoder.classes(), &["alpha", "beta", "delta"]);
        assert_eq!(encoder.encode("alpha"), 0.0);
        assert_eq!(encoder.encode("delta"), 2.0);
        // Unseen classes get the out-of-vocabulary index.
        assert_eq!(encoder.encode("zeta"), 3.0);
    }

    #[test]
    fn wma_replica_matches_the_sql_stage() {
        let panel = vec![
            row("S1", "2021-22", 100),
            row("S1", "2022-23", 110),
            row("S1", "2023-24", 120),
            row("S1", "2024-25", 130),
        ];
        let set = build_features(&panel, 0.30);
        assert!((set.rows[3].wma_growth - 60.0 / 720.0).abs() < 1e-12);
    }
}

//! The ML forecasting run.
//!
//! Extract → engineer → split → train → evaluate → calibrate → project →
//! write. The temporal split holds out the most recent observed
//! transition for evaluation; tiny schools are excluded from training
//! because their growth rates are dominated by quantisation noise.
//!
//! Projection makes exactly one growth prediction per school at the base
//! year and compounds it over the three horizons - predictions are never
//! fed back as next-year inputs.

use chrono::Utc;
use rusqlite::params;
use tracing::info;

use disha_core::{AcademicYear, Error, PipelineConfig, Result, SchoolCategory};
use disha_store::{BatchReport, Store, run_batch};

use crate::artifact::{EvalMetrics, ModelArtifact};
use crate::features::{FEATURE_COLUMNS, FeatureRow, N_FEATURES, build_features};
use crate::gbm::GradientBoostedRegressor;
use crate::panel::{extract_panel, panel_years};

const STAGE: &str = "ml-forecast";

/// Rows per INSERT chunk when writing the forecast table.
const WRITE_CHUNK: usize = 5_000;

/// One projected horizon row, ready to insert.
struct ProjectionRow {
    school_id: String,
    forecast_year: String,
    years_ahead: i64,
    base_enrolment: i64,
    growth_rate: f64,
    projected_enrolment: i64,
    projected_classrooms_req: i64,
    projected_teachers_req: i64,
    current_classrooms: i64,
    current_teachers: i64,
    projected_classroom_gap: i64,
    projected_teacher_gap: i64,
    school_category: Option<i64>,
}

/// Trains the growth model, projects three horizons from the latest
/// observed year, writes `ml_enrolment_forecast`, and publishes the
/// model artefact.
///
/// # Errors
///
/// Returns [`Error::EmptyBatch`] when the panel holds fewer than two
/// academic years (no transition to learn from), or storage errors from
/// extraction and writing.
pub fn run_ml_forecast(
    store: &mut Store,
    config: &PipelineConfig,
) -> Result<(Vec<BatchReport>, ModelArtifact)> {
    let growth_cap = config.forecast.growth_cap;

    // 1. Extract + engineer.
    let panel = extract_panel(store.conn())?;
    let years = panel_years(&panel);
    if years.len() < 2 {
        return Err(Error::EmptyBatch {
            stage: STAGE,
            academic_year: "*".to_string(),
        });
    }
    let latest = years[years.len() - 1].clone();
    let test_source = years[years.len() - 2].clone();
    let feature_set = build_features(&panel, growth_cap);
    info!(
        rows = feature_set.rows.len(),
        years = years.len(),
        base_year = %latest,
        "panel engineered"
    );

    // 2. Temporal split. The held-out transition is the one feeding the
    // most recent observed year.
    let min_enrolment = config.ml.min_enrolment_train as f64;
    let train_rows: Vec<&FeatureRow> = feature_set
        .rows
        .iter()
        .filter(|r| {
            r.target_growth.is_some()
                && r.academic_year != test_source
                && r.total_enrolment >= min_enrolment
        })
        .collect();
    let test_rows: Vec<&FeatureRow> = feature_set
        .rows
        .iter()
        .filter(|r| r.target_growth.is_some() && r.academic_year == test_source)
        .collect();
    if train_rows.is_empty() {
        return Err(Error::EmptyBatch {
            stage: STAGE,
            academic_year: test_source,
        });
    }
    info!(
        n_train = train_rows.len(),
        n_test = test_rows.len(),
        held_out = %test_source,
        "temporal split"
    );

    // 3. Train.
    let (x_train, y_train) = to_matrix(&train_rows);
    let model = GradientBoostedRegressor::fit(&x_train, N_FEATURES, &y_train, &config.ml);

    // 4. Evaluate against the WMA baseline on the held-out transition.
    let metrics = evaluate(&model, &test_rows, growth_cap, train_rows.len());
    info!(
        n_trees = model.n_trees(),
        growth_r2 = metrics.growth_r2_test,
        growth_mae = metrics.growth_mae_test,
        wma_mae = metrics.growth_mae_wma,
        enrolment_mae = metrics.enrolment_mae_test,
        "model evaluated"
    );

    // 5. Bias calibration over the projection set: shift predictions so
    // their mean matches the training-target mean, then re-clip.
    let base_rows: Vec<&FeatureRow> = feature_set
        .rows
        .iter()
        .filter(|r| r.academic_year == latest)
        .collect();
    let raw_predictions: Vec<f64> = base_rows
        .iter()
        .map(|r| model.predict(&r.features))
        .collect();
    let train_mean = mean(&y_train);
    let prediction_mean = mean(&raw_predictions);
    let bias_shift = train_mean - prediction_mean;
    let calibrated: Vec<f64> = raw_predictions
        .iter()
        .map(|p| (p + bias_shift).clamp(-growth_cap, growth_cap))
        .collect();
    info!(
        raw_mean = prediction_mean,
        shift = bias_shift,
        "bias calibration applied"
    );

    // 6. Project three horizons per school.
    let base_year = AcademicYear::parse(&latest)?;
    let rows = project(&base_rows, &calibrated, &base_year, config);

    // 7. Write, one transaction: delete-then-insert in chunks.
    let model_version = config.ml.model_version.clone();
    let report = run_batch(store, STAGE, &latest, &config.execution, |tx| {
        tx.execute("DELETE FROM ml_enrolment_forecast", [])?;
        let mut stmt = tx.prepare(
            "INSERT INTO ml_enrolment_forecast
                 (school_id, base_year, forecast_year, years_ahead,
                  base_enrolment, growth_rate_used, projected_enrolment,
                  projected_classrooms_req, projected_teachers_req,
                  current_classrooms, current_teachers,
                  projected_classroom_gap, projected_teacher_gap,
                  school_category, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        let mut written = 0_u64;
        for chunk in rows.chunks(WRITE_CHUNK) {
            for row in chunk {
                stmt.execute(params![
                    row.school_id,
                    latest,
                    row.forecast_year,
                    row.years_ahead,
                    row.base_enrolment,
                    row.growth_rate,
                    row.projected_enrolment,
                    row.projected_classrooms_req,
                    row.projected_teachers_req,
                    row.current_classrooms,
                    row.current_teachers,
                    row.projected_classroom_gap,
                    row.projected_teacher_gap,
                    row.school_category,
                    model_version,
                ])?;
                written += 1;
            }
        }
        Ok(written)
    })?;

    // 8. Publish the artefact atomically alongside the table.
    let artifact = ModelArtifact {
        model_version: config.ml.model_version.clone(),
        trained_at: Utc::now(),
        feature_columns: FEATURE_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        district_encoder: feature_set.district_encoder.clone(),
        management_encoder: feature_set.management_encoder.clone(),
        bias_shift,
        model,
        metrics,
    };
    artifact.save(&config.ml.artifact_path)?;
    info!(
        path = %config.ml.artifact_path.display(),
        version = %artifact.model_version,
        "model artefact published"
    );

    Ok((vec![report], artifact))
}

fn to_matrix(rows: &[&FeatureRow]) -> (Vec<f64>, Vec<f64>) {
    let mut x = Vec::with_capacity(rows.len() * N_FEATURES);
    let mut y = Vec::with_capacity(rows.len());
    for row in rows {
        x.extend_from_slice(&row.features);
        // Split construction guarantees a target.
        y.push(row.target_growth.unwrap_or(0.0));
    }
    (x, y)
}

fn evaluate(
    model: &GradientBoostedRegressor,
    test_rows: &[&FeatureRow],
    growth_cap: f64,
    n_train: usize,
) -> EvalMetrics {
    if test_rows.is_empty() {
        return EvalMetrics {
            n_train,
            ..EvalMetrics::default()
        };
    }

    let actual_growth: Vec<f64> = test_rows
        .iter()
        .map(|r| r.target_growth.unwrap_or(0.0))
        .collect();
    let predicted_growth: Vec<f64> = test_rows
        .iter()
        .map(|r| model.predict(&r.features).clamp(-growth_cap, growth_cap))
        .collect();
    let wma_growth: Vec<f64> = test_rows
        .iter()
        .map(|r| r.wma_growth.clamp(-growth_cap, growth_cap))
        .collect();

    let mut enrolment_abs_error = 0.0;
    let mut enrolment_pct_error = 0.0;
    for (row, g) in test_rows.iter().zip(&predicted_growth) {
        let actual = row.target_enrolment.unwrap_or(0.0);
        let projected = (row.total_enrolment * (1.0 + g)).round().max(0.0);
        enrolment_abs_error += (actual - projected).abs();
        enrolment_pct_error += (actual - projected).abs() / actual.max(1.0);
    }
    let n = test_rows.len() as f64;

    EvalMetrics {
        growth_r2_test: r_squared(&actual_growth, &predicted_growth),
        growth_mae_test: mean_absolute_error(&actual_growth, &predicted_growth),
        enrolment_mae_test: enrolment_abs_error / n,
        enrolment_mape_test: enrolment_pct_error / n * 100.0,
        growth_mae_wma: mean_absolute_error(&actual_growth, &wma_growth),
        n_train,
        n_test: test_rows.len(),
    }
}

fn project(
    base_rows: &[&FeatureRow],
    growth: &[f64],
    base_year: &AcademicYear,
    config: &PipelineConfig,
) -> Vec<ProjectionRow> {
    let mut rows = Vec::with_capacity(base_rows.len() * 3);
    for (row, &g) in base_rows.iter().zip(growth) {
        let (classroom_norm, ptr_norm) = norms_for(row.school_category, config);
        for k in 1..=3_u16 {
            let factor = (1.0 + g).powi(i32::from(k));
            let projected = (row.total_enrolment * factor).round().max(0.0) as i64;
            let classrooms_req = ceil_div(projected, classroom_norm);
            let teachers_req = ceil_div(projected, ptr_norm);
            rows.push(ProjectionRow {
                school_id: row.school_id.clone(),
                forecast_year: base_year.offset(k).to_string(),
                years_ahead: i64::from(k),
                base_enrolment: row.total_enrolment as i64,
                growth_rate: g,
                projected_enrolment: projected,
                projected_classrooms_req: classrooms_req,
                projected_teachers_req: teachers_req,
                current_classrooms: row.usable_class_rooms,
                current_teachers: row.total_teachers,
                projected_classroom_gap: (classrooms_req - row.usable_class_rooms).max(0),
                projected_teacher_gap: (teachers_req - row.total_teachers).max(0),
                school_category: row.school_category,
            });
        }
    }
    rows
}

fn norms_for(category: Option<i64>, config: &PipelineConfig) -> (i64, i64) {
    match category.and_then(|c| SchoolCategory::new(c).ok()) {
        Some(cat) => (
            i64::from(config.classroom_norms.for_category(cat)),
            i64::from(config.ptr_norms.for_category(cat)),
        ),
        None => (
            i64::from(config.classroom_norms.fallback()),
            i64::from(config.ptr_norms.fallback()),
        ),
    }
}

const fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

fn r_squared(actual: &[f64], predicted: &[f64]) -> f64 {
    let mean_actual = mean(actual);
    let ss_total: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
    let ss_residual: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    if ss_total <= f64::EPSILON {
        return 0.0;
    }
    1.0 - ss_residual / ss_total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_matches_requirement_semantics() {
        assert_eq!(ceil_div(0, 30), 0);
        assert_eq!(ceil_div(90, 30), 3);
        assert_eq!(ceil_div(91, 30), 4);
        assert_eq!(ceil_div(400, 35), 12);
    }

    #[test]
    fn r_squared_of_perfect_fit_is_one() {
        let actual = [0.1, 0.2, 0.3];
        assert!((r_squared(&actual, &actual) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn r_squared_of_mean_prediction_is_zero() {
        let actual = [0.1, 0.2, 0.3];
        let predicted = [0.2, 0.2, 0.2];
        assert!(r_squared(&actual, &predicted).abs() < 1e-12);
    }
}

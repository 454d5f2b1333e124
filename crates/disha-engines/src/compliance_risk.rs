//! Stage 3 — compliance risk engine.
//!
//! Three ordered set-oriented passes over `infrastructure_details`:
//!
//! - **Pass A** (per year): teacher/classroom deficit ratios, clipped to
//!   `[0, 1]`.
//! - **Pass B** (whole series): year-over-year enrolment growth via a
//!   `LAG` window partitioned by school. NULL when there is no previous
//!   year or the previous enrolment is 0.
//! - **Pass C** (per year): the weighted composite `risk_score` and its
//!   four-tier `risk_level` classification.
//!
//! The weights sum to 1 and each term lies in `[0, 1]`, so the composite
//! is guaranteed to lie in `[0, 1]`; a post-write check enforces this and
//! quarantines the table if it ever fails.

use rusqlite::{Connection, Transaction, params};
use tracing::info;

use disha_core::{Error, PipelineConfig, Result};
use disha_store::{BatchReport, Store, run_batch};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{infrastructure_years, restrict, run_per_year};

const STAGE: &str = "compliance-risk";

const DEFICIT_RATIOS_SQL: &str = "
    UPDATE infrastructure_details AS i
    SET teacher_deficit_ratio = d.teacher_ratio,
        classroom_deficit_ratio = d.classroom_ratio
    FROM (
        SELECT
            i2.id AS row_id,
            MIN(1.0, CAST(COALESCE(t.teacher_gap, 0) AS REAL)
                     / MAX(COALESCE(t.required_teachers, 0), 1)) AS teacher_ratio,
            MIN(1.0, CAST(COALESCE(i2.classroom_gap, 0) AS REAL)
                     / MAX(COALESCE(i2.required_class_rooms, 0), 1)) AS classroom_ratio
        FROM infrastructure_details AS i2
        LEFT JOIN teacher_metrics AS t
            ON t.school_id = i2.school_id AND t.academic_year = i2.academic_year
        WHERE i2.academic_year = ?1
    ) AS d
    WHERE i.id = d.row_id
";

/// The LAG window runs over the full per-school series; only the outer
/// join filters rows, so first years correctly see a NULL predecessor.
const GROWTH_SQL: &str = "
    UPDATE infrastructure_details AS i
    SET enrolment_growth_rate = d.growth
    FROM (
        SELECT
            school_id,
            academic_year,
            CASE
                WHEN prev_enrolment IS NULL OR prev_enrolment <= 0 THEN NULL
                ELSE (CAST(total_enrolment AS REAL) - prev_enrolment) / prev_enrolment
            END AS growth
        FROM (
            SELECT
                school_id,
                academic_year,
                total_enrolment,
                LAG(total_enrolment, 1) OVER (
                    PARTITION BY school_id ORDER BY academic_year
                ) AS prev_enrolment
            FROM yearly_metrics
        )
    ) AS d
    WHERE i.school_id = d.school_id AND i.academic_year = d.academic_year
";

/// `risk_level_of` is the registered scalar backed by
/// `RiskLevel::from_score`, so the band cuts live in one place.
const SCORE_SQL: &str = "
    UPDATE infrastructure_details AS i
    SET risk_score = d.score,
        risk_level = risk_level_of(d.score, ?5, ?6, ?7)
    FROM (
        SELECT
            id AS row_id,
            ?2 * COALESCE(teacher_deficit_ratio, 0.0)
              + ?3 * COALESCE(classroom_deficit_ratio, 0.0)
              + ?4 * MIN(ABS(COALESCE(enrolment_growth_rate, 0.0)), ?8) AS score
        FROM infrastructure_details
        WHERE academic_year = ?1
    ) AS d
    WHERE i.id = d.row_id
";

/// The compliance risk stage.
pub struct ComplianceRiskEngine;

impl Engine for ComplianceRiskEngine {
    fn id(&self) -> StageId {
        StageId::ComplianceRisk
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        let years = restrict(
            infrastructure_years(store.conn())?,
            options.year.as_ref(),
            STAGE,
        )?;

        let mut reports =
            run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
                let rows = tx.execute(DEFICIT_RATIOS_SQL, params![year])?;
                Ok(rows as u64)
            })?;

        // Growth needs the whole panel in one window pass; `--year` must
        // not narrow it or every school would lose its partition history.
        reports.push(run_batch(store, STAGE, "*", &config.execution, |tx| {
            let rows = tx.execute(GROWTH_SQL, [])?;
            Ok(rows as u64)
        })?);

        let weights = config.risk_weights.clone();
        let bands = config.risk_bands.clone();
        let growth_cap = config.forecast.growth_cap_risk;
        reports.extend(run_per_year(
            store,
            STAGE,
            &years,
            config,
            &options.cancel,
            |tx, year| score_year(tx, year, &weights, &bands, growth_cap),
        )?);

        verify_score_range(store.conn())?;
        summarise(store.conn());
        Ok(reports)
    }
}

fn score_year(
    tx: &Transaction<'_>,
    year: &str,
    weights: &disha_core::config::RiskWeights,
    bands: &disha_core::config::RiskBands,
    growth_cap: f64,
) -> rusqlite::Result<u64> {
    let rows = tx.execute(
        SCORE_SQL,
        params![
            year,
            weights.teacher,
            weights.classroom,
            weights.growth,
            bands.critical,
            bands.high,
            bands.moderate,
            growth_cap
        ],
    )?;
    Ok(rows as u64)
}

/// Post-write invariant: `0 <= risk_score <= 1`. Must never fire.
fn verify_score_range(conn: &Connection) -> Result<()> {
    let out_of_range: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM infrastructure_details
             WHERE risk_score IS NOT NULL AND (risk_score < 0.0 OR risk_score > 1.0)",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::storage_with_source("risk score range check", e))?;
    if out_of_range > 0 {
        return Err(Error::invariant(
            "infrastructure_details",
            format!("{out_of_range} rows with risk_score outside [0, 1]"),
        ));
    }
    Ok(())
}

fn summarise(conn: &Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN risk_level = 'CRITICAL' THEN 1 ELSE 0 END),
                SUM(CASE WHEN risk_level = 'HIGH' THEN 1 ELSE 0 END),
                SUM(CASE WHEN risk_level = 'MODERATE' THEN 1 ELSE 0 END),
                SUM(CASE WHEN risk_level = 'LOW' THEN 1 ELSE 0 END)
         FROM infrastructure_details
         WHERE risk_score IS NOT NULL",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        },
    );
    if let Ok((scored, critical, high, moderate, low)) = result {
        info!(scored, critical, high, moderate, low, "risk classification complete");
    }
}

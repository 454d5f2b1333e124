//! Stage 7 — district compliance index.
//!
//! Aggregates school-level risk and deficit data to one scorecard per
//! district-year, then two whole-table window passes: the year-over-year
//! change in average risk (LAG partitioned by district) and the state
//! rank (RANK partitioned by year, worst average risk first). The letter
//! grade comes from the configured A/B/C/D cut points on average risk.

use rusqlite::{Connection, Transaction, params};
use tracing::info;

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store, run_batch};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{restrict, run_per_year, scored_years};

const STAGE: &str = "district-compliance";

const DELETE_SQL: &str = "DELETE FROM district_compliance_index WHERE academic_year = ?1";

/// `compliance_grade_of` is the registered scalar backed by
/// `ComplianceGrade::from_avg_risk`.
const POPULATE_SQL: &str = "
    INSERT INTO district_compliance_index
        (district, academic_year, total_schools, avg_risk_score,
         pct_critical, pct_high, pct_moderate, pct_low, pct_high_critical,
         total_classroom_deficit, total_teacher_deficit, total_enrolment,
         avg_classroom_condition, compliance_grade)
    SELECT
        s.district,
        i.academic_year,
        COUNT(DISTINCT i.school_id) AS total_schools,
        AVG(i.risk_score) AS avg_risk_score,
        SUM(CASE WHEN i.risk_level = 'CRITICAL' THEN 1 ELSE 0 END) * 100.0
            / COUNT(*) AS pct_critical,
        SUM(CASE WHEN i.risk_level = 'HIGH' THEN 1 ELSE 0 END) * 100.0
            / COUNT(*) AS pct_high,
        SUM(CASE WHEN i.risk_level = 'MODERATE' THEN 1 ELSE 0 END) * 100.0
            / COUNT(*) AS pct_moderate,
        SUM(CASE WHEN i.risk_level = 'LOW' THEN 1 ELSE 0 END) * 100.0
            / COUNT(*) AS pct_low,
        SUM(CASE WHEN i.risk_level IN ('HIGH', 'CRITICAL') THEN 1 ELSE 0 END) * 100.0
            / COUNT(*) AS pct_high_critical,
        SUM(MAX(COALESCE(i.classroom_gap, 0), 0)) AS total_classroom_deficit,
        SUM(MAX(COALESCE(t.teacher_gap, 0), 0)) AS total_teacher_deficit,
        SUM(COALESCE(y.total_enrolment, 0)) AS total_enrolment,
        AVG(i.classroom_condition_score) AS avg_classroom_condition,
        compliance_grade_of(AVG(i.risk_score), ?2, ?3, ?4, ?5) AS compliance_grade
    FROM infrastructure_details AS i
    JOIN schools AS s ON s.school_id = i.school_id
    LEFT JOIN teacher_metrics AS t
        ON t.school_id = i.school_id AND t.academic_year = i.academic_year
    LEFT JOIN yearly_metrics AS y
        ON y.school_id = i.school_id AND y.academic_year = i.academic_year
    WHERE i.risk_score IS NOT NULL AND i.academic_year = ?1
    GROUP BY s.district, i.academic_year
";

/// YoY change needs every year populated first, so it runs as a
/// whole-table pass after the per-year aggregation.
const YOY_SQL: &str = "
    UPDATE district_compliance_index AS d
    SET yoy_risk_change = x.delta
    FROM (
        SELECT
            district,
            academic_year,
            avg_risk_score - LAG(avg_risk_score, 1) OVER (
                PARTITION BY district ORDER BY academic_year
            ) AS delta
        FROM district_compliance_index
    ) AS x
    WHERE d.district = x.district AND d.academic_year = x.academic_year
";

const RANK_SQL: &str = "
    UPDATE district_compliance_index AS d
    SET state_rank = x.rnk
    FROM (
        SELECT
            district,
            academic_year,
            RANK() OVER (
                PARTITION BY academic_year
                ORDER BY avg_risk_score DESC
            ) AS rnk
        FROM district_compliance_index
    ) AS x
    WHERE d.district = x.district AND d.academic_year = x.academic_year
";

/// The district compliance stage.
pub struct DistrictComplianceEngine;

impl Engine for DistrictComplianceEngine {
    fn id(&self) -> StageId {
        StageId::DistrictCompliance
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        let years = restrict(
            scored_years(store.conn())?,
            options.year.as_ref(),
            STAGE,
        )?;

        let grades = config.compliance_grades.clone();
        let mut reports =
            run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
                apply_year(tx, year, &grades)
            })?;

        reports.push(run_batch(store, STAGE, "*", &config.execution, |tx| {
            let yoy = tx.execute(YOY_SQL, [])?;
            let ranked = tx.execute(RANK_SQL, [])?;
            Ok((yoy + ranked) as u64)
        })?);

        summarise(store.conn());
        Ok(reports)
    }
}

fn apply_year(
    tx: &Transaction<'_>,
    year: &str,
    grades: &disha_core::config::ComplianceGradeBands,
) -> rusqlite::Result<u64> {
    tx.execute(DELETE_SQL, params![year])?;
    let inserted = tx.execute(
        POPULATE_SQL,
        params![year, grades.a, grades.b, grades.c, grades.d],
    )?;
    Ok(inserted as u64)
}

fn summarise(conn: &Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                COUNT(DISTINCT district),
                SUM(CASE WHEN compliance_grade = 'A' THEN 1 ELSE 0 END),
                SUM(CASE WHEN compliance_grade = 'F' THEN 1 ELSE 0 END),
                COALESCE(SUM(total_classroom_deficit), 0),
                COALESCE(SUM(total_teacher_deficit), 0)
         FROM district_compliance_index",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        },
    );
    if let Ok((rows, districts, grade_a, grade_f, classroom_deficit, teacher_deficit)) = result {
        info!(
            rows,
            districts, grade_a, grade_f, classroom_deficit, teacher_deficit,
            "district compliance aggregated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store(rows: &[(&str, &str, &str, f64, &str, i64)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        disha_store::schema::bootstrap(store.conn()).unwrap();
        for (school, district, year, score, level, classroom_gap) in rows {
            store
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO schools (school_id, district) VALUES (?1, ?2)",
                    params![school, district],
                )
                .unwrap();
            store
                .conn()
                .execute(
                    "INSERT INTO infrastructure_details
                         (school_id, academic_year, risk_score, risk_level, classroom_gap)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![school, year, score, level, classroom_gap],
                )
                .unwrap();
        }
        store
    }

    fn run(store: &mut Store) {
        let config = PipelineConfig::default();
        let options = RunOptions::default();
        DistrictComplianceEngine
            .run(store, &config, &options)
            .unwrap();
    }

    #[test]
    fn aggregates_one_row_per_district_year() {
        let mut store = seeded_store(&[
            ("S1", "D1", "2024-25", 0.10, "LOW", 1),
            ("S2", "D1", "2024-25", 0.30, "MODERATE", 2),
            ("S3", "D2", "2024-25", 0.70, "CRITICAL", 3),
        ]);
        run(&mut store);
        let (districts, total_schools): (i64, i64) = store
            .conn()
            .query_row(
                "SELECT COUNT(*), SUM(total_schools) FROM district_compliance_index",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(districts, 2);
        assert_eq!(total_schools, 3);
    }

    #[test]
    fn grade_and_percentages() {
        let mut store = seeded_store(&[
            ("S1", "D1", "2024-25", 0.10, "LOW", 0),
            ("S2", "D1", "2024-25", 0.30, "MODERATE", 0),
            ("S3", "D1", "2024-25", 0.50, "HIGH", 0),
            ("S4", "D1", "2024-25", 0.70, "CRITICAL", 0),
        ]);
        run(&mut store);
        let (avg, pct_critical, pct_high_critical, grade): (f64, f64, f64, String) = store
            .conn()
            .query_row(
                "SELECT avg_risk_score, pct_critical, pct_high_critical, compliance_grade
                 FROM district_compliance_index WHERE district = 'D1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert!((avg - 0.40).abs() < 1e-9);
        assert!((pct_critical - 25.0).abs() < 1e-9);
        assert!((pct_high_critical - 50.0).abs() < 1e-9);
        assert_eq!(grade, "C");
    }

    #[test]
    fn yoy_and_rank_fill_after_all_years() {
        let mut store = seeded_store(&[
            ("S1", "D1", "2023-24", 0.40, "HIGH", 0),
            ("S1", "D1", "2024-25", 0.30, "MODERATE", 0),
            ("S2", "D2", "2023-24", 0.20, "MODERATE", 0),
            ("S2", "D2", "2024-25", 0.60, "CRITICAL", 0),
        ]);
        run(&mut store);
        let (yoy, rank): (Option<f64>, i64) = store
            .conn()
            .query_row(
                "SELECT yoy_risk_change, state_rank FROM district_compliance_index
                 WHERE district = 'D1' AND academic_year = '2024-25'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!((yoy.unwrap() + 0.10).abs() < 1e-9);
        // D2 has the worse 2024-25 average (0.60 > 0.30), so D1 ranks 2nd.
        assert_eq!(rank, 2);

        let first_year_yoy: Option<f64> = store
            .conn()
            .query_row(
                "SELECT yoy_risk_change FROM district_compliance_index
                 WHERE district = 'D1' AND academic_year = '2023-24'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(first_year_yoy.is_none());
    }
}

//! Stage 9 — weighted-moving-average enrolment forecast.
//!
//! From the latest observed year, projects enrolment three years forward
//! per school using a 3/2/1-weighted average of the last three enrolment
//! deltas, clipped to the configured growth cap, then translates the
//! projections into classroom/teacher requirements and gaps against
//! current capacity.
//!
//! The LAG windows run over the **full** per-school series in an inner
//! relation; the base-year filter is applied only in the enclosing scope.
//! Filtering first would collapse each partition to one row and return
//! NULL lags for every school - that failure mode is pinned by a test.

use rusqlite::params;
use tracing::{info, warn};

use disha_core::{AcademicYear, PipelineConfig, Result};
use disha_store::{BatchReport, Store, run_batch};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::latest_enrolment_year;

const STAGE: &str = "wma-forecast";

const DELETE_SQL: &str = "DELETE FROM enrolment_forecast";

const FORECAST_SQL: &str = "
    WITH lagged AS (
        SELECT
            school_id,
            academic_year,
            COALESCE(total_enrolment, 0) AS enrolment,
            LAG(total_enrolment, 1) OVER school_window AS e1,
            LAG(total_enrolment, 2) OVER school_window AS e2,
            LAG(total_enrolment, 3) OVER school_window AS e3
        FROM yearly_metrics
        WINDOW school_window AS (PARTITION BY school_id ORDER BY academic_year)
    ),
    growth AS (
        SELECT
            school_id,
            enrolment AS base_enrolment,
            CASE
                WHEN e1 IS NULL OR e1 <= 0 THEN 0.0
                ELSE (3.0 * (enrolment - e1)
                    + 2.0 * COALESCE(e1 - e2, 0)
                    + 1.0 * COALESCE(e2 - e3, 0)) / (6.0 * e1)
            END AS raw_growth
        FROM lagged
        WHERE academic_year = ?1
    ),
    clipped AS (
        SELECT
            school_id,
            base_enrolment,
            MIN(?2, MAX(-?2, raw_growth)) AS growth_rate
        FROM growth
    ),
    based AS (
        SELECT
            c.school_id,
            c.base_enrolment,
            c.growth_rate,
            COALESCE(i.usable_class_rooms, 0) AS current_classrooms,
            COALESCE(t.total_teachers, 0) AS current_teachers,
            s.school_category,
            CASE
                WHEN s.school_category BETWEEN 1 AND 3 THEN ?3
                WHEN s.school_category IN (4, 5) THEN ?4
                ELSE ?5
            END AS classroom_norm,
            CASE
                WHEN s.school_category IN (1, 2, 3, 5, 6) THEN ?6
                ELSE ?7
            END AS ptr_norm
        FROM clipped AS c
        JOIN schools AS s ON s.school_id = c.school_id
        LEFT JOIN infrastructure_details AS i
            ON i.school_id = c.school_id AND i.academic_year = ?1
        LEFT JOIN teacher_metrics AS t
            ON t.school_id = c.school_id AND t.academic_year = ?1
    ),
    horizons AS (
        SELECT 1 AS years_ahead
        UNION ALL SELECT 2
        UNION ALL SELECT 3
    ),
    projected AS (
        SELECT
            b.*,
            h.years_ahead,
            CAST(MAX(0, ROUND(b.base_enrolment *
                CASE h.years_ahead
                    WHEN 1 THEN (1.0 + b.growth_rate)
                    WHEN 2 THEN (1.0 + b.growth_rate) * (1.0 + b.growth_rate)
                    ELSE (1.0 + b.growth_rate) * (1.0 + b.growth_rate)
                         * (1.0 + b.growth_rate)
                END)) AS INTEGER) AS projected_enrolment
        FROM based AS b
        CROSS JOIN horizons AS h
    )
    INSERT INTO enrolment_forecast
        (school_id, base_year, forecast_year, years_ahead, base_enrolment,
         growth_rate_used, projected_enrolment, projected_classrooms_req,
         projected_teachers_req, current_classrooms, current_teachers,
         projected_classroom_gap, projected_teacher_gap, school_category)
    SELECT
        school_id,
        ?1,
        CASE years_ahead WHEN 1 THEN ?8 WHEN 2 THEN ?9 ELSE ?10 END,
        years_ahead,
        base_enrolment,
        growth_rate,
        projected_enrolment,
        (projected_enrolment + classroom_norm - 1) / classroom_norm,
        (projected_enrolment + ptr_norm - 1) / ptr_norm,
        current_classrooms,
        current_teachers,
        MAX(0, (projected_enrolment + classroom_norm - 1) / classroom_norm
               - current_classrooms),
        MAX(0, (projected_enrolment + ptr_norm - 1) / ptr_norm
               - current_teachers),
        school_category
    FROM projected
";

/// The WMA forecast stage.
pub struct WmaForecastEngine;

impl Engine for WmaForecastEngine {
    fn id(&self) -> StageId {
        StageId::WmaForecast
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        let Some(base_year) = latest_enrolment_year(store.conn())? else {
            return Err(disha_core::Error::EmptyBatch {
                stage: STAGE,
                academic_year: "*".to_string(),
            });
        };
        if let Some(requested) = &options.year {
            if requested.to_string() != base_year {
                warn!(
                    requested = %requested,
                    base_year = %base_year,
                    "forecast base year is always the latest observed year; skipping"
                );
                return Ok(Vec::new());
            }
        }

        let base = AcademicYear::parse(&base_year)?;
        let horizon_years: Vec<String> =
            (1..=3).map(|k| base.offset(k).to_string()).collect();
        let growth_cap = config.forecast.growth_cap;
        let classroom = config.classroom_norms.clone();
        let ptr = config.ptr_norms.clone();

        let report = run_batch(store, STAGE, &base_year, &config.execution, |tx| {
            tx.execute(DELETE_SQL, [])?;
            let rows = tx.execute(
                FORECAST_SQL,
                params![
                    base_year,
                    growth_cap,
                    i64::from(classroom.primary),
                    i64::from(classroom.upper_primary),
                    i64::from(classroom.secondary),
                    i64::from(ptr.elementary),
                    i64::from(ptr.secondary),
                    horizon_years[0],
                    horizon_years[1],
                    horizon_years[2]
                ],
            )?;
            Ok(rows as u64)
        })?;

        summarise(store.conn());
        Ok(vec![report])
    }
}

fn summarise(conn: &rusqlite::Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                COUNT(DISTINCT school_id),
                COALESCE(SUM(CASE WHEN years_ahead = 3
                                  THEN projected_classroom_gap ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN years_ahead = 3
                                  THEN projected_teacher_gap ELSE 0 END), 0)
         FROM enrolment_forecast",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        },
    );
    if let Ok((rows, schools, t3_classroom_gap, t3_teacher_gap)) = result {
        info!(
            rows,
            schools, t3_classroom_gap, t3_teacher_gap, "enrolment forecast generated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store(series: &[(&str, &[(&str, i64)])]) -> Store {
        let store = Store::open_in_memory().unwrap();
        disha_store::schema::bootstrap(store.conn()).unwrap();
        for (school, years) in series {
            store
                .conn()
                .execute(
                    "INSERT INTO schools (school_id, district, school_category)
                     VALUES (?1, 'D1', 1)",
                    [school],
                )
                .unwrap();
            for (year, enrolment) in *years {
                store
                    .conn()
                    .execute(
                        "INSERT INTO yearly_metrics
                             (school_id, academic_year, total_enrolment)
                         VALUES (?1, ?2, ?3)",
                        params![school, year, enrolment],
                    )
                    .unwrap();
            }
        }
        store
    }

    fn run(store: &mut Store) {
        let config = PipelineConfig::default();
        let options = RunOptions::default();
        WmaForecastEngine.run(store, &config, &options).unwrap();
    }

    fn projections(store: &Store, school: &str) -> Vec<(i64, f64, i64, String)> {
        let conn = store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT years_ahead, growth_rate_used, projected_enrolment, forecast_year
                 FROM enrolment_forecast WHERE school_id = ?1 ORDER BY years_ahead",
            )
            .unwrap();
        stmt.query_map([school], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
    }

    #[test]
    fn weighted_growth_projects_three_horizons() {
        let mut store = seeded_store(&[(
            "S1",
            &[
                ("2021-22", 100),
                ("2022-23", 110),
                ("2023-24", 120),
                ("2024-25", 130),
            ],
        )]);
        run(&mut store);
        let rows = projections(&store, "S1");
        assert_eq!(rows.len(), 3);
        // g = (3*10 + 2*10 + 10) / (6 * 120) = 60/720 = 0.0833..
        let g = rows[0].1;
        assert!((g - 60.0 / 720.0).abs() < 1e-9, "growth {g}");
        assert_eq!(rows[0].2, 141);
        assert_eq!(rows[1].2, 153);
        assert_eq!(rows[2].2, 165);
        assert_eq!(rows[0].3, "2025-26");
        assert_eq!(rows[2].3, "2027-28");
    }

    #[test]
    fn lags_survive_the_base_year_filter() {
        // The classic pitfall: filtering to the base year before the LAG
        // window loses the partition and every growth collapses to 0.
        // A school with genuine history must project nonzero growth.
        let mut store = seeded_store(&[(
            "S1",
            &[("2022-23", 100), ("2023-24", 150), ("2024-25", 225)],
        )]);
        run(&mut store);
        let rows = projections(&store, "S1");
        assert!(rows[0].1 > 0.0, "growth must see prior years, got {}", rows[0].1);
    }

    #[test]
    fn growth_is_clipped_to_cap() {
        let mut store = seeded_store(&[(
            "S1",
            &[("2023-24", 100), ("2024-25", 300)],
        )]);
        run(&mut store);
        let rows = projections(&store, "S1");
        assert!((rows[0].1 - 0.30).abs() < 1e-9, "clipped growth {}", rows[0].1);
    }

    #[test]
    fn single_year_school_projects_flat() {
        let mut store = seeded_store(&[("S1", &[("2024-25", 200)])]);
        run(&mut store);
        let rows = projections(&store, "S1");
        assert_eq!(rows.len(), 3);
        assert!((rows[0].1).abs() < f64::EPSILON);
        assert_eq!(rows[2].2, 200);
    }

    #[test]
    fn shrinking_school_never_projects_negative() {
        let mut store = seeded_store(&[(
            "S1",
            &[("2022-23", 40), ("2023-24", 10), ("2024-25", 1)],
        )]);
        run(&mut store);
        for (_, growth, projected, _) in projections(&store, "S1") {
            assert!(projected >= 0);
            assert!(growth >= -0.30 - 1e-12);
        }
    }

    #[test]
    fn requirements_use_category_norms() {
        let mut store = seeded_store(&[("S1", &[("2024-25", 90)])]);
        store
            .conn()
            .execute_batch(
                "INSERT INTO infrastructure_details
                     (school_id, academic_year, usable_class_rooms)
                 VALUES ('S1', '2024-25', 2);
                 INSERT INTO teacher_metrics
                     (school_id, academic_year, total_teachers)
                 VALUES ('S1', '2024-25', 1);",
            )
            .unwrap();
        run(&mut store);
        let (rooms_req, rooms_gap, teachers_req, teachers_gap): (i64, i64, i64, i64) = store
            .conn()
            .query_row(
                "SELECT projected_classrooms_req, projected_classroom_gap,
                        projected_teachers_req, projected_teacher_gap
                 FROM enrolment_forecast WHERE years_ahead = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        // Category 1: norm 30, PTR 30; flat projection of 90.
        assert_eq!(rooms_req, 3);
        assert_eq!(rooms_gap, 1);
        assert_eq!(teachers_req, 3);
        assert_eq!(teachers_gap, 2);
    }
}

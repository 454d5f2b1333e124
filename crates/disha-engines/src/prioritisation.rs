//! Stage 4 — prioritisation engine.
//!
//! Per academic year, deletes and re-inserts `school_priority_index`:
//! state-wide `RANK` (ties share a rank, the next rank skips),
//! `PERCENT_RANK` percentile, a district-partitioned rank, and percentile
//! buckets with strict `<` cut points. A second pass flags schools whose
//! two preceding years were both HIGH or CRITICAL.

use rusqlite::{Transaction, params};
use tracing::info;

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{restrict, run_per_year, scored_years};

const STAGE: &str = "prioritisation";

const DELETE_SQL: &str = "DELETE FROM school_priority_index WHERE academic_year = ?1";

/// `priority_bucket_of` is the registered scalar backed by
/// `PriorityBucket::from_percentile` (strict `<` at each cut point).
const POPULATE_SQL: &str = "
    INSERT INTO school_priority_index
        (school_id, academic_year, risk_score, risk_rank, district_rank,
         percentile, priority_bucket)
    SELECT
        i.school_id,
        i.academic_year,
        i.risk_score,
        RANK() OVER state_window AS risk_rank,
        RANK() OVER (
            PARTITION BY s.district ORDER BY i.risk_score DESC
        ) AS district_rank,
        PERCENT_RANK() OVER state_window AS percentile,
        priority_bucket_of(
            PERCENT_RANK() OVER state_window, ?2, ?3, ?4
        ) AS priority_bucket
    FROM infrastructure_details AS i
    JOIN schools AS s ON s.school_id = i.school_id
    WHERE i.risk_score IS NOT NULL AND i.academic_year = ?1
    WINDOW state_window AS (ORDER BY i.risk_score DESC)
";

/// The persistence flag consults the two preceding years' levels; the
/// LAG windows run over the full per-school history, with the year filter
/// applied only on the priority rows being updated.
const PERSISTENT_SQL: &str = "
    UPDATE school_priority_index AS p
    SET persistent_high_risk = d.flag
    FROM (
        SELECT
            school_id,
            academic_year,
            CASE
                WHEN prev1_level IN ('HIGH', 'CRITICAL')
                 AND prev2_level IN ('HIGH', 'CRITICAL') THEN 1
                ELSE 0
            END AS flag
        FROM (
            SELECT
                school_id,
                academic_year,
                LAG(risk_level, 1) OVER school_window AS prev1_level,
                LAG(risk_level, 2) OVER school_window AS prev2_level
            FROM infrastructure_details
            WINDOW school_window AS (PARTITION BY school_id ORDER BY academic_year)
        )
    ) AS d
    WHERE p.school_id = d.school_id
      AND p.academic_year = d.academic_year
      AND p.academic_year = ?1
";

/// The prioritisation stage.
pub struct PrioritisationEngine;

impl Engine for PrioritisationEngine {
    fn id(&self) -> StageId {
        StageId::Prioritisation
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

        let cuts = config.priority_buckets.clone();
        let reports = run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
            apply_year(tx, year, &cuts)
        })?;

        summarise(store.conn());
        Ok(reports)
    }
}

fn apply_year(
    tx: &Transaction<'_>,
    year: &str,
    cuts: &disha_core::config::PriorityCutPoints,
) -> rusqlite::Result<u64> {
    tx.execute(DELETE_SQL, params![year])?;
    let inserted = tx.execute(
        POPULATE_SQL,
        params![year, cuts.top_5, cuts.top_10, cuts.top_20],
    )?;
    tx.execute(PERSISTENT_SQL, params![year])?;
    Ok(inserted as u64)
}

fn summarise(conn: &rusqlite::Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN priority_bucket = 'TOP_5' THEN 1 ELSE 0 END),
                SUM(CASE WHEN priority_bucket = 'TOP_10' THEN 1 ELSE 0 END),
                SUM(CASE WHEN priority_bucket = 'TOP_20' THEN 1 ELSE 0 END),
                SUM(persistent_high_risk)
         FROM school_priority_index",
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
    if let Ok((rows, top5, top10, top20, persistent)) = result {
        info!(rows, top5, top10, top20, persistent, "priority index rebuilt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Seeds schools with pre-computed risk columns so the stage can run
    /// in isolation.
    fn seeded_store(scores: &[(&str, &str, f64, &str)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        disha_store::schema::bootstrap(store.conn()).unwrap();
        for (school, year, score, level) in scores {
            store
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO schools (school_id, district, school_category)
                     VALUES (?1, 'D1', 1)",
                    [school],
                )
                .unwrap();
            store
                .conn()
                .execute(
                    "INSERT INTO infrastructure_details
                         (school_id, academic_year, risk_score, risk_level)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![school, year, score, level],
                )
                .unwrap();
        }
        store
    }

    fn run(store: &mut Store) {
        let config = PipelineConfig::default();
        let options = RunOptions::default();
        PrioritisationEngine.run(store, &config, &options).unwrap();
    }

    #[test]
    fn sole_school_ranks_first_in_top5() {
        let mut store = seeded_store(&[("S1", "2024-25", 0.20, "MODERATE")]);
        run(&mut store);
        let (rank, percentile, bucket, persistent): (i64, f64, String, i64) = store
            .conn()
            .query_row(
                "SELECT risk_rank, percentile, priority_bucket, persistent_high_risk
                 FROM school_priority_index WHERE school_id = 'S1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(rank, 1);
        assert!(percentile.abs() < f64::EPSILON);
        assert_eq!(bucket, "TOP_5");
        assert_eq!(persistent, 0);
    }

    #[test]
    fn ties_share_rank_and_next_rank_skips() {
        let mut store = seeded_store(&[
            ("S1", "2024-25", 0.80, "CRITICAL"),
            ("S2", "2024-25", 0.80, "CRITICAL"),
            ("S3", "2024-25", 0.10, "LOW"),
        ]);
        run(&mut store);
        let ranks: Vec<(String, i64)> = {
            let conn = store.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT school_id, risk_rank FROM school_priority_index
                     ORDER BY school_id",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        assert_eq!(
            ranks,
            vec![
                ("S1".to_string(), 1),
                ("S2".to_string(), 1),
                ("S3".to_string(), 3)
            ]
        );
    }

    #[test]
    fn persistence_needs_two_elevated_predecessors() {
        let mut store = seeded_store(&[
            ("S1", "2020-21", 0.50, "HIGH"),
            ("S1", "2021-22", 0.50, "HIGH"),
            ("S1", "2022-23", 0.50, "HIGH"),
            ("S1", "2023-24", 0.70, "CRITICAL"),
        ]);
        run(&mut store);
        let flags: Vec<(String, i64)> = {
            let conn = store.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT academic_year, persistent_high_risk
                     FROM school_priority_index ORDER BY academic_year",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        assert_eq!(
            flags,
            vec![
                ("2020-21".to_string(), 0),
                ("2021-22".to_string(), 0),
                ("2022-23".to_string(), 1),
                ("2023-24".to_string(), 1),
            ]
        );
    }

    #[test]
    fn exactly_one_row_per_scored_school_year() {
        let mut store = seeded_store(&[
            ("S1", "2023-24", 0.5, "HIGH"),
            ("S1", "2024-25", 0.4, "HIGH"),
            ("S2", "2024-25", 0.1, "LOW"),
        ]);
        run(&mut store);
        run(&mut store); // idempotent re-run keeps cardinality
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM school_priority_index", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 3);
    }
}

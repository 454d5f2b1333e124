//! Stage 8 — proposal validation engine.
//!
//! Two per-year passes. The first synthesises demand proposals from the
//! computed gaps with deterministic pseudo-random noise: the multiplier
//! is `0.70 + (crc32(school_id ∥ year ∥ salt) mod 80) / 100`, giving
//! `[0.70, 1.49]`. CRC32 is fixed by the reproducibility contract - the
//! same facts always yield byte-identical proposals.
//!
//! The second pass validates each proposal against the gaps with an
//! ordered rule table (first match wins) and scores confidence by how far
//! both request ratios sit from 1.0.

use rusqlite::{Transaction, params};
use tracing::info;

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{restrict, run_per_year, scored_years};

const STAGE: &str = "proposal-validation";

/// Requests above this multiple of the gap are rejected outright.
const OVER_REQUEST_LIMIT: f64 = 1.50;
/// Requests above this multiple (but within the rejection limit) are
/// flagged for review.
const MODERATE_OVER_LIMIT: f64 = 1.20;
/// Requests below this fraction of a positive gap are flagged.
const UNDER_REQUEST_LIMIT: f64 = 0.50;

const DELETE_VALIDATIONS_SQL: &str = "DELETE FROM proposal_validations WHERE academic_year = ?1";
const DELETE_PROPOSALS_SQL: &str = "DELETE FROM school_demand_proposals WHERE academic_year = ?1";

const SEED_PROPOSALS_SQL: &str = "
    INSERT INTO school_demand_proposals
        (school_id, academic_year, classrooms_requested, teachers_requested,
         proposal_source)
    SELECT
        i.school_id,
        i.academic_year,
        CAST(MAX(0, ROUND(
            MAX(COALESCE(i.classroom_gap, 0), 0)
            * (?2 + (crc32(i.school_id || i.academic_year || 'cr') % ?3) / 100.0)
        )) AS INTEGER),
        CAST(MAX(0, ROUND(
            MAX(COALESCE(t.teacher_gap, 0), 0)
            * (?2 + (crc32(i.school_id || i.academic_year || 'tr') % ?3) / 100.0)
        )) AS INTEGER),
        'SIMULATION'
    FROM infrastructure_details AS i
    LEFT JOIN teacher_metrics AS t
        ON t.school_id = i.school_id AND t.academic_year = i.academic_year
    WHERE i.academic_year = ?1
";

/// The reason code is decided first (ordered CASE, first match wins);
/// the decision is a pure function of the reason, so the two can never
/// disagree.
const VALIDATE_SQL: &str = "
    WITH joined AS (
        SELECT
            p.school_id,
            p.academic_year,
            p.classrooms_requested AS req_cr,
            p.teachers_requested AS req_tr,
            MAX(COALESCE(i.classroom_gap, 0), 0) AS gap_cr,
            MAX(COALESCE(t.teacher_gap, 0), 0) AS gap_tr
        FROM school_demand_proposals AS p
        JOIN infrastructure_details AS i
            ON i.school_id = p.school_id AND i.academic_year = p.academic_year
        LEFT JOIN teacher_metrics AS t
            ON t.school_id = p.school_id AND t.academic_year = p.academic_year
        WHERE p.academic_year = ?1
    ),
    measured AS (
        SELECT
            *,
            CAST(req_cr AS REAL) / MAX(gap_cr, 1) AS ratio_cr,
            CAST(req_tr AS REAL) / MAX(gap_tr, 1) AS ratio_tr
        FROM joined
    ),
    decided AS (
        SELECT
            *,
            CASE
                WHEN gap_cr = 0 AND gap_tr = 0 AND (req_cr > 0 OR req_tr > 0)
                    THEN 'NO_DEFICIT'
                WHEN ratio_cr > ?2 THEN 'CLASSROOM_OVER_REQUEST'
                WHEN ratio_tr > ?2 THEN 'TEACHER_OVER_REQUEST'
                WHEN ratio_cr > ?3 THEN 'CLASSROOM_MODERATE_OVER'
                WHEN ratio_tr > ?3 THEN 'TEACHER_MODERATE_OVER'
                WHEN ratio_cr < ?4 AND gap_cr > 0 THEN 'CLASSROOM_UNDER_REQUEST'
                WHEN ratio_tr < ?4 AND gap_tr > 0 THEN 'TEACHER_UNDER_REQUEST'
                WHEN req_cr = 0 AND req_tr = 0 AND gap_cr = 0 AND gap_tr = 0
                    THEN 'NO_REQUEST'
                ELSE 'WITHIN_TOLERANCE'
            END AS reason_code
        FROM measured
    )
    INSERT INTO proposal_validations
        (school_id, academic_year, classrooms_requested, teachers_requested,
         classroom_gap, teacher_gap, classroom_ratio, teacher_ratio,
         decision_status, reason_code, confidence_score)
    SELECT
        school_id,
        academic_year,
        req_cr,
        req_tr,
        gap_cr,
        gap_tr,
        ratio_cr,
        ratio_tr,
        CASE
            WHEN reason_code IN
                ('NO_DEFICIT', 'CLASSROOM_OVER_REQUEST', 'TEACHER_OVER_REQUEST')
                THEN 'REJECTED'
            WHEN reason_code IN
                ('CLASSROOM_MODERATE_OVER', 'TEACHER_MODERATE_OVER',
                 'CLASSROOM_UNDER_REQUEST', 'TEACHER_UNDER_REQUEST')
                THEN 'FLAGGED'
            ELSE 'ACCEPTED'
        END AS decision_status,
        reason_code,
        MAX(0.0, 1.0 - (ABS(1.0 - ratio_cr) + ABS(1.0 - ratio_tr)) / 2.0)
            AS confidence_score
    FROM decided
";

/// The proposal validation stage.
pub struct ProposalValidationEngine;

impl Engine for ProposalValidationEngine {
    fn id(&self) -> StageId {
        StageId::ProposalValidation
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

        let noise = config.proposal_noise.clone();
        let reports = run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
            apply_year(tx, year, &noise)
        })?;

        summarise(store.conn());
        Ok(reports)
    }
}

fn apply_year(
    tx: &Transaction<'_>,
    year: &str,
    noise: &disha_core::config::ProposalNoise,
) -> rusqlite::Result<u64> {
    tx.execute(DELETE_VALIDATIONS_SQL, params![year])?;
    tx.execute(DELETE_PROPOSALS_SQL, params![year])?;
    tx.execute(
        SEED_PROPOSALS_SQL,
        params![year, noise.base, i64::from(noise.steps)],
    )?;
    let validated = tx.execute(
        VALIDATE_SQL,
        params![
            year,
            OVER_REQUEST_LIMIT,
            MODERATE_OVER_LIMIT,
            UNDER_REQUEST_LIMIT
        ],
    )?;
    Ok(validated as u64)
}

fn summarise(conn: &rusqlite::Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN decision_status = 'ACCEPTED' THEN 1 ELSE 0 END),
                SUM(CASE WHEN decision_status = 'FLAGGED' THEN 1 ELSE 0 END),
                SUM(CASE WHEN decision_status = 'REJECTED' THEN 1 ELSE 0 END),
                COALESCE(AVG(confidence_score), 0.0)
         FROM proposal_validations",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        },
    );
    if let Ok((rows, accepted, flagged, rejected, avg_confidence)) = result {
        info!(
            rows,
            accepted, flagged, rejected, avg_confidence, "proposals validated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store(rows: &[(&str, i64, i64)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        disha_store::schema::bootstrap(store.conn()).unwrap();
        for (school, classroom_gap, teacher_gap) in rows {
            store
                .conn()
                .execute(
                    "INSERT INTO schools (school_id, district) VALUES (?1, 'D1')",
                    [school],
                )
                .unwrap();
            store
                .conn()
                .execute(
                    "INSERT INTO infrastructure_details
                         (school_id, academic_year, classroom_gap, risk_score, risk_level)
                     VALUES (?1, '2024-25', ?2, 0.3, 'MODERATE')",
                    params![school, classroom_gap],
                )
                .unwrap();
            store
                .conn()
                .execute(
                    "INSERT INTO teacher_metrics
                         (school_id, academic_year, total_teachers, teacher_gap)
                     VALUES (?1, '2024-25', 4, ?2)",
                    params![school, teacher_gap],
                )
                .unwrap();
        }
        store
    }

    fn run(store: &mut Store) {
        let config = PipelineConfig::default();
        let options = RunOptions::default();
        ProposalValidationEngine
            .run(store, &config, &options)
            .unwrap();
    }

    /// Overrides the synthetic proposal for one school to probe a rule.
    fn force_request(store: &Store, school: &str, req_cr: i64, req_tr: i64) {
        store
            .conn()
            .execute(
                "UPDATE school_demand_proposals
                 SET classrooms_requested = ?2, teachers_requested = ?3
                 WHERE school_id = ?1",
                params![school, req_cr, req_tr],
            )
            .unwrap();
    }

    fn revalidate(store: &mut Store) {
        let conn = store.conn_mut();
        let tx = conn.transaction().unwrap();
        tx.execute(DELETE_VALIDATIONS_SQL, params!["2024-25"]).unwrap();
        tx.execute(
            VALIDATE_SQL,
            params![
                "2024-25",
                OVER_REQUEST_LIMIT,
                MODERATE_OVER_LIMIT,
                UNDER_REQUEST_LIMIT
            ],
        )
        .unwrap();
        tx.commit().unwrap();
    }

    fn verdict(store: &Store, school: &str) -> (String, String, f64) {
        store
            .conn()
            .query_row(
                "SELECT decision_status, reason_code, confidence_score
                 FROM proposal_validations WHERE school_id = ?1",
                [school],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap()
    }

    #[test]
    fn proposals_are_deterministic_across_runs() {
        let mut store = seeded_store(&[("S1", 4, 2), ("S2", 7, 3), ("S3", 0, 5)]);
        run(&mut store);
        let first: Vec<(String, i64, i64)> = {
            let conn = store.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT school_id, classrooms_requested, teachers_requested
                     FROM school_demand_proposals ORDER BY school_id",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        run(&mut store);
        let second: Vec<(String, i64, i64)> = {
            let conn = store.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT school_id, classrooms_requested, teachers_requested
                     FROM school_demand_proposals ORDER BY school_id",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn noise_factor_stays_in_contracted_range() {
        let mut store = seeded_store(&[("S1", 100, 100)]);
        run(&mut store);
        let (req_cr, req_tr): (i64, i64) = store
            .conn()
            .query_row(
                "SELECT classrooms_requested, teachers_requested
                 FROM school_demand_proposals WHERE school_id = 'S1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        // gap 100 * [0.70, 1.49] rounds into [70, 149].
        assert!((70..=149).contains(&req_cr), "req_cr {req_cr}");
        assert!((70..=149).contains(&req_tr), "req_tr {req_tr}");
    }

    #[test]
    fn zero_gap_keeps_request_at_zero() {
        let mut store = seeded_store(&[("S3", 0, 0)]);
        run(&mut store);
        let (req_cr, req_tr): (i64, i64) = store
            .conn()
            .query_row(
                "SELECT classrooms_requested, teachers_requested
                 FROM school_demand_proposals WHERE school_id = 'S3'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((req_cr, req_tr), (0, 0));
    }

    #[test]
    fn over_request_is_rejected_with_reason() {
        let mut store = seeded_store(&[("S1", 4, 2)]);
        run(&mut store);
        // gap_cr = 4, gap_tr = 2, requested (7, 2): ratio 1.75 / 1.0.
        force_request(&store, "S1", 7, 2);
        revalidate(&mut store);
        let (decision, reason, confidence) = verdict(&store, "S1");
        assert_eq!(decision, "REJECTED");
        assert_eq!(reason, "CLASSROOM_OVER_REQUEST");
        assert!((confidence - 0.625).abs() < 1e-9, "confidence {confidence}");
    }

    #[test]
    fn rules_walk_the_bands_monotonically() {
        let mut store = seeded_store(&[("S1", 10, 0)]);
        run(&mut store);
        // Within [0.5, 1.2] x gap: accepted.
        force_request(&store, "S1", 10, 0);
        revalidate(&mut store);
        assert_eq!(verdict(&store, "S1").0, "ACCEPTED");

        // Just past 1.2 x gap: flagged.
        force_request(&store, "S1", 13, 0);
        revalidate(&mut store);
        let (decision, reason, _) = verdict(&store, "S1");
        assert_eq!((decision.as_str(), reason.as_str()),
                   ("FLAGGED", "CLASSROOM_MODERATE_OVER"));

        // Exactly 1.5 x gap stays flagged; past it is rejected.
        force_request(&store, "S1", 15, 0);
        revalidate(&mut store);
        assert_eq!(verdict(&store, "S1").0, "FLAGGED");
        force_request(&store, "S1", 16, 0);
        revalidate(&mut store);
        assert_eq!(verdict(&store, "S1").0, "REJECTED");

        // Under half the gap: flagged as an under-request.
        force_request(&store, "S1", 4, 0);
        revalidate(&mut store);
        let (decision, reason, _) = verdict(&store, "S1");
        assert_eq!((decision.as_str(), reason.as_str()),
                   ("FLAGGED", "CLASSROOM_UNDER_REQUEST"));
    }

    #[test]
    fn requesting_with_no_deficit_is_rejected() {
        let mut store = seeded_store(&[("S1", 0, 0)]);
        run(&mut store);
        force_request(&store, "S1", 2, 0);
        revalidate(&mut store);
        let (decision, reason, _) = verdict(&store, "S1");
        assert_eq!((decision.as_str(), reason.as_str()), ("REJECTED", "NO_DEFICIT"));
    }

    #[test]
    fn nothing_requested_nothing_owed_is_no_request() {
        let mut store = seeded_store(&[("S1", 0, 0)]);
        run(&mut store);
        let (decision, reason, _) = verdict(&store, "S1");
        assert_eq!((decision.as_str(), reason.as_str()), ("ACCEPTED", "NO_REQUEST"));
    }
}

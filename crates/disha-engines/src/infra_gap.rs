//! Stage 1 — infrastructure gap engine.
//!
//! For each academic year, computes `required_class_rooms` from the
//! category classroom norm and `classroom_gap` against usable classrooms.
//! One set-oriented UPDATE per year batch; all arithmetic happens in the
//! store. Rows with missing enrolment get a requirement of 0; rows with a
//! missing category fall back to the most permissive norm (with a warning
//! tallied per batch); a category outside the UDISE+ range aborts the
//! batch naming the offending school.

use rusqlite::{Connection, Transaction, params};
use tracing::{info, warn};

use disha_core::{Error, PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{infrastructure_years, restrict, run_per_year};

const STAGE: &str = "infra-gap";

/// Integer-ceiling requirement plus clamped gap, joined per year.
///
/// A NULL `school_category` falls through every CASE arm to the secondary
/// norm, which is the documented fallback.
const UPDATE_SQL: &str = "
    UPDATE infrastructure_details AS i
    SET required_class_rooms = d.required_rooms,
        classroom_gap = MAX(0, d.required_rooms - COALESCE(i.usable_class_rooms, 0))
    FROM (
        SELECT
            x.row_id,
            CASE
                WHEN COALESCE(y.total_enrolment, 0) <= 0 THEN 0
                ELSE (y.total_enrolment + x.norm - 1) / x.norm
            END AS required_rooms
        FROM (
            SELECT
                i2.id AS row_id,
                i2.school_id,
                CASE
                    WHEN s.school_category BETWEEN 1 AND 3 THEN ?2
                    WHEN s.school_category IN (4, 5) THEN ?3
                    ELSE ?4
                END AS norm
            FROM infrastructure_details AS i2
            LEFT JOIN schools AS s ON s.school_id = i2.school_id
            WHERE i2.academic_year = ?1
        ) AS x
        LEFT JOIN yearly_metrics AS y
            ON y.school_id = x.school_id AND y.academic_year = ?1
    ) AS d
    WHERE i.id = d.row_id
";

/// The infrastructure gap stage.
pub struct InfraGapEngine;

impl Engine for InfraGapEngine {
    fn id(&self) -> StageId {
        StageId::InfraGap
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
        reject_unknown_categories(store.conn())?;
        warn_missing_categories(store.conn());

        let norms = config.classroom_norms.clone();
        let reports = run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
            apply_year(tx, year, &norms)
        })?;

        summarise(store.conn());
        Ok(reports)
    }
}

fn apply_year(
    tx: &Transaction<'_>,
    year: &str,
    norms: &disha_core::ClassroomNorms,
) -> rusqlite::Result<u64> {
    let rows = tx.execute(
        UPDATE_SQL,
        params![
            year,
            i64::from(norms.primary),
            i64::from(norms.upper_primary),
            i64::from(norms.secondary)
        ],
    )?;
    Ok(rows as u64)
}

/// A category outside 1..=11 is a configuration error, surfaced with the
/// offending row identity per the error taxonomy.
pub(crate) fn reject_unknown_categories(conn: &Connection) -> Result<()> {
    let offending: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT i.school_id, i.academic_year, s.school_category
             FROM infrastructure_details AS i
             JOIN schools AS s ON s.school_id = i.school_id
             WHERE s.school_category IS NOT NULL
               AND (s.school_category < 1 OR s.school_category > 11)
             ORDER BY i.school_id, i.academic_year
             LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::storage_with_source("category scan", other)),
        })?;

    match offending {
        None => Ok(()),
        Some((school_id, academic_year, category)) => Err(Error::UnknownCategory {
            school_id,
            academic_year,
            category,
        }),
    }
}

fn warn_missing_categories(conn: &Connection) {
    let missing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM infrastructure_details AS i
             LEFT JOIN schools AS s ON s.school_id = i.school_id
             WHERE s.school_category IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if missing > 0 {
        warn!(rows = missing, "rows without a school category fall back to the secondary norm");
    }
}

fn summarise(conn: &Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN classroom_gap > 0 THEN 1 ELSE 0 END),
                COALESCE(SUM(classroom_gap), 0)
         FROM infrastructure_details
         WHERE required_class_rooms IS NOT NULL",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        },
    );
    if let Ok((rows, schools_with_gap, total_gap)) = result {
        info!(rows, schools_with_gap, total_gap, "classroom gaps computed");
    }
}

//! Stage 2 — teacher adequacy engine.
//!
//! Same shape as the infrastructure gap engine: per-year set-oriented
//! UPDATE deriving `required_teachers` from the category PTR norm and
//! `teacher_gap` against teachers on roll.

use rusqlite::{Transaction, params};
use tracing::info;

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::infra_gap::reject_unknown_categories;
use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{restrict, run_per_year};

const STAGE: &str = "teacher-adequacy";

const UPDATE_SQL: &str = "
    UPDATE teacher_metrics AS t
    SET required_teachers = d.required_teachers,
        teacher_gap = MAX(0, d.required_teachers - COALESCE(t.total_teachers, 0))
    FROM (
        SELECT
            x.row_id,
            CASE
                WHEN COALESCE(y.total_enrolment, 0) <= 0 THEN 0
                ELSE (y.total_enrolment + x.ptr - 1) / x.ptr
            END AS required_teachers
        FROM (
            SELECT
                t2.id AS row_id,
                t2.school_id,
                CASE
                    WHEN s.school_category IN (1, 2, 3, 5, 6) THEN ?2
                    ELSE ?3
                END AS ptr
            FROM teacher_metrics AS t2
            LEFT JOIN schools AS s ON s.school_id = t2.school_id
            WHERE t2.academic_year = ?1
        ) AS x
        LEFT JOIN yearly_metrics AS y
            ON y.school_id = x.school_id AND y.academic_year = ?1
    ) AS d
    WHERE t.id = d.row_id
";

/// The teacher adequacy stage.
pub struct TeacherAdequacyEngine;

impl Engine for TeacherAdequacyEngine {
    fn id(&self) -> StageId {
        StageId::TeacherAdequacy
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        // Teacher facts batch by the same year set as infrastructure so
        // the two gap engines stay aligned.
        let years = restrict(
            teacher_years(store.conn())?,
            options.year.as_ref(),
            STAGE,
        )?;
        reject_unknown_categories(store.conn())?;

        let norms = config.ptr_norms.clone();
        let reports = run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
            apply_year(tx, year, &norms)
        })?;

        summarise(store.conn());
        Ok(reports)
    }
}

fn teacher_years(conn: &rusqlite::Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT academic_year FROM teacher_metrics ORDER BY academic_year")
        .map_err(|e| disha_core::Error::storage_with_source("prepare year scan", e))?;
    let years = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| disha_core::Error::storage_with_source("scan years", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| disha_core::Error::storage_with_source("collect years", e))?;
    Ok(years)
}

fn apply_year(
    tx: &Transaction<'_>,
    year: &str,
    norms: &disha_core::PtrNorms,
) -> rusqlite::Result<u64> {
    let rows = tx.execute(
        UPDATE_SQL,
        params![
            year,
            i64::from(norms.elementary),
            i64::from(norms.secondary)
        ],
    )?;
    Ok(rows as u64)
}

fn summarise(conn: &rusqlite::Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN teacher_gap > 0 THEN 1 ELSE 0 END),
                COALESCE(SUM(teacher_gap), 0)
         FROM teacher_metrics
         WHERE required_teachers IS NOT NULL",
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
        info!(rows, schools_with_gap, total_gap, "teacher gaps computed");
    }
}

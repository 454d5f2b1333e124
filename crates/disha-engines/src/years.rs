//! Year batch discovery shared by the per-year engines.

use rusqlite::Connection;

use disha_core::{AcademicYear, Error, Result};

/// Distinct academic years present in `infrastructure_details`, ascending.
pub fn infrastructure_years(conn: &Connection) -> Result<Vec<String>> {
    distinct_years(
        conn,
        "SELECT DISTINCT academic_year FROM infrastructure_details ORDER BY academic_year",
    )
}

/// Distinct academic years whose risk scores have been computed, ascending.
pub fn scored_years(conn: &Connection) -> Result<Vec<String>> {
    distinct_years(
        conn,
        "SELECT DISTINCT academic_year FROM infrastructure_details
         WHERE risk_score IS NOT NULL ORDER BY academic_year",
    )
}

/// The latest academic year observed in `yearly_metrics`, if any.
pub fn latest_enrolment_year(conn: &Connection) -> Result<Option<String>> {
    conn.query_row("SELECT MAX(academic_year) FROM yearly_metrics", [], |row| {
        row.get(0)
    })
    .map_err(|e| Error::storage_with_source("latest enrolment year", e))
}

/// Applies the `--year` restriction to a discovered year list.
///
/// # Errors
///
/// Returns [`Error::EmptyBatch`] when the requested year has no upstream
/// rows for this stage, or when the stage's upstream is empty altogether
/// (running a mid-pipeline cut against a store whose upstream stages
/// never ran).
pub fn restrict(
    years: Vec<String>,
    requested: Option<&AcademicYear>,
    stage: &'static str,
) -> Result<Vec<String>> {
    if years.is_empty() {
        return Err(Error::EmptyBatch {
            stage,
            academic_year: requested.map_or_else(|| "*".to_string(), ToString::to_string),
        });
    }
    match requested {
        None => Ok(years),
        Some(year) => {
            let wanted = year.to_string();
            if years.contains(&wanted) {
                Ok(vec![wanted])
            } else {
                Err(Error::EmptyBatch {
                    stage,
                    academic_year: wanted,
                })
            }
        }
    }
}

/// Runs one batch per year, attempting every year even when an earlier
/// batch fails; the first error is returned after the loop so committed
/// years stay committed and a re-run replays only idempotent work.
pub fn run_per_year<F>(
    store: &mut disha_store::Store,
    stage: &'static str,
    years: &[String],
    config: &disha_core::PipelineConfig,
    cancel: &disha_core::CancelFlag,
    batch: F,
) -> Result<Vec<disha_store::BatchReport>>
where
    F: Fn(&rusqlite::Transaction<'_>, &str) -> rusqlite::Result<u64>,
{
    let mut reports = Vec::with_capacity(years.len());
    let mut first_error = None;

    for year in years {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { stage });
        }
        match disha_store::run_batch(store, stage, year, &config.execution, |tx| {
            batch(tx, year)
        }) {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::error!(stage, year = %year, error = %e, "year batch failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        None => Ok(reports),
        Some(e) => Err(e),
    }
}

fn distinct_years(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::storage_with_source("prepare year scan", e))?;
    let years = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::storage_with_source("scan years", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::storage_with_source("collect years", e))?;
    Ok(years)
}

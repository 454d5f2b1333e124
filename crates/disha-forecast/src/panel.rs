//! Panel extraction.
//!
//! Pulls the full school-year panel - enrolment joined with the computed
//! gap and risk columns - ordered by `(school_id, academic_year)` so the
//! feature builder can walk each school's history as a contiguous slice.
//! This is the one place the ML stage retrieves rows into application
//! memory; everything upstream stays set-oriented.

use rusqlite::Connection;

use disha_core::{Error, Result};

/// One school-year observation of the training panel.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelRow {
    /// School identity.
    pub school_id: String,
    /// Academic year of the observation.
    pub academic_year: String,
    /// Total enrolment (0 when the yearly fact is missing).
    pub total_enrolment: i64,
    /// UDISE+ category, if the school record carries one.
    pub school_category: Option<i64>,
    /// District name (label-encoded downstream).
    pub district: String,
    /// Management type (label-encoded downstream).
    pub management_type: String,
    /// Total classrooms on record.
    pub total_class_rooms: i64,
    /// Usable classrooms on record.
    pub usable_class_rooms: i64,
    /// Stage-1 classroom gap.
    pub classroom_gap: i64,
    /// Stage-3 composite risk score.
    pub risk_score: f64,
    /// Stage-3 teacher deficit ratio.
    pub teacher_deficit_ratio: f64,
    /// Stage-3 classroom deficit ratio.
    pub classroom_deficit_ratio: f64,
    /// Teachers on roll.
    pub total_teachers: i64,
    /// Stage-2 teacher gap.
    pub teacher_gap: i64,
}

const EXTRACT_SQL: &str = "
    SELECT
        y.school_id,
        y.academic_year,
        COALESCE(y.total_enrolment, 0),
        s.school_category,
        COALESCE(s.district, 'UNK'),
        COALESCE(s.management_type, 'UNK'),
        COALESCE(i.total_class_rooms, 0),
        COALESCE(i.usable_class_rooms, 0),
        COALESCE(i.classroom_gap, 0),
        COALESCE(i.risk_score, 0.0),
        COALESCE(i.teacher_deficit_ratio, 0.0),
        COALESCE(i.classroom_deficit_ratio, 0.0),
        COALESCE(t.total_teachers, 0),
        COALESCE(t.teacher_gap, 0)
    FROM yearly_metrics AS y
    JOIN schools AS s ON s.school_id = y.school_id
    LEFT JOIN infrastructure_details AS i
        ON i.school_id = y.school_id AND i.academic_year = y.academic_year
    LEFT JOIN teacher_metrics AS t
        ON t.school_id = y.school_id AND t.academic_year = y.academic_year
    ORDER BY y.school_id, y.academic_year
";

/// Extracts the ordered panel.
///
/// # Errors
///
/// Returns [`Error::Storage`] when the extraction query fails.
pub fn extract_panel(conn: &Connection) -> Result<Vec<PanelRow>> {
    let mut stmt = conn
        .prepare(EXTRACT_SQL)
        .map_err(|e| Error::storage_with_source("prepare panel extraction", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PanelRow {
                school_id: row.get(0)?,
                academic_year: row.get(1)?,
                total_enrolment: row.get(2)?,
                school_category: row.get(3)?,
                district: row.get(4)?,
                management_type: row.get(5)?,
                total_class_rooms: row.get(6)?,
                usable_class_rooms: row.get(7)?,
                classroom_gap: row.get(8)?,
                risk_score: row.get(9)?,
                teacher_deficit_ratio: row.get(10)?,
                classroom_deficit_ratio: row.get(11)?,
                total_teachers: row.get(12)?,
                teacher_gap: row.get(13)?,
            })
        })
        .map_err(|e| Error::storage_with_source("run panel extraction", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::storage_with_source("collect panel rows", e))?;
    Ok(rows)
}

/// Sorted distinct academic years present in the panel.
#[must_use]
pub fn panel_years(panel: &[PanelRow]) -> Vec<String> {
    let mut years: Vec<String> = panel.iter().map(|r| r.academic_year.clone()).collect();
    years.sort();
    years.dedup();
    years
}

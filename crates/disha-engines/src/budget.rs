//! Stage 5 — budget allocation simulator.
//!
//! Per academic year, walks the priority order and funds each school's
//! full classroom and teacher gaps until the caps are exhausted. A school
//! whose cumulative demand straddles a cap receives 0 in that dimension
//! (all-or-nothing at the cutoff), which keeps `SUM(allocated) <= cap`
//! without fractional classroom rows.
//!
//! Ordering ties on `risk_rank` break by `school_id` so re-runs produce
//! byte-identical allocations.

use rusqlite::{Connection, Transaction, params};
use tracing::info;

use disha_core::{BudgetConfig, Error, PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::{restrict, run_per_year};

const STAGE: &str = "budget-allocation";

const DELETE_SQL: &str = "DELETE FROM budget_simulation WHERE academic_year = ?1";

const ALLOCATE_SQL: &str = "
    WITH ordered AS (
        SELECT
            p.school_id,
            p.academic_year,
            i.risk_level,
            MAX(COALESCE(i.classroom_gap, 0), 0) AS classroom_gap,
            MAX(COALESCE(t.teacher_gap, 0), 0) AS teacher_gap,
            ROW_NUMBER() OVER (
                ORDER BY p.risk_rank ASC, p.school_id ASC
            ) AS alloc_order
        FROM school_priority_index AS p
        JOIN infrastructure_details AS i
            ON i.school_id = p.school_id AND i.academic_year = p.academic_year
        LEFT JOIN teacher_metrics AS t
            ON t.school_id = p.school_id AND t.academic_year = p.academic_year
        WHERE p.academic_year = ?1
    ),
    cumulative AS (
        SELECT
            *,
            SUM(classroom_gap) OVER (
                ORDER BY alloc_order ROWS UNBOUNDED PRECEDING
            ) AS cum_classrooms,
            SUM(teacher_gap) OVER (
                ORDER BY alloc_order ROWS UNBOUNDED PRECEDING
            ) AS cum_teachers
        FROM ordered
    ),
    allocated AS (
        SELECT
            *,
            CASE WHEN cum_classrooms <= ?2 THEN classroom_gap ELSE 0 END
                AS classrooms_allocated,
            CASE WHEN cum_teachers <= ?3 THEN teacher_gap ELSE 0 END
                AS teachers_allocated
        FROM cumulative
    )
    INSERT INTO budget_simulation
        (school_id, academic_year, risk_level, classroom_gap, teacher_gap,
         alloc_order, classrooms_allocated, teachers_allocated,
         estimated_cost, cumulative_cost, allocation_status)
    SELECT
        school_id,
        academic_year,
        risk_level,
        classroom_gap,
        teacher_gap,
        alloc_order,
        classrooms_allocated,
        teachers_allocated,
        classrooms_allocated * ?4 AS estimated_cost,
        SUM(classrooms_allocated * ?4) OVER (
            ORDER BY alloc_order ROWS UNBOUNDED PRECEDING
        ) AS cumulative_cost,
        CASE
            WHEN classrooms_allocated > 0 AND teachers_allocated > 0 THEN 'FUNDED'
            WHEN classrooms_allocated = 0 AND teachers_allocated = 0 THEN 'UNFUNDED'
            ELSE 'PARTIALLY_FUNDED'
        END AS allocation_status
    FROM allocated
";

/// The budget allocation stage.
pub struct BudgetAllocationEngine;

impl Engine for BudgetAllocationEngine {
    fn id(&self) -> StageId {
        StageId::BudgetAllocation
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        let years = restrict(priority_years(store.conn())?, options.year.as_ref(), STAGE)?;

        let budget = config.budget.clone();
        let reports = run_per_year(store, STAGE, &years, config, &options.cancel, |tx, year| {
            apply_year(tx, year, &budget)
        })?;

        verify_caps(store.conn(), &config.budget)?;
        summarise(store.conn());
        Ok(reports)
    }
}

fn priority_years(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT academic_year FROM school_priority_index ORDER BY academic_year")
        .map_err(|e| Error::storage_with_source("prepare year scan", e))?;
    let years = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::storage_with_source("scan years", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::storage_with_source("collect years", e))?;
    Ok(years)
}

fn apply_year(tx: &Transaction<'_>, year: &str, budget: &BudgetConfig) -> rusqlite::Result<u64> {
    tx.execute(DELETE_SQL, params![year])?;
    #[allow(clippy::cast_possible_wrap)]
    let inserted = tx.execute(
        ALLOCATE_SQL,
        params![
            year,
            budget.max_classrooms() as i64,
            budget.max_teachers as i64,
            budget.cost_per_classroom as i64
        ],
    )?;
    Ok(inserted as u64)
}

/// Post-write invariant: per-year allocation totals stay under the caps.
/// Must never fire; if it does the table is quarantined.
fn verify_caps(conn: &Connection, budget: &BudgetConfig) -> Result<()> {
    #[allow(clippy::cast_possible_wrap)]
    let over_cap: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM (
                 SELECT academic_year
                 FROM budget_simulation
                 GROUP BY academic_year
                 HAVING SUM(classrooms_allocated) > ?1
                     OR SUM(teachers_allocated) > ?2
             )",
            params![budget.max_classrooms() as i64, budget.max_teachers as i64],
            |row| row.get(0),
        )
        .map_err(|e| Error::storage_with_source("allocation cap check", e))?;
    if over_cap > 0 {
        return Err(Error::invariant(
            "budget_simulation",
            format!("{over_cap} year batches exceed an allocation cap"),
        ));
    }
    Ok(())
}

fn summarise(conn: &Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN allocation_status = 'FUNDED' THEN 1 ELSE 0 END),
                SUM(CASE WHEN allocation_status = 'PARTIALLY_FUNDED' THEN 1 ELSE 0 END),
                SUM(CASE WHEN allocation_status = 'UNFUNDED' THEN 1 ELSE 0 END),
                COALESCE(SUM(classrooms_allocated), 0),
                COALESCE(SUM(teachers_allocated), 0)
         FROM budget_simulation",
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
    if let Ok((rows, funded, partial, unfunded, classrooms, teachers)) = result {
        info!(
            rows,
            funded, partial, unfunded, classrooms, teachers, "allocation simulated"
        );
    }
}

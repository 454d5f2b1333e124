//! Stage 6 — risk trend engine.
//!
//! One whole-series pass: deletes and re-inserts `risk_trend` from a LAG
//! window over each school's scored history. Direction uses the ±0.05
//! band, chronic means the current and two preceding levels are all HIGH
//! or CRITICAL, and volatile means the score moved by more than the
//! configured threshold in one year.
//!
//! This is a single batch (not per-year) because every row needs its
//! predecessors in the same window pass.

use rusqlite::params;
use tracing::info;

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store, run_batch};

use crate::stage::{Engine, RunOptions, StageId};

const STAGE: &str = "risk-trend";

const DELETE_SQL: &str = "DELETE FROM risk_trend";

/// `trend_direction_of` is the registered scalar backed by
/// `TrendDirection::from_delta`; a NULL delta classifies as BASELINE.
const POPULATE_SQL: &str = "
    INSERT INTO risk_trend
        (school_id, academic_year, risk_score, prev_risk_score, risk_delta,
         trend_direction, is_chronic, is_volatile)
    SELECT
        school_id,
        academic_year,
        risk_score,
        prev_risk_score,
        risk_delta,
        trend_direction_of(risk_delta, ?1) AS trend_direction,
        CASE
            WHEN risk_level IN ('HIGH', 'CRITICAL')
             AND prev1_level IN ('HIGH', 'CRITICAL')
             AND prev2_level IN ('HIGH', 'CRITICAL') THEN 1
            ELSE 0
        END AS is_chronic,
        CASE
            WHEN risk_delta IS NOT NULL AND ABS(risk_delta) > ?2 THEN 1
            ELSE 0
        END AS is_volatile
    FROM (
        SELECT
            school_id,
            academic_year,
            risk_score,
            risk_level,
            LAG(risk_score, 1) OVER school_window AS prev_risk_score,
            risk_score - LAG(risk_score, 1) OVER school_window AS risk_delta,
            LAG(risk_level, 1) OVER school_window AS prev1_level,
            LAG(risk_level, 2) OVER school_window AS prev2_level
        FROM infrastructure_details
        WHERE risk_score IS NOT NULL
        WINDOW school_window AS (PARTITION BY school_id ORDER BY academic_year)
    )
";

/// The risk trend stage.
pub struct RiskTrendEngine;

impl Engine for RiskTrendEngine {
    fn id(&self) -> StageId {
        StageId::RiskTrend
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        _options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        let trend_band = config.trend.trend_band;
        let volatile_threshold = config.trend.volatile_threshold;
        let report = run_batch(store, STAGE, "*", &config.execution, |tx| {
            tx.execute(DELETE_SQL, [])?;
            let rows = tx.execute(POPULATE_SQL, params![trend_band, volatile_threshold])?;
            Ok(rows as u64)
        })?;

        summarise(store.conn());
        Ok(vec![report])
    }
}

fn summarise(conn: &rusqlite::Connection) {
    let result = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN trend_direction = 'IMPROVING' THEN 1 ELSE 0 END),
                SUM(CASE WHEN trend_direction = 'DETERIORATING' THEN 1 ELSE 0 END),
                SUM(is_chronic),
                SUM(is_volatile)
         FROM risk_trend",
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
    if let Ok((rows, improving, deteriorating, chronic, volatile)) = result {
        info!(rows, improving, deteriorating, chronic, volatile, "risk trend rebuilt");
    }
}

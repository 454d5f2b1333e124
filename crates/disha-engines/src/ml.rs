//! Stage 10 — ML forecast adapter.
//!
//! Bridges the `disha-forecast` training/projection run into the stage
//! DAG. The forecast base year is always the latest observed year, so a
//! `--year` restriction naming any other year skips the stage rather
//! than training against a stale base.

use tracing::warn;

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::stage::{Engine, RunOptions, StageId};
use crate::years::latest_enrolment_year;

/// The ML forecast stage.
pub struct MlForecastEngine;

impl Engine for MlForecastEngine {
    fn id(&self) -> StageId {
        StageId::MlForecast
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        if let (Some(requested), Ok(Some(base))) =
            (&options.year, latest_enrolment_year(store.conn()))
        {
            if requested.to_string() != base {
                warn!(
                    requested = %requested,
                    base_year = %base,
                    "ml forecast trains from the latest observed year; skipping"
                );
                return Ok(Vec::new());
            }
        }
        let (reports, _artifact) = disha_forecast::run_ml_forecast(store, config)?;
        Ok(reports)
    }
}

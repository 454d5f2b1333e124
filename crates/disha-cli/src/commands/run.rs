//! Run command - execute the pipeline.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::error;

use disha_core::{AcademicYear, CancelFlag, PipelineConfig};
use disha_engines::{PipelinePlan, RunOptions, StageId};
use disha_store::{Store, StoreOptions};

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// First stage to run (inclusive, in dependency order).
    #[arg(long)]
    pub from: Option<String>,

    /// Last stage to run (inclusive, in dependency order).
    #[arg(long)]
    pub to: Option<String>,

    /// Restrict per-year stages to a single academic year (YYYY-YY).
    #[arg(long)]
    pub year: Option<String>,

    /// TOML configuration overlay.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
}

/// Execute the run command.
///
/// # Errors
///
/// Returns an error (non-zero exit) on the first failing stage; earlier
/// stages stay committed and a re-run replays them idempotently.
pub fn execute(args: &RunArgs, database: &Path) -> Result<()> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let from = parse_stage(args.from.as_deref())?;
    let to = parse_stage(args.to.as_deref())?;
    let year = args
        .year
        .as_deref()
        .map(AcademicYear::parse)
        .transpose()
        .context("parsing --year")?;

    let plan = PipelinePlan::select(from, to)?;
    let mut store = Store::open(
        database,
        &StoreOptions::from_execution(&config.execution),
    )
    .with_context(|| format!("opening database {}", database.display()))?;

    let options = RunOptions {
        year,
        cancel: CancelFlag::new(),
    };

    match plan.execute(&mut store, &config, &options) {
        Ok(reports) => {
            let rows: u64 = reports.iter().map(|r| r.rows_affected).sum();
            println!(
                "Pipeline complete: {} stages, {} batches, {rows} rows.",
                plan.stages().len(),
                reports.len()
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "pipeline failed");
            Err(e.into())
        }
    }
}

fn parse_stage(name: Option<&str>) -> Result<Option<StageId>> {
    name.map(str::parse::<StageId>)
        .transpose()
        .context("parsing stage name (see `disha stages`)")
}

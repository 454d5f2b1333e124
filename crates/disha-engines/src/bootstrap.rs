//! Stage 0 — schema bootstrap.
//!
//! Thin engine wrapper over [`disha_store::schema::bootstrap`] so schema
//! creation participates in the DAG like any other stage.

use disha_core::{PipelineConfig, Result};
use disha_store::{BatchReport, Store, run_batch};

use crate::stage::{Engine, RunOptions, StageId};

/// The schema bootstrap stage.
pub struct BootstrapEngine;

impl Engine for BootstrapEngine {
    fn id(&self) -> StageId {
        StageId::Bootstrap
    }

    fn run(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        _options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        // DDL in SQLite is transactional, so the whole bootstrap is one
        // batch like everything else.
        let report = run_batch(store, "bootstrap", "*", &config.execution, |tx| {
            disha_store::schema::bootstrap(tx)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(0)
        })?;
        Ok(vec![report])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_runs_twice() {
        let mut store = Store::open_in_memory().unwrap();
        let config = PipelineConfig::default();
        let options = RunOptions::default();
        BootstrapEngine.run(&mut store, &config, &options).unwrap();
        BootstrapEngine.run(&mut store, &config, &options).unwrap();
    }
}

//! Pipeline orchestration.
//!
//! The stages form a directed acyclic graph built from each stage's
//! `depends_on` metadata. The driver topologically sorts the graph with
//! Kahn's algorithm (declaration order breaks ties, so plans are
//! reproducible), applies the `--from`/`--to` cut, and executes the
//! selected stages in order, checking the cancellation flag between
//! stages and between batches.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::info;

use disha_core::{Error, PipelineConfig, Result};
use disha_store::{BatchReport, Store};

use crate::stage::{Engine, RunOptions, StageId};
use crate::{
    bootstrap::BootstrapEngine, budget::BudgetAllocationEngine,
    compliance_risk::ComplianceRiskEngine, district_compliance::DistrictComplianceEngine,
    forecast_wma::WmaForecastEngine, infra_gap::InfraGapEngine, ml::MlForecastEngine,
    prioritisation::PrioritisationEngine, proposal::ProposalValidationEngine,
    risk_trend::RiskTrendEngine, teacher_adequacy::TeacherAdequacyEngine,
};

/// An ordered execution plan over a contiguous cut of the stage DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    stages: Vec<StageId>,
}

impl PipelinePlan {
    /// Builds the full topologically sorted plan, then narrows it to the
    /// `[from, to]` cut of that order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `from` comes after `to` in the
    /// sorted order, or [`Error::Internal`] if the stage graph is cyclic
    /// (which would be a programming error in `depends_on`).
    pub fn select(from: Option<StageId>, to: Option<StageId>) -> Result<Self> {
        let sorted = toposort()?;

        let start = match from {
            None => 0,
            Some(stage) => position_of(&sorted, stage),
        };
        let end = match to {
            None => sorted.len() - 1,
            Some(stage) => position_of(&sorted, stage),
        };
        if start > end {
            return Err(Error::config(format!(
                "--from {} comes after --to {} in dependency order",
                sorted[start], sorted[end]
            )));
        }

        Ok(Self {
            stages: sorted[start..=end].to_vec(),
        })
    }

    /// The stages this plan will execute, in order.
    #[must_use]
    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// Executes the plan, stopping at the first failing stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the cancellation flag is raised
    /// between stages, or the first stage error otherwise. Stages already
    /// completed stay committed.
    pub fn execute(
        &self,
        store: &mut Store,
        config: &PipelineConfig,
        options: &RunOptions,
    ) -> Result<Vec<BatchReport>> {
        let mut reports = Vec::new();
        for stage in &self.stages {
            if options.cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    stage: stage.as_str(),
                });
            }
            info!(stage = %stage, "running stage");
            let engine = engine_for(*stage);
            reports.extend(engine.run(store, config, options)?);
        }
        Ok(reports)
    }
}

/// Runs the whole pipeline (every stage, in dependency order).
///
/// # Errors
///
/// Propagates the first stage failure; earlier stages stay committed.
pub fn run_pipeline(
    store: &mut Store,
    config: &PipelineConfig,
    options: &RunOptions,
) -> Result<Vec<BatchReport>> {
    PipelinePlan::select(None, None)?.execute(store, config, options)
}

/// Instantiates the engine for a stage.
#[must_use]
pub fn engine_for(stage: StageId) -> Box<dyn Engine> {
    match stage {
        StageId::Bootstrap => Box::new(BootstrapEngine),
        StageId::InfraGap => Box::new(InfraGapEngine),
        StageId::TeacherAdequacy => Box::new(TeacherAdequacyEngine),
        StageId::ComplianceRisk => Box::new(ComplianceRiskEngine),
        StageId::Prioritisation => Box::new(PrioritisationEngine),
        StageId::RiskTrend => Box::new(RiskTrendEngine),
        StageId::DistrictCompliance => Box::new(DistrictComplianceEngine),
        StageId::ProposalValidation => Box::new(ProposalValidationEngine),
        StageId::WmaForecast => Box::new(WmaForecastEngine),
        StageId::MlForecast => Box::new(MlForecastEngine),
        StageId::BudgetAllocation => Box::new(BudgetAllocationEngine),
    }
}

fn position_of(sorted: &[StageId], stage: StageId) -> usize {
    // Every StageId is a node of the graph, so the lookup cannot fail.
    sorted
        .iter()
        .position(|s| *s == stage)
        .unwrap_or_default()
}

/// Kahn's algorithm over the stage graph, breaking zero-in-degree ties by
/// declaration order so the plan is identical on every run.
fn toposort() -> Result<Vec<StageId>> {
    let mut graph: DiGraph<StageId, ()> = DiGraph::new();
    let mut index_map: HashMap<StageId, NodeIndex> = HashMap::new();

    for stage in StageId::ALL {
        let idx = graph.add_node(*stage);
        index_map.insert(*stage, idx);
    }
    for stage in StageId::ALL {
        for dep in stage.depends_on() {
            graph.add_edge(index_map[dep], index_map[stage], ());
        }
    }

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| {
            (
                idx,
                graph.edges_directed(idx, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut ready: Vec<NodeIndex> = StageId::ALL
        .iter()
        .map(|stage| index_map[stage])
        .filter(|idx| in_degree[idx] == 0)
        .collect();

    let mut sorted = Vec::with_capacity(StageId::ALL.len());
    while !ready.is_empty() {
        let idx = ready.remove(0);
        sorted.push(graph[idx]);

        let mut unblocked: Vec<NodeIndex> = Vec::new();
        for edge in graph.edges_directed(idx, Direction::Outgoing) {
            let target = edge.target();
            if let Some(degree) = in_degree.get_mut(&target) {
                *degree -= 1;
                if *degree == 0 {
                    unblocked.push(target);
                }
            }
        }
        // Declaration order is the deterministic tie-break.
        unblocked.sort_by_key(|idx| {
            StageId::ALL
                .iter()
                .position(|s| *s == graph[*idx])
                .unwrap_or(usize::MAX)
        });
        ready.extend(unblocked);
        ready.sort_by_key(|idx| {
            StageId::ALL
                .iter()
                .position(|s| *s == graph[*idx])
                .unwrap_or(usize::MAX)
        });
    }

    if sorted.len() != StageId::ALL.len() {
        return Err(Error::Internal {
            message: "stage dependency graph contains a cycle".to_string(),
        });
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toposort_matches_declaration_order() {
        // Declaration order is itself a topological order, and the
        // tie-break makes it the unique plan.
        let sorted = toposort().unwrap();
        assert_eq!(sorted, StageId::ALL);
    }

    #[test]
    fn full_plan_covers_every_stage() {
        let plan = PipelinePlan::select(None, None).unwrap();
        assert_eq!(plan.stages().len(), StageId::ALL.len());
    }

    #[test]
    fn from_to_cut_is_contiguous() {
        let plan =
            PipelinePlan::select(Some(StageId::ComplianceRisk), Some(StageId::RiskTrend)).unwrap();
        assert_eq!(
            plan.stages(),
            &[
                StageId::ComplianceRisk,
                StageId::Prioritisation,
                StageId::RiskTrend
            ]
        );
    }

    #[test]
    fn inverted_cut_is_rejected() {
        let result = PipelinePlan::select(Some(StageId::RiskTrend), Some(StageId::Bootstrap));
        assert!(result.is_err());
    }

    #[test]
    fn cancellation_stops_before_first_stage() {
        let mut store = disha_store::Store::open_in_memory().unwrap();
        let config = PipelineConfig::default();
        let options = RunOptions::default();
        options.cancel.cancel();
        let result = run_pipeline(&mut store, &config, &options);
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }
}

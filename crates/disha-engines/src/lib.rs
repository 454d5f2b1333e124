//! # disha-engines
//!
//! The analytical computation pipeline: ten dependent set-oriented engines
//! plus the ML forecasting stage, orchestrated as a DAG over a shared
//! relational store.
//!
//! Each engine owns disjoint output columns or tables and exposes one
//! narrow operation: run its batches against the store for the selected
//! years. No engine mutates an upstream engine's output, so re-running any
//! suffix of the pipeline is always safe.
//!
//! ## Stages
//!
//! | Stage | Output |
//! |-------|--------|
//! | bootstrap | twelve tables + indexes |
//! | infra-gap | `required_class_rooms`, `classroom_gap` |
//! | teacher-adequacy | `required_teachers`, `teacher_gap` |
//! | compliance-risk | deficit ratios, growth, `risk_score`, `risk_level` |
//! | prioritisation | `school_priority_index` |
//! | budget-allocation | `budget_simulation` |
//! | risk-trend | `risk_trend` |
//! | district-compliance | `district_compliance_index` |
//! | proposal-validation | `school_demand_proposals`, `proposal_validations` |
//! | wma-forecast | `enrolment_forecast` |
//! | ml-forecast | `ml_enrolment_forecast` |

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bootstrap;
pub mod budget;
pub mod compliance_risk;
pub mod district_compliance;
pub mod forecast_wma;
pub mod infra_gap;
pub mod ml;
pub mod pipeline;
pub mod prioritisation;
pub mod proposal;
pub mod risk_trend;
pub mod stage;
pub mod teacher_adequacy;

mod years;

pub use pipeline::{PipelinePlan, run_pipeline};
pub use stage::{Engine, RunOptions, StageId};

//! # disha-core
//!
//! Core abstractions for the Disha school-infrastructure analytics pipeline.
//!
//! This crate provides the foundational types shared across all Disha
//! components:
//!
//! - **Policy Norms**: UDISE+ category → classroom/PTR norm tables
//! - **Vocabularies**: Closed enumerations for risk levels, buckets, statuses
//! - **Academic Years**: The validated `"YYYY-YY"` year key
//! - **Configuration**: Pipeline thresholds, weights, and budget caps
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `disha-core` is the **only** crate allowed to define shared primitives.
//! Engines, storage, and the CLI interact exclusively through the types
//! defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod observability;
pub mod policy;
pub mod vocab;
pub mod year;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cancel::CancelFlag;
    pub use crate::config::{BudgetConfig, PipelineConfig};
    pub use crate::error::{Error, Result};
    pub use crate::policy::{ClassroomNorms, PtrNorms, SchoolCategory};
    pub use crate::vocab::{
        AllocationStatus, ComplianceGrade, DecisionStatus, PriorityBucket, ReasonCode, RiskLevel,
        TrendDirection,
    };
    pub use crate::year::AcademicYear;
}

// Re-export key types at crate root for ergonomics
pub use cancel::CancelFlag;
pub use config::{BudgetConfig, PipelineConfig};
pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging};
pub use policy::{ClassroomNorms, PtrNorms, SchoolCategory};
pub use vocab::{
    AllocationStatus, ComplianceGrade, DecisionStatus, PriorityBucket, ReasonCode, RiskLevel,
    TrendDirection,
};
pub use year::AcademicYear;

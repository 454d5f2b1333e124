//! # disha-forecast
//!
//! The ML forecasting stage: a single cross-panel gradient-boosted model
//! of per-school enrolment growth.
//!
//! With only seven annual observations per school, per-school time-series
//! models degenerate to differenced trend lines. Training one model over
//! the full ~300k-transition panel instead lets it pick up district-level
//! demographic shifts, management-type effects, and mean-reversion
//! patterns that no single school's history contains.
//!
//! The prediction target is the year-over-year growth rate clipped to
//! ±0.30; projection compounds a single prediction per school over three
//! horizons (never feeding predictions back as inputs, which diverges).
//!
//! Pipeline: [`panel`] extraction → [`features`] engineering →
//! [`gbm`] training (Huber loss, shallow trees, early stopping) →
//! bias calibration → projection, all orchestrated by [`engine`].
//! The fitted model persists as a versioned [`artifact`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod artifact;
pub mod engine;
pub mod features;
pub mod gbm;
pub mod panel;
pub mod tree;

pub use artifact::ModelArtifact;
pub use engine::run_ml_forecast;
pub use gbm::GradientBoostedRegressor;

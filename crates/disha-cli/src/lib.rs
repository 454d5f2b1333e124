//! # disha-cli
//!
//! Command-line driver for the Disha analytics pipeline.
//!
//! ## Commands
//!
//! - `disha run` - execute the pipeline (optionally a `--from`/`--to`
//!   cut, a single `--year`, with a `--config` TOML overlay)
//! - `disha stages` - list the stages in dependency order
//!
//! ## Configuration
//!
//! The store location comes from `--database` or `DISHA_DATABASE_URL`
//! (a filesystem path; the only environment contract). Policy constants
//! come from the built-in defaults, overridable via `--config`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Disha - school infrastructure risk and forecasting pipeline.
#[derive(Debug, Parser)]
#[command(name = "disha")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the pipeline database.
    #[arg(long, env = "DISHA_DATABASE_URL", default_value = "disha.db")]
    pub database: PathBuf,

    /// Emit logs as JSON instead of human-readable lines.
    #[arg(long)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute the pipeline in dependency order.
    Run(commands::run::RunArgs),
    /// List the stages in dependency order.
    Stages,
}

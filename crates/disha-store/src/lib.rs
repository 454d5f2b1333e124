//! # disha-store
//!
//! SQLite-backed relational store for the Disha analytics pipeline.
//!
//! The store is the only shared mutable resource in the system. Engines
//! talk to it exclusively through set-oriented SQL; this crate owns:
//!
//! - **Connections**: pragma setup, busy timeouts, the `crc32` SQL scalar
//! - **Schema Bootstrap**: idempotent DDL for all twelve tables + indexes
//! - **Batch Execution**: one transaction per year batch, with bounded
//!   retry on transient errors and one structured log line per batch
//!
//! Window functions (`RANK`, `PERCENT_RANK`, `LAG`, running `SUM`) do the
//! heavy lifting server-side; no engine retrieves rows to compute in
//! application code except the ML stage's panel extraction.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod connection;
pub mod schema;

pub use batch::{BatchReport, run_batch};
pub use connection::{Store, StoreOptions};
pub use schema::bootstrap;

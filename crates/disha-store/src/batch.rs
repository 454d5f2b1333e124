//! Batch execution.
//!
//! Every engine writes through [`run_batch`]: one transaction per academic
//! year batch (or per whole-series pass), retried at most twice with
//! exponential backoff on transient store errors, and reported as a single
//! structured log line carrying rows affected and elapsed time.
//!
//! A failed batch rolls back; batches already committed for earlier years
//! remain, and re-running replays them idempotently because every engine
//! either deletes-and-reinserts its own rows or overwrites the columns it
//! owns.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use disha_core::config::ExecutionConfig;
use disha_core::error::{Error, Result};
use disha_core::observability::stage_span;

use crate::connection::Store;

/// The outcome of one committed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// The stage that ran the batch.
    pub stage: &'static str,
    /// The year batch, or `"*"` for a whole-series pass.
    pub academic_year: String,
    /// Rows affected by the batch's statements.
    pub rows_affected: u64,
    /// Wall-clock duration of the batch, including retries.
    pub elapsed_ms: u64,
    /// When the batch committed.
    pub committed_at: DateTime<Utc>,
}

/// Runs one batch inside an immediate transaction, retrying transient
/// failures. The whole attempt loop runs inside a `stage` span carrying
/// the stage name and academic year.
///
/// The closure must be safe to re-execute from scratch: on a transient
/// error the whole transaction is rolled back and reopened.
///
/// # Errors
///
/// Returns [`Error::BatchFailed`] carrying `(stage, academic_year,
/// rows_attempted)` once retries are exhausted or on a non-transient
/// failure; `rows_attempted` is the row count of the last statement the
/// failing attempt completed before rollback.
pub fn run_batch<F>(
    store: &mut Store,
    stage: &'static str,
    academic_year: &str,
    execution: &ExecutionConfig,
    f: F,
) -> Result<BatchReport>
where
    F: Fn(&Transaction<'_>) -> rusqlite::Result<u64>,
{
    let span = stage_span(stage, academic_year);
    let _guard = span.enter();

    let started = Instant::now();
    let max_attempts = execution.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let tx_result = store
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate);

        // Failures carry the row count the attempt reached, read from the
        // transaction before it rolls back.
        let outcome = match tx_result {
            Ok(tx) => match f(&tx) {
                Ok(rows) => tx.commit().map(|()| rows).map_err(|e| (e, rows)),
                Err(e) => {
                    let rows_attempted = tx.changes();
                    // Rollback happens on drop.
                    drop(tx);
                    Err((e, rows_attempted))
                }
            },
            Err(e) => Err((e, 0)),
        };

        match outcome {
            Ok(rows_affected) => {
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let report = BatchReport {
                    stage,
                    academic_year: academic_year.to_string(),
                    rows_affected,
                    elapsed_ms,
                    committed_at: Utc::now(),
                };
                info!(rows = rows_affected, elapsed_ms, "batch committed");
                return Ok(report);
            }
            Err((e, _)) if is_transient(&e) && attempt < max_attempts => {
                let backoff =
                    Duration::from_millis(execution.retry_backoff_ms << (attempt - 1));
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient store error, retrying"
                );
                std::thread::sleep(backoff);
            }
            Err((e, rows_attempted)) => {
                return Err(Error::BatchFailed {
                    stage,
                    academic_year: academic_year.to_string(),
                    rows_attempted,
                    source: Box::new(e),
                });
            }
        }
    }
}

/// Busy/locked conditions are worth retrying; everything else is surfaced.
fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

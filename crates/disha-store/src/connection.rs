//! Store connections.
//!
//! Opens the SQLite database with the pragmas the pipeline relies on and
//! registers the application-defined scalars every engine's SQL calls:
//! `crc32` (deterministic proposal noise) and the four band classifiers
//! (`risk_level_of`, `priority_bucket_of`, `trend_direction_of`,
//! `compliance_grade_of`). The classifiers delegate to the closed enums
//! in `disha_core::vocab`, so the cut-point logic exists in exactly one
//! place: SQL stays set-oriented while Rust owns the policy bands, and
//! the schema CHECK constraints remain as a second line of defence.
//!
//! The database URL accepted by the CLI is simply a filesystem path, or
//! `:memory:` for an ephemeral store.

use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags};

use disha_core::config::{ComplianceGradeBands, ExecutionConfig, PriorityCutPoints, RiskBands};
use disha_core::error::{Error, Result};
use disha_core::{ComplianceGrade, PriorityBucket, RiskLevel, TrendDirection};

/// Options controlling how the store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Busy/statement timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: ExecutionConfig::default().statement_timeout_ms,
        }
    }
}

impl StoreOptions {
    /// Derives store options from the pipeline execution configuration.
    #[must_use]
    pub const fn from_execution(execution: &ExecutionConfig) -> Self {
        Self {
            busy_timeout_ms: execution.statement_timeout_ms,
        }
    }
}

/// A handle to the shared relational store.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (creating if absent) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the database cannot be opened or a
    /// pragma fails.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| Error::storage_with_source(format!("open {}", path.display()), e))?;
        Self::configure(conn, options, true)
    }

    /// Opens an in-memory store (used by tests and dry runs).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the connection cannot be configured.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage_with_source("open :memory:", e))?;
        Self::configure(conn, &StoreOptions::default(), false)
    }

    fn configure(conn: Connection, options: &StoreOptions, durable: bool) -> Result<Self> {
        if durable {
            conn.pragma_update(None, "journal_mode", "wal")
                .map_err(|e| Error::storage_with_source("set journal_mode", e))?;
            conn.pragma_update(None, "synchronous", "normal")
                .map_err(|e| Error::storage_with_source("set synchronous", e))?;
        }
        conn.pragma_update(None, "foreign_keys", "on")
            .map_err(|e| Error::storage_with_source("set foreign_keys", e))?;
        conn.busy_timeout(std::time::Duration::from_millis(options.busy_timeout_ms))
            .map_err(|e| Error::storage_with_source("set busy_timeout", e))?;
        register_crc32(&conn)?;
        register_classifiers(&conn)?;
        Ok(Self { conn })
    }

    /// Borrows the underlying connection for read-only statements.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Borrows the underlying connection mutably (required to open a
    /// transaction).
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Registers `crc32(text) -> integer` backed by `crc32fast`.
///
/// The scalar is deterministic and forms part of the proposal
/// reproducibility contract: `crc32` of the UTF-8 bytes of its single text
/// argument, as an unsigned 32-bit value widened to SQLite's integer type.
fn register_crc32(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "crc32",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text = ctx.get::<String>(0)?;
            Ok(i64::from(crc32fast::hash(text.as_bytes())))
        },
    )
    .map_err(|e| Error::storage_with_source("register crc32", e))
}

/// Registers the band classifiers backed by the `disha_core::vocab`
/// enums. Each takes the value followed by its cut points, so the
/// engines bind their configured bands as ordinary parameters:
///
/// - `risk_level_of(score, critical, high, moderate)`
/// - `priority_bucket_of(percentile, top_5, top_10, top_20)`
/// - `trend_direction_of(delta, band)` (NULL delta is BASELINE)
/// - `compliance_grade_of(avg_risk, a, b, c, d)`
fn register_classifiers(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("risk_level_of", 4, flags, |ctx| {
        let score = ctx.get::<f64>(0)?;
        let bands = RiskBands {
            critical: ctx.get::<f64>(1)?,
            high: ctx.get::<f64>(2)?,
            moderate: ctx.get::<f64>(3)?,
        };
        Ok(RiskLevel::from_score(score, &bands).as_str())
    })
    .map_err(|e| Error::storage_with_source("register risk_level_of", e))?;

    conn.create_scalar_function("priority_bucket_of", 4, flags, |ctx| {
        let percentile = ctx.get::<f64>(0)?;
        let cuts = PriorityCutPoints {
            top_5: ctx.get::<f64>(1)?,
            top_10: ctx.get::<f64>(2)?,
            top_20: ctx.get::<f64>(3)?,
        };
        Ok(PriorityBucket::from_percentile(percentile, &cuts).as_str())
    })
    .map_err(|e| Error::storage_with_source("register priority_bucket_of", e))?;

    conn.create_scalar_function("trend_direction_of", 2, flags, |ctx| {
        let delta = ctx.get::<Option<f64>>(0)?;
        let band = ctx.get::<f64>(1)?;
        Ok(TrendDirection::from_delta(delta, band).as_str())
    })
    .map_err(|e| Error::storage_with_source("register trend_direction_of", e))?;

    conn.create_scalar_function("compliance_grade_of", 5, flags, |ctx| {
        let avg_risk = ctx.get::<f64>(0)?;
        let bands = ComplianceGradeBands {
            a: ctx.get::<f64>(1)?,
            b: ctx.get::<f64>(2)?,
            c: ctx.get::<f64>(3)?,
            d: ctx.get::<f64>(4)?,
        };
        Ok(ComplianceGrade::from_avg_risk(avg_risk, &bands).as_str())
    })
    .map_err(|e| Error::storage_with_source("register compliance_grade_of", e))
}

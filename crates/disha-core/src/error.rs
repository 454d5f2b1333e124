//! Error types and result aliases for Disha.
//!
//! Errors are structured for programmatic handling: a failed batch carries
//! the `(stage, academic_year)` identity that failed, and invariant
//! violations name the table they quarantine.

use std::fmt;

/// The result type used throughout Disha.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Disha operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration was missing or invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of what made the configuration invalid.
        message: String,
    },

    /// An academic year string did not match the `"YYYY-YY"` convention.
    #[error("invalid academic year: {value:?} ({message})")]
    InvalidYear {
        /// The rejected input.
        value: String,
        /// Description of the violation.
        message: String,
    },

    /// A school carried a category code outside the UDISE+ range 1..=11.
    #[error("unknown school category {category} for school {school_id} in {academic_year}")]
    UnknownCategory {
        /// The offending school.
        school_id: String,
        /// The year batch in which the code was encountered.
        academic_year: String,
        /// The out-of-range code.
        category: i64,
    },

    /// An expected upstream row set was empty for a year batch.
    #[error("no upstream rows for stage {stage} in {academic_year}")]
    EmptyBatch {
        /// The stage whose inputs were empty.
        stage: &'static str,
        /// The year batch with no rows.
        academic_year: String,
    },

    /// A year batch failed after exhausting retries.
    #[error("stage {stage} failed for {academic_year} ({rows_attempted} rows attempted)")]
    BatchFailed {
        /// The failing stage.
        stage: &'static str,
        /// The year batch that failed.
        academic_year: String,
        /// Rows written by the last statement the failing attempt
        /// completed before rollback (or by the batch on a commit
        /// failure).
        rows_attempted: u64,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A post-write invariant fired; the named table must be treated as
    /// quarantined until recomputed.
    #[error("invariant violation in table {table}: {message}")]
    InvariantViolation {
        /// The quarantined output table.
        table: &'static str,
        /// Description of the violated invariant.
        message: String,
    },

    /// The run was cancelled between batches.
    #[error("cancelled before stage {stage}")]
    Cancelled {
        /// The stage that would have run next.
        stage: &'static str,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The model artefact could not be read or written.
    #[error("model artefact error: {message}")]
    Artifact {
        /// Description of the artefact failure.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error with the given message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invariant violation for the given table.
    #[must_use]
    pub fn invariant(table: &'static str, message: impl fmt::Display) -> Self {
        Self::InvariantViolation {
            table,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_failed_reports_identity() {
        let err = Error::BatchFailed {
            stage: "infra-gap",
            academic_year: "2022-23".into(),
            rows_attempted: 63_000,
            source: Box::new(std::io::Error::other("reset")),
        };
        let text = err.to_string();
        assert!(text.contains("infra-gap"));
        assert!(text.contains("2022-23"));
        assert!(text.contains("63000"));
    }

    #[test]
    fn unknown_category_names_the_row() {
        let err = Error::UnknownCategory {
            school_id: "KA0001".into(),
            academic_year: "2024-25".into(),
            category: 13,
        };
        assert_eq!(
            err.to_string(),
            "unknown school category 13 for school KA0001 in 2024-25"
        );
    }
}

//! Observability infrastructure for Disha.
//!
//! Structured logging with consistent spans: every engine batch runs inside
//! a `stage` span carrying the stage name and academic year, and emits one
//! info line with rows affected and elapsed time.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for scheduled runs).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. `RUST_LOG` controls log levels.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false))
                    .init();
            }
        }
    });
}

/// Creates a span for one engine batch.
#[must_use]
pub fn stage_span(stage: &str, academic_year: &str) -> Span {
    tracing::info_span!("stage", name = stage, year = academic_year)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn stage_span_carries_fields() {
        let span = stage_span("infra-gap", "2024-25");
        let _guard = span.enter();
        tracing::info!("batch complete");
    }
}

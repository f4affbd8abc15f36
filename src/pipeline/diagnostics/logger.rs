//! Fan-out diagnostic logger.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::sinks::{ConsoleSink, DiagnosticSink, JsonlFileSink, SqliteErrorLogStore, WebhookMonitoringSink};
use super::ErrorLogEntry;
use crate::config::PipelineConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes each entry to every sink in registration order: console first,
/// then monitoring, then durable stores.
///
/// `log` never fails. A sink error (or panic) is reported on the
/// operational stream and the remaining sinks still receive the entry.
#[derive(Clone, Default)]
pub struct DiagnosticLogger {
    sinks: Vec<Arc<dyn DiagnosticSink>>,
}

impl DiagnosticLogger {
    /// Logger with no sinks; entries are discarded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Console-only logger.
    pub fn console() -> Self {
        Self::new().with_sink(Arc::new(ConsoleSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Console plus every sink the config enables. A durable sink that
    /// cannot be opened is skipped with a warning.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut logger = Self::console();

        if let Some(url) = &config.monitoring_webhook {
            match WebhookMonitoringSink::new(url, WEBHOOK_TIMEOUT) {
                Ok(sink) => logger = logger.with_sink(Arc::new(sink)),
                Err(e) => tracing::warn!(error = %e, "Monitoring webhook sink disabled"),
            }
        }
        if let Some(path) = &config.error_log_db {
            match SqliteErrorLogStore::open(path) {
                Ok(store) => logger = logger.with_sink(Arc::new(store)),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "SQLite error log disabled"
                ),
            }
        }
        if let Some(path) = &config.error_log_jsonl {
            match JsonlFileSink::open(path) {
                Ok(sink) => logger = logger.with_sink(Arc::new(sink)),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "JSONL error log disabled"
                ),
            }
        }

        logger
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn log(&self, entry: &ErrorLogEntry) {
        for sink in &self.sinks {
            if !sink.accepts(entry.severity) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| sink.append(entry))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    sink = sink.name(),
                    entry_id = %entry.id,
                    error = %e,
                    message = %entry.message,
                    "Diagnostic sink write failed"
                ),
                Err(_) => tracing::error!(
                    sink = sink.name(),
                    entry_id = %entry.id,
                    message = %entry.message,
                    "Diagnostic sink panicked"
                ),
            }
        }
    }
}

//! Diagnostic sinks: console, monitoring webhook and durable stores.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;

use super::{ErrorLogEntry, ErrorSeverity};
use crate::db::{self, DatabaseError};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// One destination for diagnostic entries.
pub trait DiagnosticSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this sink wants entries of the given severity.
    fn accepts(&self, _severity: ErrorSeverity) -> bool {
        true
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<(), SinkError>;
}

// ──────────────────────────────────────────────
// Console
// ──────────────────────────────────────────────

/// Operational log stream. Emits one `tracing` event per entry, at a level
/// derived from severity.
pub struct ConsoleSink;

impl DiagnosticSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<(), SinkError> {
        let ctx = &entry.context;
        let document_id = ctx.document_id.as_deref().unwrap_or("-");
        macro_rules! emit {
            ($level:ident) => {
                tracing::$level!(
                    entry_id = %entry.id,
                    request_id = %ctx.request_id,
                    document_id,
                    category = entry.category.as_str(),
                    severity = entry.severity.as_str(),
                    parent_id = ?entry.parent_id,
                    details = ?entry.details,
                    "{}",
                    entry.message
                )
            };
        }
        match entry.severity {
            ErrorSeverity::Info => emit!(info),
            ErrorSeverity::Warning => emit!(warn),
            ErrorSeverity::Error | ErrorSeverity::Critical => emit!(error),
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Monitoring webhook
// ──────────────────────────────────────────────

/// Forwards ERROR/CRITICAL entries to an alerting webhook.
///
/// `append` only enqueues; a dedicated thread owns the blocking HTTP client
/// so a slow or unreachable monitor never stalls the pipeline. Delivery
/// failures are logged and dropped.
pub struct WebhookMonitoringSink {
    sender: mpsc::Sender<ErrorLogEntry>,
}

impl WebhookMonitoringSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let (sender, receiver) = mpsc::channel::<ErrorLogEntry>();
        let url = url.to_string();
        std::thread::Builder::new()
            .name("diagnostic-webhook".into())
            .spawn(move || deliver_loop(&url, timeout, receiver))?;
        Ok(Self { sender })
    }
}

fn deliver_loop(url: &str, timeout: Duration, receiver: mpsc::Receiver<ErrorLogEntry>) {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "Monitoring webhook client could not be built");
            return;
        }
    };

    // Ends when every sender has been dropped.
    for entry in receiver {
        let payload = serde_json::json!({
            "message": entry.message,
            "level": entry.severity.as_str(),
            "tags": {
                "category": entry.category.as_str(),
                "request_id": entry.context.request_id,
            },
            "extra": entry,
        });
        match client.post(url).json(&payload).send() {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => tracing::warn!(
                status = response.status().as_u16(),
                entry_id = %entry.id,
                "Monitoring webhook rejected entry"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                entry_id = %entry.id,
                "Monitoring webhook delivery failed"
            ),
        }
    }
}

impl DiagnosticSink for WebhookMonitoringSink {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn accepts(&self, severity: ErrorSeverity) -> bool {
        severity.is_alerting()
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<(), SinkError> {
        self.sender
            .send(entry.clone())
            .map_err(|_| SinkError::Unavailable("webhook delivery thread stopped".into()))
    }
}

// ──────────────────────────────────────────────
// SQLite store
// ──────────────────────────────────────────────

/// Queryable durable store backed by the `error_log` table.
pub struct SqliteErrorLogStore {
    conn: Mutex<Connection>,
}

impl SqliteErrorLogStore {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        Ok(Self {
            conn: Mutex::new(db::open_database(path)?),
        })
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        Ok(Self {
            conn: Mutex::new(db::open_memory_database()?),
        })
    }

    pub fn for_document(&self, document_id: &str) -> Result<Vec<ErrorLogEntry>, SinkError> {
        let conn = self.lock()?;
        Ok(db::error_logs_for_document(&conn, document_id)?)
    }

    pub fn for_project(&self, project_id: &str) -> Result<Vec<ErrorLogEntry>, SinkError> {
        let conn = self.lock()?;
        Ok(db::error_logs_for_project(&conn, project_id)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Unavailable("error log connection poisoned".into()))
    }
}

impl DiagnosticSink for SqliteErrorLogStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<(), SinkError> {
        let conn = self.lock()?;
        db::insert_error_log(&conn, entry)?;
        Ok(())
    }
}

// ──────────────────────────────────────────────
// JSONL file
// ──────────────────────────────────────────────

/// Append-only JSON Lines file. Each entry is serialized up front and
/// written with a single `write_all` on an `O_APPEND` handle, so concurrent
/// writers (including other processes) never interleave partial lines.
pub struct JsonlFileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFileSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for JsonlFileSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| SinkError::Unavailable("error log file handle poisoned".into()))?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// Read every entry of a JSONL error log, oldest first. Blank lines are
/// skipped; a malformed line is an error.
pub fn read_jsonl_entries(path: &Path) -> Result<Vec<ErrorLogEntry>, SinkError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

// ──────────────────────────────────────────────
// Recording sink (tests and embedding callers)
// ──────────────────────────────────────────────

/// Keeps entries in memory. `failing()` rejects every append, for
/// exercising fan-out isolation.
#[derive(Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<ErrorLogEntry>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DiagnosticSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Unavailable("recording sink set to fail".into()));
        }
        self.entries
            .lock()
            .map_err(|_| SinkError::Unavailable("recording sink poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }
}

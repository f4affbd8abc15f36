//! Structured failure diagnostics.
//!
//! Every distinguishable failure or notable event of an extraction attempt
//! becomes one append-only `ErrorLogEntry`. Entries are fanned out by the
//! `DiagnosticLogger` to independent sinks (console, monitoring webhook,
//! durable stores); no sink failure ever reaches the pipeline.

pub mod logger;
pub mod redact;
pub mod sinks;

pub use logger::*;
pub use redact::*;
pub use sinks::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of diagnostic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PdfProcessing,
    DocumentUpload,
    DocumentExtraction,
    FileValidation,
    Storage,
    Database,
    ApiError,
    Security,
    General,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfProcessing => "pdf_processing",
            Self::DocumentUpload => "document_upload",
            Self::DocumentExtraction => "document_extraction",
            Self::FileValidation => "file_validation",
            Self::Storage => "storage",
            Self::Database => "database",
            Self::ApiError => "api_error",
            Self::Security => "security",
            Self::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pdf_processing" => Self::PdfProcessing,
            "document_upload" => Self::DocumentUpload,
            "document_extraction" => Self::DocumentExtraction,
            "file_validation" => Self::FileValidation,
            "storage" => Self::Storage,
            "database" => Self::Database,
            "api_error" => Self::ApiError,
            "security" => Self::Security,
            "general" => Self::General,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "info" => Self::Info,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            _ => return None,
        })
    }

    /// ERROR and CRITICAL entries page the on-call monitoring sink.
    pub fn is_alerting(&self) -> bool {
        *self >= Self::Error
    }
}

/// Correlation identifiers shared by every entry of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogContext {
    pub request_id: String,
    pub document_id: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<u64>,
}

impl LogContext {
    pub fn new() -> Self {
        Self {
            request_id: new_request_id(),
            ..Self::default()
        }
    }
}

/// `req_{unix_millis}_{random}`.
pub fn new_request_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

/// One diagnostic record. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    /// Entry this one follows from (fallback entries point at the primary
    /// failure they recover from).
    pub parent_id: Option<Uuid>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub stack: Option<String>,
    #[serde(flatten)]
    pub context: LogContext,
    pub timestamp: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(category: ErrorCategory, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            category,
            severity,
            message: message.into(),
            details: None,
            stack: None,
            context: LogContext::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: &LogContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_strings_roundtrip_through_parse() {
        for category in [
            ErrorCategory::PdfProcessing,
            ErrorCategory::DocumentExtraction,
            ErrorCategory::FileValidation,
            ErrorCategory::ApiError,
            ErrorCategory::Storage,
        ] {
            assert_eq!(ErrorCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(ErrorCategory::parse("payment"), None);
    }

    #[test]
    fn only_error_and_critical_alert() {
        assert!(!ErrorSeverity::Info.is_alerting());
        assert!(!ErrorSeverity::Warning.is_alerting());
        assert!(ErrorSeverity::Error.is_alerting());
        assert!(ErrorSeverity::Critical.is_alerting());
    }

    #[test]
    fn request_id_shape() {
        let id = new_request_id();
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn entry_serializes_context_flat() {
        let context = LogContext {
            document_id: Some("doc-1".into()),
            ..LogContext::new()
        };
        let entry = ErrorLogEntry::new(ErrorCategory::PdfProcessing, ErrorSeverity::Error, "boom")
            .with_context(&context)
            .with_details(serde_json::json!({"page": 2}));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["category"], "pdf_processing");
        assert_eq!(json["severity"], "error");
        assert_eq!(json["document_id"], "doc-1");
        assert_eq!(json["details"]["page"], 2);

        let back: ErrorLogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn parent_links_entries() {
        let primary = ErrorLogEntry::new(ErrorCategory::PdfProcessing, ErrorSeverity::Error, "load");
        let fallback = ErrorLogEntry::new(ErrorCategory::PdfProcessing, ErrorSeverity::Info, "ocr")
            .with_parent(primary.id);
        assert_eq!(fallback.parent_id, Some(primary.id));
        assert_ne!(fallback.id, primary.id);
    }
}

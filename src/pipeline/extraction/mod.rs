pub mod types;
pub mod sanitize;
pub mod pdf;
pub mod pdf_renderer;
pub mod pdfium;
pub mod ocr;
pub mod vision_ocr;
pub mod docx;
pub mod latex;
pub mod text_only;
pub mod structure_detect;

pub use types::*;
pub use sanitize::*;
pub use pdf::*;
pub use ocr::*;
pub use docx::*;
pub use latex::*;
pub use text_only::*;
pub use structure_detect::*;

use thiserror::Error;

use crate::pipeline::diagnostics::ErrorCategory;
use crate::pipeline::import::ImportError;

/// Why a PDF could not be opened by the primary parser.
///
/// Every variant is terminal for the PDF extractor and recoverable at the
/// orchestrator level through the OCR fallback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PdfLoadError {
    #[error("Invalid PDF format: missing PDF header")]
    InvalidHeader,

    #[error("Cannot process encrypted PDF")]
    Encrypted,

    #[error("Password-protected PDF cannot be processed")]
    PasswordProtected,

    #[error("PDF structure is invalid or corrupted (cross-reference table)")]
    CorruptXref,

    #[error("Failed to load PDF: {0}")]
    Other(String),
}

impl PdfLoadError {
    /// Classify a parser failure message into a load sub-kind.
    ///
    /// Password is checked before encryption: a wrong-password decryption
    /// failure mentions both.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("header") {
            Self::InvalidHeader
        } else if lower.contains("password") {
            Self::PasswordProtected
        } else if lower.contains("encrypt") || lower.contains("decrypt") {
            Self::Encrypted
        } else if lower.contains("xref")
            || lower.contains("cross-reference")
            || lower.contains("cross reference")
        {
            Self::CorruptXref
        } else {
            Self::Other(message.to_string())
        }
    }

    /// Short machine-readable tag for log details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidHeader => "invalid_header",
            Self::Encrypted => "encrypted",
            Self::PasswordProtected => "password_protected",
            Self::CorruptXref => "corrupt_xref",
            Self::Other(_) => "load_failed",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidHeader => "The PDF file appears to be corrupted (missing PDF header)",
            Self::Encrypted => "The PDF file is encrypted and cannot be processed",
            Self::PasswordProtected => "The PDF file is password protected",
            Self::CorruptXref => "The PDF structure is invalid or corrupted",
            Self::Other(_) => "The PDF file could not be opened",
        }
    }
}

/// Closed failure taxonomy of the extraction pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("File validation failed: {0}")]
    FileValidation(String),

    #[error(transparent)]
    PdfLoad(#[from] PdfLoadError),

    #[error("No text content extracted from PDF")]
    NoTextContent,

    #[error("Failed to extract text from page {page}: {reason}")]
    PageExtraction { page: usize, reason: String },

    #[error("Metadata extraction failed: {0}")]
    Metadata(String),

    #[error("PDF rendering failed on page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("OCR extraction failed: {0}")]
    OcrFailed(String),

    #[error("No OCR engine is configured")]
    OcrUnavailable,

    #[error("DOCX extraction failed: {0}")]
    DocxExtraction(String),

    #[error("LaTeX extraction failed: {0}")]
    LatexExtraction(String),

    #[error("Text file read failed: {0}")]
    PlainTextRead(String),

    #[error("Content analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("{stage} timed out after {secs}s")]
    TimedOut { stage: String, secs: u64 },

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ExtractionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PdfLoad(_)
            | Self::NoTextContent
            | Self::PageExtraction { .. }
            | Self::Metadata(_)
            | Self::PdfRendering { .. } => ErrorCategory::PdfProcessing,
            Self::FileValidation(_) => ErrorCategory::FileValidation,
            Self::AnalysisUnavailable(_) => ErrorCategory::ApiError,
            Self::UnsupportedFormat(_)
            | Self::ImageProcessing(_)
            | Self::OcrFailed(_)
            | Self::OcrUnavailable
            | Self::DocxExtraction(_)
            | Self::LatexExtraction(_)
            | Self::PlainTextRead(_)
            | Self::TimedOut { .. }
            | Self::Cancelled
            | Self::Unexpected(_) => ErrorCategory::DocumentExtraction,
        }
    }

    /// Terminal for the primary PDF extractor but eligible for OCR fallback.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::PdfLoad(_) | Self::NoTextContent)
    }

    /// Whether re-running the attempt (possibly with adjusted options) can help.
    pub fn can_retry(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::FileValidation(_)
                | Self::DocxExtraction(_)
                | Self::LatexExtraction(_)
                | Self::PlainTextRead(_)
        )
    }

    /// Short, user-safe description. Never contains paths, parser internals
    /// or credentials.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedFormat(ext) => format!(
                "Unsupported file format: {}. Supported formats: pdf, docx, tex, txt",
                crate::pipeline::diagnostics::sanitize_message(ext)
            ),
            Self::FileValidation(reason) => crate::pipeline::diagnostics::sanitize_message(reason),
            Self::PdfLoad(e) => e.user_message().to_string(),
            Self::NoTextContent => "No text content could be extracted from the PDF".into(),
            Self::PageExtraction { page, .. } => format!("Text on page {page} could not be read"),
            Self::Metadata(_) => "PDF metadata could not be read".into(),
            Self::PdfRendering { .. } | Self::ImageProcessing(_) => {
                "The PDF page could not be rendered for text recognition".into()
            }
            Self::OcrFailed(_) => "Text recognition (OCR) failed".into(),
            Self::OcrUnavailable => "Text recognition (OCR) is not available".into(),
            Self::DocxExtraction(_) => "The Word document could not be read".into(),
            Self::LatexExtraction(_) => "The LaTeX source could not be read".into(),
            Self::PlainTextRead(_) => "The text file could not be read (unsupported encoding)".into(),
            Self::AnalysisUnavailable(_) => {
                "Content analysis is unavailable; using extracted text only".into()
            }
            Self::TimedOut { stage, .. } => format!("Processing timed out during {stage}"),
            Self::Cancelled => "Processing was cancelled".into(),
            Self::Unexpected(_) => "An unexpected error occurred while processing the document".into(),
        }
    }
}

impl From<ImportError> for ExtractionError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::UnsupportedFormat(ext) => Self::UnsupportedFormat(ext),
            other => Self::FileValidation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_load_messages() {
        assert_eq!(PdfLoadError::classify("Missing PDF header"), PdfLoadError::InvalidHeader);
        assert_eq!(PdfLoadError::classify("Document is Encrypted"), PdfLoadError::Encrypted);
        assert_eq!(
            PdfLoadError::classify("Decryption error: incorrect password"),
            PdfLoadError::PasswordProtected
        );
        assert_eq!(PdfLoadError::classify("Invalid XRef stream"), PdfLoadError::CorruptXref);
        assert_eq!(
            PdfLoadError::classify("unexpected end of file"),
            PdfLoadError::Other("unexpected end of file".into())
        );
    }

    #[test]
    fn load_errors_have_distinct_user_messages() {
        let all = [
            PdfLoadError::InvalidHeader,
            PdfLoadError::Encrypted,
            PdfLoadError::PasswordProtected,
            PdfLoadError::CorruptXref,
            PdfLoadError::Other("x".into()),
        ];
        let mut messages: Vec<_> = all.iter().map(|e| e.user_message()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), all.len());
    }

    #[test]
    fn pdf_failures_trigger_fallback() {
        assert!(ExtractionError::PdfLoad(PdfLoadError::Encrypted).triggers_fallback());
        assert!(ExtractionError::NoTextContent.triggers_fallback());
        assert!(!ExtractionError::DocxExtraction("bad zip".into()).triggers_fallback());
        assert!(!ExtractionError::OcrFailed("x".into()).triggers_fallback());
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            ExtractionError::PdfLoad(PdfLoadError::CorruptXref).category(),
            ErrorCategory::PdfProcessing
        );
        assert_eq!(
            ExtractionError::UnsupportedFormat("ppt".into()).category(),
            ErrorCategory::DocumentExtraction
        );
        assert_eq!(
            ExtractionError::FileValidation("too big".into()).category(),
            ErrorCategory::FileValidation
        );
        assert_eq!(
            ExtractionError::AnalysisUnavailable("503".into()).category(),
            ErrorCategory::ApiError
        );
    }

    #[test]
    fn unsupported_format_is_not_retryable() {
        assert!(!ExtractionError::UnsupportedFormat("exe".into()).can_retry());
        assert!(ExtractionError::PdfLoad(PdfLoadError::Encrypted).can_retry());
        assert!(ExtractionError::OcrFailed("engine down".into()).can_retry());
    }

    #[test]
    fn user_messages_hide_internal_detail() {
        let e = ExtractionError::OcrFailed("connect to 10.0.0.7:11434 refused".into());
        assert!(!e.user_message().contains("10.0.0.7"));
        let e = ExtractionError::PdfLoad(PdfLoadError::Other("/srv/tmp/x.pdf: eof".into()));
        assert!(!e.user_message().contains("/srv"));
    }

    #[test]
    fn import_errors_convert() {
        let e: ExtractionError = ImportError::UnsupportedFormat("odt".into()).into();
        assert_eq!(e, ExtractionError::UnsupportedFormat("odt".into()));
        let e: ExtractionError = ImportError::EmptyFile.into();
        assert!(matches!(e, ExtractionError::FileValidation(_)));
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExtractionError, PdfLoadError};

/// Caller-adjustable options for a (re)attempt. All default to `false`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryOptions {
    /// Skip the primary PDF parser and go straight to OCR.
    pub use_alternative_method: bool,
    /// Proceed with PDFs that carry an encryption dictionary but opened
    /// without a user password.
    pub ignore_encryption: bool,
    /// Do not read the PDF version/Info dictionary.
    pub skip_metadata: bool,
}

/// How text was extracted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Primary PDF text-layer parsing.
    Primary,
    /// First-page OCR fallback.
    Ocr,
    DocxRawText,
    LatexStrip,
    PlainText,
    /// Nothing was extracted (unsupported or invalid input).
    None,
}

/// Lightweight reference to a figure detected in the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Figure {
    pub page_number: usize,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_ref: Option<String>,
}

/// Lightweight reference to a table detected in the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub page_number: usize,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_ref: Option<String>,
}

/// Diagnostic trail attached to every result, whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingDetails {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub extraction_method: ExtractionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf_version: Option<String>,
    pub used_fallback_method: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_method_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
    pub warnings: Vec<String>,
}

impl ProcessingDetails {
    pub fn started(method: ExtractionMethod) -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            extraction_method: method,
            page_count: None,
            pdf_version: None,
            used_fallback_method: false,
            fallback_method: None,
            primary_method_error: None,
            ocr_confidence: None,
            warnings: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }
}

/// Output of one extractor run.
#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub figures: Vec<Figure>,
    pub tables: Vec<Table>,
    pub details: ProcessingDetails,
}

impl ExtractedContent {
    /// Content with text only (DOCX, LaTeX, plain text).
    pub fn text_only(
        text: String,
        metadata: BTreeMap<String, String>,
        mut details: ProcessingDetails,
    ) -> Self {
        details.finish();
        Self {
            text,
            metadata,
            figures: Vec::new(),
            tables: Vec::new(),
            details,
        }
    }
}

/// Text of one PDF page, 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub page_number: usize,
    pub text: String,
}

/// PDF version and Info dictionary entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfMetadata {
    pub version: Option<String>,
    pub info: BTreeMap<String, String>,
}

/// Raw OCR result from the engine
#[derive(Debug, Clone)]
pub struct OcrPageResult {
    pub text: String,
    /// 0.0 - 1.0
    pub confidence: f32,
}

/// Result of the OCR fallback extractor.
#[derive(Debug, Clone)]
pub struct OcrExtraction {
    pub text: String,
    pub confidence: f32,
    pub method: ExtractionMethod,
    /// Pages in the source document; only the first is recognized.
    pub page_count: usize,
}

/// PDF parsing backend used by the primary extractor.
///
/// Injected at composition time so availability of a parser is decided
/// once, not probed during extraction.
pub trait PdfBackend {
    fn load(
        &self,
        pdf_bytes: &[u8],
        ignore_encryption: bool,
    ) -> Result<Box<dyn LoadedPdf>, PdfLoadError>;
}

/// A successfully opened PDF.
pub trait LoadedPdf {
    fn page_count(&self) -> usize;

    fn metadata(&self) -> Result<PdfMetadata, ExtractionError>;

    /// Text of a single page (1-based). Errors are page-local.
    fn page_text(&self, page_number: usize) -> Result<String, ExtractionError>;
}

/// OCR engine abstraction (allows mocking for tests)
pub trait OcrEngine {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError>;
}

/// Renders a PDF page (0-based index) to PNG bytes for OCR.
pub trait PdfPageRenderer {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_options_default_all_false() {
        let opts = RetryOptions::default();
        assert!(!opts.use_alternative_method);
        assert!(!opts.ignore_encryption);
        assert!(!opts.skip_metadata);
    }

    #[test]
    fn retry_options_deserialize_partial() {
        let opts: RetryOptions = serde_json::from_str(r#"{"ignore_encryption": true}"#).unwrap();
        assert!(opts.ignore_encryption);
        assert!(!opts.skip_metadata);
    }

    #[test]
    fn method_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&ExtractionMethod::Primary).unwrap(), "\"primary\"");
        assert_eq!(serde_json::to_string(&ExtractionMethod::Ocr).unwrap(), "\"ocr\"");
    }

    #[test]
    fn details_finish_sets_end_time() {
        let mut details = ProcessingDetails::started(ExtractionMethod::Primary);
        assert!(details.end_time.is_none());
        details.finish();
        assert!(details.end_time.unwrap() >= details.start_time);
    }

    // Verify traits are object-safe (can be used as `dyn Trait`)
    #[test]
    fn traits_are_object_safe() {
        fn _assert_backend(_: &dyn PdfBackend) {}
        fn _assert_loaded(_: &dyn LoadedPdf) {}
        fn _assert_ocr(_: &dyn OcrEngine) {}
        fn _assert_renderer(_: &dyn PdfPageRenderer) {}
    }
}

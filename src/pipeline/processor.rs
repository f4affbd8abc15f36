//! Document processing orchestrator.
//!
//! Drives one extraction attempt through
//! `Detecting → ExtractingPrimary → [ExtractingFallback] → Analyzing → Finalized`
//! and owns every fallback and partial-success decision. Capabilities (PDF
//! backend, page renderer, OCR engine, analyzer, diagnostic sinks) are
//! injected at construction, so the full state machine runs on mocks in
//! tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{PipelineConfig, SizeLimits};
use crate::pipeline::analysis::{truncate_for_analysis, ContentAnalyzer, OllamaAnalyzer};
use crate::pipeline::cancel::CancelFlag;
use crate::pipeline::diagnostics::{
    new_request_id, sanitize_message, DiagnosticLogger, ErrorCategory, ErrorLogEntry,
    ErrorSeverity, LogContext,
};
use crate::pipeline::extraction::pdf_renderer::LopdfImageExtractor;
use crate::pipeline::extraction::pdfium::PdfiumRenderer;
use crate::pipeline::extraction::vision_ocr::OllamaVisionOcr;
use crate::pipeline::extraction::{
    extract_docx, extract_latex, extract_plain_text, extract_with_ocr, ExtractedContent,
    ExtractionError, ExtractionMethod, Figure, LopdfBackend, OcrEngine, OcrExtraction,
    PdfBackend, PdfExtractor, PdfPageRenderer, ProcessingDetails, RetryOptions, Table,
    NO_TEXT_WARNING,
};
use crate::pipeline::import::{
    compute_content_hash, detect_format, effective_mime, validate_source, FormatKind,
    SourceDocument,
};

/// Warning attached when text came from first-page OCR only.
pub const OCR_FIRST_PAGE_WARNING: &str = "Text was recovered by OCR from the first page only";

/// Warning attached when a non-PDF document decodes to no text.
pub const EMPTY_TEXT_WARNING: &str = "Document contains no extractable text";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Composition-time failures. Processing itself never returns an error;
/// every failure becomes an `ExtractionResult`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Request / attempt / result types
// ---------------------------------------------------------------------------

/// One invocation of the pipeline as issued by the upload layer.
#[derive(Debug, Clone)]
pub struct DocumentRequest {
    pub source: SourceDocument,
    pub user_id: Option<String>,
    pub document_id: Option<String>,
    pub project_id: Option<String>,
    /// Number of earlier attempts for the same logical document.
    pub retry_count: u32,
    pub options: RetryOptions,
}

impl DocumentRequest {
    pub fn new(source: SourceDocument) -> Self {
        Self {
            source,
            user_id: None,
            document_id: None,
            project_id: None,
            retry_count: 0,
            options: RetryOptions::default(),
        }
    }

    pub fn with_document(mut self, document_id: &str) -> Self {
        self.document_id = Some(document_id.to_string());
        self
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// Mark this request as retry number `retry_count` with adjusted options.
    pub fn retry(mut self, retry_count: u32, options: RetryOptions) -> Self {
        self.retry_count = retry_count;
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "outcome")]
pub enum PipelineStage {
    Detecting,
    ExtractingPrimary,
    ExtractingFallback,
    Analyzing,
    Finalized(Outcome),
}

impl PipelineStage {
    /// Legal edges of the attempt state machine. `Detecting` may jump
    /// straight to the fallback when the caller asked for the alternative
    /// method.
    pub fn can_transition_to(self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        matches!(
            (self, next),
            (Detecting, ExtractingPrimary)
                | (Detecting, ExtractingFallback)
                | (Detecting, Finalized(Outcome::Failed))
                | (ExtractingPrimary, ExtractingFallback)
                | (ExtractingPrimary, Analyzing)
                | (ExtractingPrimary, Finalized(_))
                | (ExtractingFallback, Analyzing)
                | (ExtractingFallback, Finalized(_))
                | (Analyzing, Finalized(_))
        )
    }
}

/// One run of the pipeline against one upload. Immutable once finalized.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionAttempt {
    pub attempt_id: Uuid,
    pub request_id: String,
    pub document_id: Option<String>,
    pub project_id: Option<String>,
    pub retry_count: u32,
    pub options: RetryOptions,
    /// SHA-256 (base64) of the source bytes; identical across retries.
    pub content_hash: String,
    pub format: Option<FormatKind>,
    /// Every stage entered, in order.
    pub stages: Vec<PipelineStage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExtractionAttempt {
    fn begin(request: &DocumentRequest, request_id: &str) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            request_id: request_id.to_string(),
            document_id: request.document_id.clone(),
            project_id: request.project_id.clone(),
            retry_count: request.retry_count,
            options: request.options,
            content_hash: compute_content_hash(&request.source.bytes),
            format: None,
            stages: vec![PipelineStage::Detecting],
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stages.last().copied().unwrap_or(PipelineStage::Detecting)
    }

    fn advance(&mut self, next: PipelineStage) {
        let current = self.stage();
        if !current.can_transition_to(next) {
            tracing::error!(from = ?current, to = ?next, "Illegal pipeline transition");
        }
        tracing::debug!(from = ?current, to = ?next, "Pipeline stage");
        self.stages.push(next);
    }

    fn finalize(&mut self, outcome: Outcome) {
        self.advance(PipelineStage::Finalized(outcome));
        self.finished_at = Some(Utc::now());
    }
}

/// What the upload layer receives.
///
/// `failed` implies `text` is empty; `partial` implies `text` is non-empty
/// and either the OCR fallback or content analysis left it incomplete.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub outcome: Outcome,
    pub text: String,
    /// Empty when analysis is unavailable.
    pub summary: String,
    pub metadata: BTreeMap<String, String>,
    pub figures: Vec<Figure>,
    pub tables: Vec<Table>,
    pub processing_details: ProcessingDetails,
    /// User-safe message, present on failed and partial outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,
    /// Whether offering a retry (possibly with other options) makes sense.
    pub can_retry: bool,
    pub attempt: ExtractionAttempt,
}

/// Terminal failure of an attempt, with the trail gathered so far.
struct AttemptFailure {
    error: ExtractionError,
    fallback_error: Option<ExtractionError>,
    details: ProcessingDetails,
}

impl AttemptFailure {
    fn new(error: ExtractionError, mut details: ProcessingDetails) -> Self {
        if details.end_time.is_none() {
            details.finish();
        }
        Self {
            error,
            fallback_error: None,
            details,
        }
    }

    fn user_message(&self) -> String {
        match &self.fallback_error {
            Some(_) => format!("{}; the OCR fallback also failed", self.error.user_message()),
            None => self.error.user_message(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct DocumentProcessor {
    pdf: Arc<PdfExtractor>,
    renderer: Option<Arc<dyn PdfPageRenderer + Send + Sync>>,
    ocr: Option<Arc<dyn OcrEngine + Send + Sync>>,
    analyzer: Option<Arc<dyn ContentAnalyzer + Send + Sync>>,
    logger: DiagnosticLogger,
    ocr_timeout: Duration,
    analysis_timeout: Duration,
    max_analysis_chars: usize,
    size_limits: SizeLimits,
}

impl DocumentProcessor {
    /// Processor with the given PDF backend and no fallback, analysis or
    /// diagnostic sinks. Add capabilities with the `with_*` builders.
    pub fn new(pdf_backend: Box<dyn PdfBackend + Send + Sync>, config: &PipelineConfig) -> Self {
        Self {
            pdf: Arc::new(PdfExtractor::new(pdf_backend, config.detect_structures)),
            renderer: None,
            ocr: None,
            analyzer: None,
            logger: DiagnosticLogger::new(),
            ocr_timeout: config.ocr_timeout,
            analysis_timeout: config.analysis_timeout,
            max_analysis_chars: config.max_analysis_chars,
            size_limits: config.size_limits.clone(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PdfPageRenderer + Send + Sync>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine + Send + Sync>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ContentAnalyzer + Send + Sync>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_logger(mut self, logger: DiagnosticLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Resolve every capability once from configuration.
    ///
    /// - PDF: lopdf text layer
    /// - Renderer: PDFium when the library loads, else embedded-image
    ///   extraction via lopdf
    /// - OCR / analysis: Ollama models when configured, otherwise disabled
    /// - Diagnostics: console plus the configured sinks
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ProcessingError> {
        if config.ocr_timeout.is_zero() || config.analysis_timeout.is_zero() {
            return Err(ProcessingError::InvalidConfig(
                "OCR and analysis timeouts must be non-zero".into(),
            ));
        }
        if config.max_analysis_chars == 0 {
            return Err(ProcessingError::InvalidConfig(
                "max_analysis_chars must be positive".into(),
            ));
        }

        let renderer: Arc<dyn PdfPageRenderer + Send + Sync> = match PdfiumRenderer::new() {
            Ok(pdfium) => {
                tracing::info!("PDF page rendering via PDFium");
                Arc::new(pdfium)
            }
            Err(e) => {
                tracing::warn!(error = %e, "PDFium unavailable, OCR fallback uses embedded page images");
                Arc::new(LopdfImageExtractor)
            }
        };

        let mut processor = Self::new(Box::new(LopdfBackend), config)
            .with_renderer(renderer)
            .with_logger(DiagnosticLogger::from_config(config));

        match &config.ocr_model {
            Some(model) => {
                tracing::info!(model = %model, "OCR fallback via Ollama vision model");
                processor = processor.with_ocr(Arc::new(OllamaVisionOcr::new(
                    &config.ollama_url,
                    model,
                    config.ocr_timeout,
                )));
            }
            None => tracing::info!("No OCR model configured, PDF fallback disabled"),
        }

        match &config.analysis_model {
            Some(model) => {
                tracing::info!(model = %model, "Content analysis via Ollama");
                processor = processor.with_analyzer(Arc::new(OllamaAnalyzer::new(
                    &config.ollama_url,
                    model,
                    config.analysis_timeout,
                )));
            }
            None => tracing::info!("No analysis model configured, summaries disabled"),
        }

        Ok(processor)
    }

    /// Run one extraction attempt. Never fails: every error is folded into
    /// the returned `ExtractionResult`.
    pub async fn process_document(
        &self,
        request: DocumentRequest,
        cancel: &CancelFlag,
    ) -> ExtractionResult {
        let context = LogContext {
            request_id: new_request_id(),
            document_id: request.document_id.clone(),
            project_id: request.project_id.clone(),
            user_id: request.user_id.clone(),
            file_name: Some(request.source.filename.clone()),
            file_type: Some(effective_mime(
                &request.source.filename,
                &request.source.declared_mime,
            )),
            file_size: Some(request.source.declared_size),
        };
        let attempt = ExtractionAttempt::begin(&request, &context.request_id);
        let span = tracing::info_span!(
            "process_document",
            attempt_id = %attempt.attempt_id,
            request_id = %context.request_id,
            file = %request.source.filename,
            retry = request.retry_count,
        );

        self.run_attempt(&request, &context, attempt, cancel)
            .instrument(span)
            .await
    }

    async fn run_attempt(
        &self,
        request: &DocumentRequest,
        ctx: &LogContext,
        mut attempt: ExtractionAttempt,
        cancel: &CancelFlag,
    ) -> ExtractionResult {
        tracing::info!(
            size = request.source.len(),
            options = ?request.options,
            "Extraction attempt started"
        );

        if cancel.is_cancelled() {
            let failure = AttemptFailure::new(
                ExtractionError::Cancelled,
                ProcessingDetails::started(ExtractionMethod::None),
            );
            self.record_failure(ctx, request, &failure, "detecting");
            return self.failed(attempt, failure);
        }

        // Detecting
        let kind = match detect_format(&request.source.filename, &request.source.declared_mime) {
            Ok(kind) => kind,
            Err(e) => {
                let failure = AttemptFailure::new(
                    e.into(),
                    ProcessingDetails::started(ExtractionMethod::None),
                );
                self.record_failure(ctx, request, &failure, "detecting");
                return self.failed(attempt, failure);
            }
        };
        attempt.format = Some(kind);

        let validation_warnings = match validate_source(&request.source, kind, &self.size_limits) {
            Ok(warnings) => warnings,
            Err(e) => {
                let failure = AttemptFailure::new(
                    e.into(),
                    ProcessingDetails::started(ExtractionMethod::None),
                );
                self.record_failure(ctx, request, &failure, "validation");
                return self.failed(attempt, failure);
            }
        };
        for warning in &validation_warnings {
            self.record(
                ctx,
                ErrorLogEntry::new(ErrorCategory::FileValidation, ErrorSeverity::Warning, warning),
            );
        }

        // Extracting
        let extracted = match kind {
            FormatKind::Pdf => self.extract_pdf(request, ctx, &mut attempt, cancel).await,
            FormatKind::Docx => {
                self.extract_other(request, ctx, &mut attempt, cancel, "DOCX extraction", extract_docx)
                    .await
            }
            FormatKind::Latex => {
                self.extract_other(request, ctx, &mut attempt, cancel, "LaTeX extraction", extract_latex)
                    .await
            }
            FormatKind::PlainText => {
                self.extract_other(
                    request,
                    ctx,
                    &mut attempt,
                    cancel,
                    "text extraction",
                    extract_plain_text,
                )
                .await
            }
        };

        let (mut content, fallback_note) = match extracted {
            Ok(recovered) => recovered,
            Err(failure) => return self.failed(attempt, failure),
        };
        let mut warnings: Vec<String> =
            validation_warnings.iter().map(|w| sanitize_message(w)).collect();
        warnings.append(&mut content.details.warnings);
        content.details.warnings = warnings;

        let mut notes: Vec<String> = fallback_note.into_iter().collect();
        let mut error_details = serde_json::Map::new();
        if content.details.used_fallback_method {
            error_details.insert("fallback_method".into(), json!("ocr"));
            if let Some(primary) = &content.details.primary_method_error {
                error_details.insert("primary_error".into(), json!(primary));
            }
        }

        if content.text.is_empty() {
            content.details.warnings.push(EMPTY_TEXT_WARNING.to_string());
            self.record(
                ctx,
                ErrorLogEntry::new(
                    ErrorCategory::DocumentExtraction,
                    ErrorSeverity::Warning,
                    EMPTY_TEXT_WARNING,
                ),
            );
        }

        // Analyzing
        let mut summary = String::new();
        if let Some(analyzer) = self.analyzer.as_ref().filter(|_| !content.text.is_empty()) {
            attempt.advance(PipelineStage::Analyzing);
            match self.analyze(Arc::clone(analyzer), &content.text, cancel).await {
                Ok(text) => summary = text,
                Err(ExtractionError::Cancelled) => {
                    let failure = AttemptFailure::new(ExtractionError::Cancelled, content.details);
                    self.record_failure(ctx, request, &failure, "analyzing");
                    return self.failed(attempt, failure);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Content analysis unavailable, keeping extracted text");
                    self.record(
                        ctx,
                        ErrorLogEntry::new(e.category(), ErrorSeverity::Warning, e.to_string())
                            .with_details(json!({
                                "stage": "analyzing",
                                "text_length": content.text.len(),
                                "retry_count": request.retry_count,
                            })),
                    );
                    error_details.insert(
                        "analysis_error".into(),
                        json!(sanitize_message(&e.to_string())),
                    );
                    notes.push(e.user_message());
                }
            }
        }

        let outcome = if notes.is_empty() {
            Outcome::Success
        } else {
            Outcome::Partial
        };
        attempt.finalize(outcome);

        self.record(
            ctx,
            ErrorLogEntry::new(
                ErrorCategory::DocumentExtraction,
                ErrorSeverity::Info,
                format!("Document extraction finished ({outcome:?})"),
            )
            .with_details(json!({
                "outcome": outcome,
                "text_length": content.text.len(),
                "figures": content.figures.len(),
                "tables": content.tables.len(),
                "has_summary": !summary.is_empty(),
                "retry_count": request.retry_count,
                "processing_details": content.details,
            })),
        );
        tracing::info!(
            outcome = ?outcome,
            method = ?content.details.extraction_method,
            chars = content.text.len(),
            warnings = content.details.warnings.len(),
            "Extraction attempt finished"
        );

        ExtractionResult {
            success: true,
            outcome,
            text: content.text,
            summary,
            metadata: content.metadata,
            figures: content.figures,
            tables: content.tables,
            processing_details: content.details,
            error: (!notes.is_empty()).then(|| notes.join(". ")),
            error_details: (!error_details.is_empty()).then(|| serde_json::Value::Object(error_details)),
            can_retry: outcome == Outcome::Partial,
            attempt,
        }
    }

    /// Primary PDF extraction with OCR fallback. Returns the recovered
    /// content plus a user-facing note when the fallback produced it.
    async fn extract_pdf(
        &self,
        request: &DocumentRequest,
        ctx: &LogContext,
        attempt: &mut ExtractionAttempt,
        cancel: &CancelFlag,
    ) -> Result<(ExtractedContent, Option<String>), AttemptFailure> {
        let options = request.options;
        let bytes = Arc::clone(&request.source.bytes);

        let (primary, primary_error, parent_id) = if options.use_alternative_method {
            let entry = ErrorLogEntry::new(
                ErrorCategory::PdfProcessing,
                ErrorSeverity::Info,
                "Alternative extraction method requested; primary PDF parser skipped",
            )
            .with_details(json!({ "retry_count": request.retry_count, "options": options }));
            let id = self.record(ctx, entry);
            (None, None, id)
        } else {
            attempt.advance(PipelineStage::ExtractingPrimary);
            let extractor = Arc::clone(&self.pdf);
            let task_bytes = Arc::clone(&bytes);
            let task_cancel = cancel.clone();
            let result = run_bounded("PDF extraction", None, cancel, move || {
                extractor.extract(&task_bytes, &options, &task_cancel)
            })
            .await;

            match result {
                Ok(content) => {
                    self.record_page_warnings(ctx, &content.details.warnings);
                    if !content.text.is_empty() {
                        return Ok((content, None));
                    }
                    let error = ExtractionError::NoTextContent;
                    let id = self.record_primary_failure(ctx, request, &error, ErrorSeverity::Warning);
                    (Some(content), Some(error), id)
                }
                Err(error) if error.triggers_fallback() => {
                    let id = self.record_primary_failure(ctx, request, &error, ErrorSeverity::Error);
                    (None, Some(error), id)
                }
                Err(error) => {
                    let failure =
                        AttemptFailure::new(error, ProcessingDetails::started(ExtractionMethod::Primary));
                    self.record_failure(ctx, request, &failure, "extracting_primary");
                    return Err(failure);
                }
            }
        };

        attempt.advance(PipelineStage::ExtractingFallback);
        let (metadata, mut details) = match primary {
            Some(content) => (content.metadata, content.details),
            None => (BTreeMap::new(), ProcessingDetails::started(ExtractionMethod::Ocr)),
        };
        details.extraction_method = ExtractionMethod::Ocr;
        details.used_fallback_method = true;
        details.fallback_method = Some("ocr".into());
        details.primary_method_error = primary_error.as_ref().map(|e| sanitize_message(&e.to_string()));
        details.end_time = None;

        match self.run_ocr(bytes, cancel).await {
            Ok(ocr) => {
                details.ocr_confidence = Some(ocr.confidence);
                details.page_count.get_or_insert(ocr.page_count);
                details.warnings.push(OCR_FIRST_PAGE_WARNING.to_string());
                details.finish();

                self.record(
                    ctx,
                    ErrorLogEntry::new(
                        ErrorCategory::PdfProcessing,
                        ErrorSeverity::Info,
                        "OCR fallback recovered text from the first page",
                    )
                    .with_parent(parent_id)
                    .with_details(json!({
                        "confidence": ocr.confidence,
                        "text_length": ocr.text.len(),
                        "page_count": ocr.page_count,
                        "primary_error": details.primary_method_error,
                    })),
                );

                let note = match &primary_error {
                    Some(e) => format!("{}; text was recovered from the first page only using OCR", e.user_message()),
                    None => OCR_FIRST_PAGE_WARNING.to_string(),
                };
                let content = ExtractedContent {
                    text: ocr.text,
                    metadata,
                    figures: Vec::new(),
                    tables: Vec::new(),
                    details,
                };
                Ok((content, Some(note)))
            }
            Err(ExtractionError::Cancelled) => {
                let failure = AttemptFailure::new(ExtractionError::Cancelled, details);
                self.record(
                    ctx,
                    ErrorLogEntry::new(
                        failure.error.category(),
                        ErrorSeverity::Warning,
                        "OCR fallback cancelled",
                    )
                    .with_parent(parent_id)
                    .with_details(json!({
                        "stage": "extracting_fallback",
                        "kind": "cancelled",
                        "retry_count": request.retry_count,
                    })),
                );
                Err(failure)
            }
            Err(fallback_error) => {
                details.finish();
                let failure = match primary_error {
                    Some(primary_error) => {
                        self.record(
                            ctx,
                            ErrorLogEntry::new(
                                ErrorCategory::PdfProcessing,
                                ErrorSeverity::Critical,
                                format!(
                                    "Primary extraction and OCR fallback both failed. Primary: {primary_error}. Fallback: {fallback_error}"
                                ),
                            )
                            .with_parent(parent_id)
                            .with_details(json!({
                                "primary_error": primary_error.to_string(),
                                "primary_kind": error_kind(&primary_error),
                                "fallback_error": fallback_error.to_string(),
                                "fallback_kind": error_kind(&fallback_error),
                                "retry_count": request.retry_count,
                                "options": options,
                            })),
                        );
                        AttemptFailure {
                            error: primary_error,
                            fallback_error: Some(fallback_error),
                            details,
                        }
                    }
                    None => {
                        let failure = AttemptFailure::new(fallback_error, details);
                        self.record(
                            ctx,
                            ErrorLogEntry::new(
                                failure.error.category(),
                                severity_for(&failure.error),
                                format!("Alternative extraction method failed: {}", failure.error),
                            )
                            .with_parent(parent_id)
                            .with_details(json!({ "kind": error_kind(&failure.error) })),
                        );
                        failure
                    }
                };
                Err(failure)
            }
        }
    }

    /// DOCX, LaTeX and plain text: a single extractor, no fallback.
    async fn extract_other(
        &self,
        request: &DocumentRequest,
        ctx: &LogContext,
        attempt: &mut ExtractionAttempt,
        cancel: &CancelFlag,
        stage: &'static str,
        extract: fn(&[u8]) -> Result<ExtractedContent, ExtractionError>,
    ) -> Result<(ExtractedContent, Option<String>), AttemptFailure> {
        attempt.advance(PipelineStage::ExtractingPrimary);
        let bytes = Arc::clone(&request.source.bytes);
        match run_bounded(stage, None, cancel, move || extract(&bytes)).await {
            Ok(content) => Ok((content, None)),
            Err(error) => {
                let failure = AttemptFailure::new(error, ProcessingDetails::started(ExtractionMethod::None));
                self.record_failure(ctx, request, &failure, "extracting_primary");
                Err(failure)
            }
        }
    }

    async fn run_ocr(
        &self,
        bytes: Arc<[u8]>,
        cancel: &CancelFlag,
    ) -> Result<OcrExtraction, ExtractionError> {
        let (renderer, ocr) = match (&self.renderer, &self.ocr) {
            (Some(renderer), Some(ocr)) => (Arc::clone(renderer), Arc::clone(ocr)),
            _ => return Err(ExtractionError::OcrUnavailable),
        };
        run_bounded("OCR", Some(self.ocr_timeout), cancel, move || {
            extract_with_ocr(&bytes, FormatKind::Pdf, renderer.as_ref(), ocr.as_ref())
        })
        .await
    }

    async fn analyze(
        &self,
        analyzer: Arc<dyn ContentAnalyzer + Send + Sync>,
        text: &str,
        cancel: &CancelFlag,
    ) -> Result<String, ExtractionError> {
        let input = truncate_for_analysis(text, self.max_analysis_chars).to_string();
        let response = run_bounded("analysis", Some(self.analysis_timeout), cancel, move || {
            Ok(analyzer.summarize(&input))
        })
        .await
        .map_err(|e| match e {
            ExtractionError::TimedOut { secs, .. } => {
                ExtractionError::AnalysisUnavailable(format!("timed out after {secs}s"))
            }
            other => other,
        })?;

        if response.success {
            Ok(response.summary)
        } else {
            Err(ExtractionError::AnalysisUnavailable(
                response
                    .error
                    .unwrap_or_else(|| "analysis service reported failure".into()),
            ))
        }
    }

    fn failed(&self, mut attempt: ExtractionAttempt, failure: AttemptFailure) -> ExtractionResult {
        attempt.finalize(Outcome::Failed);
        tracing::warn!(error = %failure.error, "Extraction attempt failed");

        let mut error_details = json!({
            "category": failure.error.category(),
            "kind": error_kind(&failure.error),
            "error": sanitize_message(&failure.error.to_string()),
        });
        if let Some(fallback) = &failure.fallback_error {
            error_details["fallback_error"] = json!(sanitize_message(&fallback.to_string()));
            error_details["fallback_kind"] = json!(error_kind(fallback));
        }

        ExtractionResult {
            success: false,
            outcome: Outcome::Failed,
            text: String::new(),
            summary: String::new(),
            metadata: BTreeMap::new(),
            figures: Vec::new(),
            tables: Vec::new(),
            error: Some(failure.user_message()),
            error_details: Some(error_details),
            can_retry: failure.error.can_retry(),
            processing_details: failure.details,
            attempt,
        }
    }

    // -- Diagnostics -------------------------------------------------------

    fn record(&self, ctx: &LogContext, entry: ErrorLogEntry) -> Uuid {
        let entry = entry.with_context(ctx);
        self.logger.log(&entry);
        entry.id
    }

    fn record_failure(
        &self,
        ctx: &LogContext,
        request: &DocumentRequest,
        failure: &AttemptFailure,
        stage: &str,
    ) -> Uuid {
        self.record(
            ctx,
            ErrorLogEntry::new(
                failure.error.category(),
                severity_for(&failure.error),
                failure.error.to_string(),
            )
            .with_details(json!({
                "stage": stage,
                "kind": error_kind(&failure.error),
                "can_retry": failure.error.can_retry(),
                "retry_count": request.retry_count,
                "options": request.options,
            })),
        )
    }

    fn record_primary_failure(
        &self,
        ctx: &LogContext,
        request: &DocumentRequest,
        error: &ExtractionError,
        severity: ErrorSeverity,
    ) -> Uuid {
        tracing::warn!(error = %error, "Primary PDF extraction failed, trying OCR fallback");
        self.record(
            ctx,
            ErrorLogEntry::new(error.category(), severity, error.to_string()).with_details(json!({
                "stage": "extracting_primary",
                "kind": error_kind(error),
                "fallback": "ocr",
                "retry_count": request.retry_count,
                "options": request.options,
            })),
        )
    }

    /// One WARNING entry per recovered page or metadata failure.
    fn record_page_warnings(&self, ctx: &LogContext, warnings: &[String]) {
        for warning in warnings.iter().filter(|w| w.as_str() != NO_TEXT_WARNING) {
            self.record(
                ctx,
                ErrorLogEntry::new(ErrorCategory::PdfProcessing, ErrorSeverity::Warning, warning),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run blocking `work` on the blocking pool, bounded by `limit` (if any)
/// and abandoned as soon as `cancel` fires.
///
/// An abandoned task keeps running to completion in the background; its
/// result is dropped. Blocking engines carry their own I/O timeouts.
async fn run_bounded<T, F>(
    stage: &'static str,
    limit: Option<Duration>,
    cancel: &CancelFlag,
    work: F,
) -> Result<T, ExtractionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExtractionError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    let bounded = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                tracing::warn!(stage, secs = limit.as_secs_f64(), "Stage timed out");
                ExtractionError::TimedOut {
                    stage: stage.to_string(),
                    secs: limit.as_secs(),
                }
            }),
            None => Ok(task.await),
        }
    };

    tokio::select! {
        joined = bounded => match joined? {
            Ok(result) => result,
            Err(e) => Err(ExtractionError::Unexpected(format!("{stage} task failed: {e}"))),
        },
        _ = cancel.cancelled() => {
            tracing::info!(stage, "Stage cancelled");
            Err(ExtractionError::Cancelled)
        }
    }
}

fn severity_for(error: &ExtractionError) -> ErrorSeverity {
    match error {
        ExtractionError::Cancelled => ErrorSeverity::Warning,
        _ => ErrorSeverity::Error,
    }
}

/// Stable machine-readable tag for log details and `error_details`.
fn error_kind(error: &ExtractionError) -> &'static str {
    match error {
        ExtractionError::UnsupportedFormat(_) => "unsupported_format",
        ExtractionError::FileValidation(_) => "file_validation",
        ExtractionError::PdfLoad(e) => e.kind(),
        ExtractionError::NoTextContent => "no_text_content",
        ExtractionError::PageExtraction { .. } => "page_extraction",
        ExtractionError::Metadata(_) => "metadata",
        ExtractionError::PdfRendering { .. } => "pdf_rendering",
        ExtractionError::ImageProcessing(_) => "image_processing",
        ExtractionError::OcrFailed(_) => "ocr_failed",
        ExtractionError::OcrUnavailable => "ocr_unavailable",
        ExtractionError::DocxExtraction(_) => "docx_extraction",
        ExtractionError::LatexExtraction(_) => "latex_extraction",
        ExtractionError::PlainTextRead(_) => "plain_text_read",
        ExtractionError::AnalysisUnavailable(_) => "analysis_unavailable",
        ExtractionError::TimedOut { .. } => "timed_out",
        ExtractionError::Cancelled => "cancelled",
        ExtractionError::Unexpected(_) => "unexpected",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::MockAnalyzer;
    use crate::pipeline::diagnostics::RecordingSink;
    use crate::pipeline::extraction::docx::test_docx::make_test_docx;
    use crate::pipeline::extraction::pdf::test_pdf::make_test_pdf;
    use crate::pipeline::extraction::pdfium::MockPdfPageRenderer;
    use crate::pipeline::extraction::{
        LoadedPdf, MockOcrEngine, MockPdfBackend, PdfLoadError, PdfMetadata,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAKE_PDF: &[u8] = b"%PDF-1.7\n% scripted by MockPdfBackend\n%%EOF";

    struct Harness {
        processor: DocumentProcessor,
        sink: Arc<RecordingSink>,
        ocr: Arc<MockOcrEngine>,
        analyzer: Arc<MockAnalyzer>,
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            error_log_db: None,
            ..PipelineConfig::default()
        }
    }

    fn harness_with(
        backend: MockPdfBackend,
        ocr: MockOcrEngine,
        analyzer: MockAnalyzer,
        config: &PipelineConfig,
    ) -> Harness {
        let sink = Arc::new(RecordingSink::new());
        let ocr = Arc::new(ocr);
        let analyzer = Arc::new(analyzer);
        let processor = DocumentProcessor::new(Box::new(backend), config)
            .with_renderer(Arc::new(MockPdfPageRenderer::new(1)))
            .with_ocr(ocr.clone())
            .with_analyzer(analyzer.clone())
            .with_logger(DiagnosticLogger::new().with_sink(sink.clone()));
        Harness {
            processor,
            sink,
            ocr,
            analyzer,
        }
    }

    fn harness(backend: MockPdfBackend) -> Harness {
        harness_with(
            backend,
            MockOcrEngine::new("Recovered abstract from page one", 0.7),
            MockAnalyzer::new("A concise summary."),
            &test_config(),
        )
    }

    fn pdf_request(filename: &str) -> DocumentRequest {
        DocumentRequest::new(SourceDocument::new(FAKE_PDF.to_vec(), filename, "application/pdf"))
            .with_document("doc-1")
            .with_project("proj-1")
    }

    fn request(bytes: &[u8], filename: &str, mime: &str) -> DocumentRequest {
        DocumentRequest::new(SourceDocument::new(bytes.to_vec(), filename, mime))
    }

    async fn run(h: &Harness, request: DocumentRequest) -> ExtractionResult {
        h.processor.process_document(request, &CancelFlag::new()).await
    }

    fn entries_with(h: &Harness, severity: ErrorSeverity) -> Vec<ErrorLogEntry> {
        h.sink
            .entries()
            .into_iter()
            .filter(|e| e.severity == severity)
            .collect()
    }

    fn assert_legal_trail(stages: &[PipelineStage]) {
        assert_eq!(stages.first(), Some(&PipelineStage::Detecting));
        for pair in stages.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "illegal {:?}", pair);
        }
        assert!(matches!(stages.last(), Some(PipelineStage::Finalized(_))));
    }

    // -- Format coverage ---------------------------------------------------

    #[tokio::test]
    async fn plain_text_full_pipeline() {
        let h = harness(MockPdfBackend::new(&[]));
        let result = run(&h, request(b"Results show a 4% gain.", "notes.txt", "text/plain")).await;

        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.text, "Results show a 4% gain.");
        assert_eq!(result.summary, "A concise summary.");
        assert!(result.error.is_none());
        assert_eq!(result.processing_details.extraction_method, ExtractionMethod::PlainText);
        assert_eq!(
            result.attempt.stages,
            vec![
                PipelineStage::Detecting,
                PipelineStage::ExtractingPrimary,
                PipelineStage::Analyzing,
                PipelineStage::Finalized(Outcome::Success),
            ]
        );
        assert_eq!(result.attempt.format, Some(FormatKind::PlainText));
        assert!(result.attempt.finished_at.is_some());
    }

    #[tokio::test]
    async fn docx_full_pipeline() {
        let h = harness(MockPdfBackend::new(&[]));
        let bytes = make_test_docx(&["Abstract", "We propose a sparse model."], Some("Sparse Models"));
        let result = run(
            &h,
            request(
                &bytes,
                "paper.docx",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ),
        )
        .await;

        assert!(result.success);
        assert!(result.text.contains("We propose a sparse model."));
        assert_eq!(result.metadata["title"], "Sparse Models");
        assert_eq!(result.processing_details.extraction_method, ExtractionMethod::DocxRawText);
    }

    #[tokio::test]
    async fn latex_full_pipeline() {
        let h = harness(MockPdfBackend::new(&[]));
        let src = b"\\documentclass{article}\\begin{document}\\section{Intro}Graphs $G=(V,E)$ matter.\\end{document}";
        let result = run(&h, request(src, "main.tex", "application/x-tex")).await;

        assert!(result.success);
        assert!(result.text.contains("Intro"));
        assert!(result.text.contains("Graphs matter."));
        assert_eq!(result.processing_details.extraction_method, ExtractionMethod::LatexStrip);
    }

    #[tokio::test]
    async fn real_pdf_through_lopdf() {
        let sink = Arc::new(RecordingSink::new());
        let processor = DocumentProcessor::new(Box::new(LopdfBackend), &test_config())
            .with_logger(DiagnosticLogger::new().with_sink(sink.clone()));
        let bytes = make_test_pdf(&["Transformers replace recurrence", "Figure 1: Architecture"]);
        let result = processor
            .process_document(request(&bytes, "paper.pdf", "application/pdf"), &CancelFlag::new())
            .await;

        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.text.contains("Transformers replace recurrence"));
        assert_eq!(result.processing_details.page_count, Some(2));
        assert_eq!(result.figures.len(), 1);
        assert_eq!(result.figures[0].page_number, 2);
        assert_eq!(result.metadata["title"], "Attention Is All You Need");
        assert!(result.summary.is_empty());
    }

    // -- Detection and validation -----------------------------------------

    #[tokio::test]
    async fn unsupported_format_never_reaches_an_extractor() {
        let h = harness(MockPdfBackend::new(&["text"]));
        let result = run(&h, request(b"slides", "talk.pptx", "application/vnd.ms-powerpoint")).await;

        assert!(!result.success);
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.text.is_empty());
        assert!(result.error.as_deref().unwrap().contains("Unsupported file format"));
        assert!(!result.can_retry);
        assert_eq!(
            result.attempt.stages,
            vec![PipelineStage::Detecting, PipelineStage::Finalized(Outcome::Failed)]
        );
        assert_eq!(h.ocr.call_count(), 0);
        assert_eq!(h.analyzer.call_count(), 0);

        let errors = entries_with(&h, ErrorSeverity::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::DocumentExtraction);
    }

    #[tokio::test]
    async fn oversized_upload_is_a_validation_failure() {
        let mut config = test_config();
        config.size_limits.plain_text = 8;
        let h = harness_with(
            MockPdfBackend::new(&[]),
            MockOcrEngine::new("x", 0.5),
            MockAnalyzer::new("s"),
            &config,
        );
        let result = run(&h, request(b"more than eight bytes", "a.txt", "text/plain")).await;

        assert!(!result.success);
        assert_eq!(result.error_details.as_ref().unwrap()["category"], "file_validation");
        assert_eq!(h.sink.entries()[0].category, ErrorCategory::FileValidation);
    }

    #[tokio::test]
    async fn mime_mismatch_is_only_a_warning() {
        let h = harness(MockPdfBackend::new(&[]));
        let result = run(&h, request(b"Plain words.", "notes.txt", "image/png")).await;

        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.processing_details.warnings.len(), 1);
        assert!(result.processing_details.warnings[0].contains("image/png"));
        assert_eq!(entries_with(&h, ErrorSeverity::Warning).len(), 1);
    }

    // -- PDF primary path ---------------------------------------------------

    #[tokio::test]
    async fn corrupt_middle_page_is_isolated() {
        let backend = MockPdfBackend::new(&["Page one findings", "Page two", "Page three results"])
            .with_broken_page(2);
        let h = harness(backend);
        let result = run(&h, pdf_request("sample.pdf")).await;

        assert!(result.success);
        assert!(!result.processing_details.used_fallback_method);
        assert_eq!(result.processing_details.warnings.len(), 1);
        assert!(result.processing_details.warnings[0].contains("page 2"));
        assert!(result.text.contains("Page one findings"));
        assert!(result.text.contains("Page three results"));
        assert!(!result.text.contains("Page two"));
        assert_eq!(h.ocr.call_count(), 0);

        let warnings = entries_with(&h, ErrorSeverity::Warning);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].category, ErrorCategory::PdfProcessing);
        assert_eq!(warnings[0].context.document_id.as_deref(), Some("doc-1"));
    }

    #[tokio::test]
    async fn successful_attempt_logs_info_summary() {
        let h = harness(MockPdfBackend::new(&["Figure 2: Results", "Table 1 Ablation"]));
        let result = run(&h, pdf_request("paper.pdf")).await;

        assert_eq!(result.outcome, Outcome::Success);
        let infos = entries_with(&h, ErrorSeverity::Info);
        assert_eq!(infos.len(), 1);
        let details = infos[0].details.as_ref().unwrap();
        assert_eq!(details["figures"], 1);
        assert_eq!(details["tables"], 1);
        assert_eq!(details["outcome"], "success");
    }

    // -- Fallback -----------------------------------------------------------

    #[tokio::test]
    async fn empty_text_triggers_fallback() {
        let h = harness(MockPdfBackend::new(&["", "   "]));
        let result = run(&h, pdf_request("scanned.pdf")).await;

        assert_eq!(h.ocr.call_count(), 1);
        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Partial);
        assert_eq!(result.text, "Recovered abstract from page one");
        let details = &result.processing_details;
        assert!(details.used_fallback_method);
        assert_eq!(details.extraction_method, ExtractionMethod::Ocr);
        assert_eq!(details.fallback_method.as_deref(), Some("ocr"));
        assert!(details.primary_method_error.as_deref().unwrap().contains("No text content"));
        assert_eq!(details.ocr_confidence, Some(0.7));
        assert!(details.warnings.contains(&OCR_FIRST_PAGE_WARNING.to_string()));
        assert!(result.attempt.stages.contains(&PipelineStage::ExtractingFallback));
        assert_legal_trail(&result.attempt.stages);
    }

    #[tokio::test]
    async fn parser_panic_still_reaches_ocr_fallback() {
        let h = harness(MockPdfBackend::new(&["never read"]).panicking_on_load());
        let result = run(&h, pdf_request("mangled.pdf")).await;

        assert_eq!(h.ocr.call_count(), 1);
        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Partial);
        assert_eq!(result.text, "Recovered abstract from page one");
        assert!(result
            .processing_details
            .primary_method_error
            .as_deref()
            .unwrap()
            .contains("parser panicked"));
        assert!(result.attempt.stages.contains(&PipelineStage::ExtractingFallback));
    }

    #[tokio::test]
    async fn panicking_page_is_a_warning_not_a_failure() {
        let h = harness(MockPdfBackend::new(&["Intro", "Methods", "Results"]).with_panicking_page(2));
        let result = run(&h, pdf_request("paper.pdf")).await;

        assert!(result.success);
        assert_eq!(h.ocr.call_count(), 0);
        assert!(result.text.contains("Intro") && result.text.contains("Results"));
        assert!(!result.text.contains("Methods"));
        assert!(result.processing_details.warnings.iter().any(|w| w.contains("page 2")));
    }

    #[tokio::test]
    async fn fallback_entry_links_to_primary_failure() {
        let h = harness(MockPdfBackend::failing(PdfLoadError::CorruptXref));
        let result = run(&h, pdf_request("broken.pdf")).await;
        assert_eq!(result.outcome, Outcome::Partial);

        let entries = h.sink.entries();
        let primary = entries
            .iter()
            .find(|e| e.severity == ErrorSeverity::Error)
            .unwrap();
        let recovered = entries
            .iter()
            .find(|e| e.message.contains("OCR fallback recovered"))
            .unwrap();
        assert_eq!(recovered.parent_id, Some(primary.id));
        assert!(result.error.as_deref().unwrap().contains("invalid or corrupted"));
    }

    #[tokio::test]
    async fn encrypted_pdf_attempts_fallback_then_fails() {
        let h = harness_with(
            MockPdfBackend::failing(PdfLoadError::Encrypted),
            MockOcrEngine::failing("engine down"),
            MockAnalyzer::new("unused"),
            &test_config(),
        );
        let result = run(&h, pdf_request("encrypted.pdf")).await;

        assert_eq!(h.ocr.call_count(), 1);
        assert!(!result.success);
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.text.is_empty());
        let error = result.error.as_deref().unwrap();
        assert!(error.contains("encrypted"));
        assert!(!error.contains("engine down"));
        assert!(result.can_retry);
        assert!(result.processing_details.used_fallback_method);
        assert_eq!(h.analyzer.call_count(), 0);

        let critical = entries_with(&h, ErrorSeverity::Critical);
        assert_eq!(critical.len(), 1);
        assert!(critical[0].message.contains("Cannot process encrypted PDF"));
        assert!(critical[0].message.contains("engine down"));
        let primary = entries_with(&h, ErrorSeverity::Error);
        assert_eq!(critical[0].parent_id, Some(primary[0].id));
        assert_legal_trail(&result.attempt.stages);
    }

    #[tokio::test]
    async fn missing_ocr_engine_fails_after_primary_error() {
        let sink = Arc::new(RecordingSink::new());
        let processor =
            DocumentProcessor::new(Box::new(MockPdfBackend::failing(PdfLoadError::PasswordProtected)), &test_config())
                .with_logger(DiagnosticLogger::new().with_sink(sink.clone()));
        let result = processor
            .process_document(pdf_request("locked.pdf"), &CancelFlag::new())
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("password protected"));
        assert_eq!(
            result.error_details.as_ref().unwrap()["fallback_kind"],
            "ocr_unavailable"
        );
    }

    #[tokio::test]
    async fn ocr_timeout_fails_the_attempt() {
        let config = PipelineConfig {
            ocr_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let h = harness_with(
            MockPdfBackend::failing(PdfLoadError::Other("bad trailer".into())),
            MockOcrEngine::new("late", 0.5).with_delay(Duration::from_millis(400)),
            MockAnalyzer::new("s"),
            &config,
        );
        let result = run(&h, pdf_request("slow.pdf")).await;

        assert!(!result.success);
        assert_eq!(result.error_details.as_ref().unwrap()["fallback_kind"], "timed_out");
    }

    // -- Retry options ------------------------------------------------------

    #[tokio::test]
    async fn ignore_encryption_retry_uses_primary_parser() {
        let h = harness(MockPdfBackend::new(&["Decrypted text"]).encrypted());
        let first = run(&h, pdf_request("enc.pdf")).await;
        assert!(first.processing_details.used_fallback_method);

        let options = RetryOptions {
            ignore_encryption: true,
            ..RetryOptions::default()
        };
        let retry = run(&h, pdf_request("enc.pdf").retry(1, options)).await;
        assert_eq!(retry.outcome, Outcome::Success);
        assert_eq!(retry.text, "Decrypted text");
        assert!(!retry.processing_details.used_fallback_method);
        assert_eq!(retry.attempt.retry_count, 1);
        assert_eq!(retry.attempt.content_hash, first.attempt.content_hash);
        assert_ne!(retry.attempt.attempt_id, first.attempt.attempt_id);
    }

    #[tokio::test]
    async fn alternative_method_skips_primary_parser() {
        let h = harness(MockPdfBackend::new(&["Digital text"]));
        let options = RetryOptions {
            use_alternative_method: true,
            ..RetryOptions::default()
        };
        let result = run(&h, pdf_request("paper.pdf").retry(2, options)).await;

        assert_eq!(h.ocr.call_count(), 1);
        assert_eq!(result.text, "Recovered abstract from page one");
        assert_eq!(result.outcome, Outcome::Partial);
        assert!(result.processing_details.primary_method_error.is_none());
        assert_eq!(
            result.attempt.stages,
            vec![
                PipelineStage::Detecting,
                PipelineStage::ExtractingFallback,
                PipelineStage::Analyzing,
                PipelineStage::Finalized(Outcome::Partial),
            ]
        );
    }

    #[tokio::test]
    async fn skip_metadata_leaves_metadata_empty() {
        let h = harness(MockPdfBackend::new(&["Body"]));
        let options = RetryOptions {
            skip_metadata: true,
            ..RetryOptions::default()
        };
        let result = run(&h, pdf_request("paper.pdf").retry(1, options)).await;
        assert!(result.metadata.is_empty());

        let normal = run(&h, pdf_request("paper.pdf")).await;
        assert_eq!(normal.metadata["title"], "Mock Paper");
    }

    // -- Analysis -----------------------------------------------------------

    #[tokio::test]
    async fn analysis_failure_downgrades_to_partial() {
        let h = harness_with(
            MockPdfBackend::new(&[]),
            MockOcrEngine::new("x", 0.5),
            MockAnalyzer::failing("HTTP 503"),
            &test_config(),
        );
        let result = run(&h, request(b"Extracted body text.", "a.txt", "text/plain")).await;

        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Partial);
        assert_eq!(result.text, "Extracted body text.");
        assert!(result.summary.is_empty());
        assert!(result.error.as_deref().unwrap().contains("Content analysis is unavailable"));
        assert!(result.can_retry);

        let warnings = entries_with(&h, ErrorSeverity::Warning);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].category, ErrorCategory::ApiError);
    }

    #[tokio::test]
    async fn analysis_timeout_downgrades_to_partial() {
        let config = PipelineConfig {
            analysis_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let h = harness_with(
            MockPdfBackend::new(&[]),
            MockOcrEngine::new("x", 0.5),
            MockAnalyzer::new("late summary").with_delay(Duration::from_millis(400)),
            &config,
        );
        let result = run(&h, request(b"Body.", "a.txt", "text/plain")).await;

        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Partial);
        assert!(result.summary.is_empty());
        assert_eq!(result.text, "Body.");
    }

    #[tokio::test]
    async fn analysis_input_is_truncated() {
        let config = PipelineConfig {
            max_analysis_chars: 10,
            ..test_config()
        };
        let h = harness_with(
            MockPdfBackend::new(&[]),
            MockOcrEngine::new("x", 0.5),
            MockAnalyzer::new("s"),
            &config,
        );
        let result = run(&h, request("ü".repeat(50).as_bytes(), "a.txt", "text/plain")).await;
        assert!(result.success);
        assert_eq!(h.analyzer.last_input().unwrap().chars().count(), 10);
        assert_eq!(result.text.chars().count(), 50);
    }

    #[tokio::test]
    async fn empty_text_document_skips_analysis() {
        let h = harness(MockPdfBackend::new(&[]));
        let result = run(&h, request(b"  \n\n  ", "blank.txt", "text/plain")).await;

        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.text.is_empty());
        assert_eq!(result.processing_details.warnings, vec![EMPTY_TEXT_WARNING.to_string()]);
        assert_eq!(h.analyzer.call_count(), 0);
    }

    #[tokio::test]
    async fn no_analyzer_means_no_summary() {
        let processor = DocumentProcessor::new(Box::new(MockPdfBackend::new(&[])), &test_config());
        let result = processor
            .process_document(request(b"Text.", "a.txt", "text/plain"), &CancelFlag::new())
            .await;
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.summary.is_empty());
        assert!(!result.attempt.stages.contains(&PipelineStage::Analyzing));
    }

    // -- Cancellation ---------------------------------------------------------

    #[tokio::test]
    async fn cancelled_before_start() {
        let h = harness(MockPdfBackend::new(&["text"]));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = h.processor.process_document(pdf_request("a.pdf"), &cancel).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Processing was cancelled"));
        assert_eq!(entries_with(&h, ErrorSeverity::Warning).len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_analysis_abandons_the_call() {
        let h = harness_with(
            MockPdfBackend::new(&[]),
            MockOcrEngine::new("x", 0.5),
            MockAnalyzer::new("late").with_delay(Duration::from_millis(400)),
            &test_config(),
        );
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result = h
            .processor
            .process_document(request(b"Body.", "a.txt", "text/plain"), &cancel)
            .await;

        assert!(start.elapsed() < Duration::from_millis(350));
        assert!(!result.success);
        assert!(result.text.is_empty());
        assert_eq!(result.error_details.as_ref().unwrap()["kind"], "cancelled");
    }

    /// Cancels the shared flag while reading `cancel_on` (1-based).
    struct CancellingBackend {
        pages: usize,
        cancel_on: usize,
        cancel: CancelFlag,
        reads: Arc<AtomicUsize>,
    }

    struct CancellingPdf {
        pages: usize,
        cancel_on: usize,
        cancel: CancelFlag,
        reads: Arc<AtomicUsize>,
    }

    impl PdfBackend for CancellingBackend {
        fn load(&self, _: &[u8], _: bool) -> Result<Box<dyn LoadedPdf>, PdfLoadError> {
            Ok(Box::new(CancellingPdf {
                pages: self.pages,
                cancel_on: self.cancel_on,
                cancel: self.cancel.clone(),
                reads: Arc::clone(&self.reads),
            }))
        }
    }

    impl LoadedPdf for CancellingPdf {
        fn page_count(&self) -> usize {
            self.pages
        }

        fn metadata(&self) -> Result<PdfMetadata, ExtractionError> {
            Ok(PdfMetadata {
                version: None,
                info: BTreeMap::new(),
            })
        }

        fn page_text(&self, page_number: usize) -> Result<String, ExtractionError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if page_number == self.cancel_on {
                self.cancel.cancel();
            }
            Ok(format!("Text of page {page_number}"))
        }
    }

    #[tokio::test]
    async fn cancel_during_page_loop_stops_reading_pages() {
        let cancel = CancelFlag::new();
        let reads = Arc::new(AtomicUsize::new(0));
        let backend = CancellingBackend {
            pages: 10,
            cancel_on: 2,
            cancel: cancel.clone(),
            reads: Arc::clone(&reads),
        };
        let ocr = Arc::new(MockOcrEngine::new("unused", 0.5));
        let processor = DocumentProcessor::new(Box::new(backend), &test_config())
            .with_renderer(Arc::new(MockPdfPageRenderer::new(1)))
            .with_ocr(ocr.clone());

        let result = processor.process_document(pdf_request("long.pdf"), &cancel).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Processing was cancelled"));
        assert_eq!(result.error_details.as_ref().unwrap()["kind"], "cancelled");
        assert_eq!(ocr.call_count(), 0);
        // The blocking task may still be finishing; give it a moment, then
        // check it stopped after the cancelling page.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_legal_trail(&result.attempt.stages);
    }

    #[tokio::test]
    async fn cancel_during_ocr_abandons_the_fallback() {
        let h = harness_with(
            MockPdfBackend::failing(PdfLoadError::CorruptXref),
            MockOcrEngine::new("late", 0.5).with_delay(Duration::from_millis(400)),
            MockAnalyzer::new("unused"),
            &test_config(),
        );
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result = h.processor.process_document(pdf_request("scan.pdf"), &cancel).await;

        assert!(start.elapsed() < Duration::from_millis(350));
        assert_eq!(h.ocr.call_count(), 1);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Processing was cancelled"));
        assert_eq!(h.analyzer.call_count(), 0);

        let primary = entries_with(&h, ErrorSeverity::Error);
        let cancelled = h
            .sink
            .entries()
            .into_iter()
            .find(|e| e.message == "OCR fallback cancelled")
            .unwrap();
        assert_eq!(cancelled.parent_id, Some(primary[0].id));
        assert!(result.attempt.stages.contains(&PipelineStage::ExtractingFallback));
        assert_legal_trail(&result.attempt.stages);
    }

    // -- State machine and serialization ------------------------------------

    #[test]
    fn transition_table() {
        use PipelineStage::*;
        assert!(Detecting.can_transition_to(ExtractingPrimary));
        assert!(ExtractingPrimary.can_transition_to(ExtractingFallback));
        assert!(ExtractingFallback.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Finalized(Outcome::Partial)));
        assert!(!Detecting.can_transition_to(Analyzing));
        assert!(!Detecting.can_transition_to(Finalized(Outcome::Success)));
        assert!(!Analyzing.can_transition_to(ExtractingFallback));
        assert!(!Finalized(Outcome::Success).can_transition_to(Detecting));
    }

    #[tokio::test]
    async fn result_serializes_for_upload_layer() {
        let h = harness(MockPdfBackend::new(&["Body"]));
        let result = run(&h, pdf_request("paper.pdf")).await;
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["summary"], "A concise summary.");
        assert_eq!(json["processing_details"]["used_fallback_method"], false);
        assert_eq!(json["processing_details"]["extraction_method"], "primary");
        assert!(json.get("error").is_none());
        assert_eq!(json["attempt"]["stages"][0]["stage"], "detecting");
    }

    #[test]
    fn from_config_rejects_zero_timeouts() {
        let config = PipelineConfig {
            ocr_timeout: Duration::ZERO,
            ..test_config()
        };
        assert!(matches!(
            DocumentProcessor::from_config(&config),
            Err(ProcessingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn from_config_builds_with_models() {
        let config = PipelineConfig {
            ocr_model: Some("llava".into()),
            analysis_model: Some("llama3".into()),
            ..test_config()
        };
        let processor = DocumentProcessor::from_config(&config).unwrap();
        assert!(processor.renderer.is_some());
        assert!(processor.ocr.is_some());
        assert!(processor.analyzer.is_some());
        assert_eq!(processor.logger.sink_names(), vec!["console"]);
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::pdfium::DEFAULT_RENDER_DPI;
use super::sanitize::normalize_extracted_text;
use super::types::{ExtractionMethod, OcrEngine, OcrExtraction, OcrPageResult, PdfPageRenderer};
use super::ExtractionError;
use crate::pipeline::import::FormatKind;

/// Best-effort text recovery: rasterize the first page and OCR it.
///
/// Only the first page is recognized, keeping latency bounded. Any failure
/// here is terminal for the attempt.
pub fn extract_with_ocr(
    bytes: &[u8],
    format: FormatKind,
    renderer: &dyn PdfPageRenderer,
    ocr: &dyn OcrEngine,
) -> Result<OcrExtraction, ExtractionError> {
    if format != FormatKind::Pdf {
        return Err(ExtractionError::OcrFailed(format!(
            "no rasterizer for {} input",
            format.as_str()
        )));
    }

    let page_count = renderer.page_count(bytes)?;
    if page_count == 0 {
        return Err(ExtractionError::PdfRendering {
            page: 1,
            reason: "document has no pages".into(),
        });
    }

    let image = renderer.render_page(bytes, 0, DEFAULT_RENDER_DPI)?;
    let OcrPageResult { text, confidence } = ocr.ocr_image(&image)?;
    let text = normalize_extracted_text(&text);
    if text.is_empty() {
        return Err(ExtractionError::OcrFailed("no text recognized on first page".into()));
    }

    tracing::info!(
        page_count,
        chars = text.len(),
        confidence,
        "OCR fallback recovered first page"
    );

    Ok(OcrExtraction {
        text,
        confidence: confidence.clamp(0.0, 1.0),
        method: ExtractionMethod::Ocr,
        page_count,
    })
}

/// Mock OCR engine for testing
pub struct MockOcrEngine {
    result: Result<(String, f32), String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            result: Ok((text.to_string(), confidence)),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with `OcrFailed(reason)`.
    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Block for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match &self.result {
            Ok((text, confidence)) => Ok(OcrPageResult {
                text: text.clone(),
                confidence: *confidence,
            }),
            Err(reason) => Err(ExtractionError::OcrFailed(reason.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::pdfium::MockPdfPageRenderer;
    use super::*;

    #[test]
    fn mock_ocr_returns_configured_text() {
        let engine = MockOcrEngine::new("Recovered abstract", 0.72);
        let result = engine.ocr_image(b"fake image").unwrap();
        assert_eq!(result.text, "Recovered abstract");
        assert!((result.confidence - 0.72).abs() < f32::EPSILON);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn recovers_first_page_text() {
        let renderer = MockPdfPageRenderer::new(12);
        let engine = MockOcrEngine::new("  Scanned title page  \n\n\n Abstract ", 0.81);
        let result = extract_with_ocr(b"%PDF-1.4", FormatKind::Pdf, &renderer, &engine).unwrap();

        assert_eq!(result.text, "Scanned title page\n\nAbstract");
        assert_eq!(result.method, ExtractionMethod::Ocr);
        assert_eq!(result.page_count, 12);
        assert_eq!(renderer.render_count(), 1, "only the first page is rendered");
        assert_eq!(engine.call_count(), 1, "only the first page is recognized");
    }

    #[test]
    fn engine_failure_propagates() {
        let renderer = MockPdfPageRenderer::new(1);
        let engine = MockOcrEngine::failing("vision model unreachable");
        let err = extract_with_ocr(b"%PDF", FormatKind::Pdf, &renderer, &engine).unwrap_err();
        assert_eq!(err, ExtractionError::OcrFailed("vision model unreachable".into()));
    }

    #[test]
    fn empty_recognition_is_a_failure() {
        let renderer = MockPdfPageRenderer::new(1);
        let engine = MockOcrEngine::new("   ", 0.1);
        let err = extract_with_ocr(b"%PDF", FormatKind::Pdf, &renderer, &engine).unwrap_err();
        assert!(matches!(err, ExtractionError::OcrFailed(_)));
    }

    #[test]
    fn zero_page_document_fails() {
        let renderer = MockPdfPageRenderer::new(0);
        let engine = MockOcrEngine::new("text", 0.9);
        let err = extract_with_ocr(b"%PDF", FormatKind::Pdf, &renderer, &engine).unwrap_err();
        assert!(matches!(err, ExtractionError::PdfRendering { .. }));
        assert_eq!(engine.call_count(), 0);
    }

    #[test]
    fn non_pdf_input_is_rejected() {
        let renderer = MockPdfPageRenderer::new(1);
        let engine = MockOcrEngine::new("text", 0.9);
        let err = extract_with_ocr(b"PK", FormatKind::Docx, &renderer, &engine).unwrap_err();
        assert!(matches!(err, ExtractionError::OcrFailed(_)));
    }

    #[test]
    fn confidence_is_clamped() {
        let renderer = MockPdfPageRenderer::new(1);
        let engine = MockOcrEngine::new("text", 1.7);
        let result = extract_with_ocr(b"%PDF", FormatKind::Pdf, &renderer, &engine).unwrap();
        assert_eq!(result.confidence, 1.0);
    }
}

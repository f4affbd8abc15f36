use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use lopdf::{Document, Object};

use super::sanitize::{join_pages, normalize_extracted_text};
use super::structure_detect::detect_structures;
use super::types::{
    ExtractedContent, ExtractionMethod, LoadedPdf, PageText, PdfBackend, PdfMetadata,
    ProcessingDetails, RetryOptions,
};
use super::{ExtractionError, PdfLoadError};
use crate::pipeline::cancel::CancelFlag;
use crate::pipeline::diagnostics::sanitize_message;

/// Warning recorded when every page came back empty.
pub const NO_TEXT_WARNING: &str = "No text content extracted from PDF";

/// How far into the buffer the `%PDF-` marker may appear.
const HEADER_SCAN_BYTES: usize = 1024;

/// Primary PDF extractor: text layer, metadata and the figure/table pass.
pub struct PdfExtractor {
    backend: Box<dyn PdfBackend + Send + Sync>,
    detect_structures: bool,
}

impl PdfExtractor {
    pub fn new(backend: Box<dyn PdfBackend + Send + Sync>, detect_structures: bool) -> Self {
        Self {
            backend,
            detect_structures,
        }
    }

    /// Extract text from a PDF buffer.
    ///
    /// Load failures are terminal and classified into `PdfLoadError`.
    /// Metadata and per-page failures only add warnings. An empty document
    /// is returned as `Ok` with the no-text warning; the caller decides
    /// whether that warrants a fallback.
    pub fn extract(
        &self,
        pdf_bytes: &[u8],
        options: &RetryOptions,
        cancel: &CancelFlag,
    ) -> Result<ExtractedContent, ExtractionError> {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        if !has_pdf_header(pdf_bytes) {
            return Err(PdfLoadError::InvalidHeader.into());
        }

        let mut details = ProcessingDetails::started(ExtractionMethod::Primary);
        // Parser panics on malformed input count as load failures so the
        // OCR fallback still runs.
        let doc = catch_unwind(AssertUnwindSafe(|| {
            self.backend.load(pdf_bytes, options.ignore_encryption)
        }))
        .unwrap_or_else(|payload| {
            let reason = panic_reason(payload.as_ref());
            tracing::warn!(reason = %reason, "PDF parser panicked while loading");
            Err(PdfLoadError::Other(format!("parser panicked: {reason}")))
        })?;
        let page_count = doc.page_count();
        details.page_count = Some(page_count);

        let mut metadata = BTreeMap::new();
        if !options.skip_metadata {
            match doc.metadata() {
                Ok(meta) => {
                    if let Some(version) = meta.version {
                        details.pdf_version = Some(version.clone());
                        metadata.insert("pdf_version".to_string(), version);
                    }
                    metadata.extend(meta.info);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PDF metadata unreadable, continuing");
                    details.warnings.push(sanitize_message(&e.to_string()));
                }
            }
        }

        let mut pages = Vec::with_capacity(page_count);
        for page_number in 1..=page_count {
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }
            let text = catch_unwind(AssertUnwindSafe(|| doc.page_text(page_number)))
                .unwrap_or_else(|payload| {
                    Err(ExtractionError::PageExtraction {
                        page: page_number,
                        reason: format!("parser panicked: {}", panic_reason(payload.as_ref())),
                    })
                });
            match text {
                Ok(raw) => pages.push(PageText {
                    page_number,
                    text: normalize_extracted_text(&raw),
                }),
                Err(e) => {
                    tracing::warn!(page = page_number, error = %e, "Page text extraction failed, skipping page");
                    details.warnings.push(sanitize_message(&e.to_string()));
                }
            }
        }

        let text = join_pages(pages.iter().map(|p| p.text.as_str()));
        if text.is_empty() {
            details.warnings.push(NO_TEXT_WARNING.to_string());
        }

        let (figures, tables) = if self.detect_structures && !text.is_empty() {
            detect_structures(&pages)
        } else {
            (Vec::new(), Vec::new())
        };

        tracing::debug!(
            pages = page_count,
            chars = text.len(),
            warnings = details.warnings.len(),
            figures = figures.len(),
            tables = tables.len(),
            "Primary PDF extraction finished"
        );

        details.finish();
        Ok(ExtractedContent {
            text,
            metadata,
            figures,
            tables,
            details,
        })
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// The `%PDF-` marker must appear near the start of the buffer.
pub fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(HEADER_SCAN_BYTES)];
    window.windows(5).any(|w| w == b"%PDF-")
}

// ──────────────────────────────────────────────
// lopdf backend
// ──────────────────────────────────────────────

/// Production backend over lopdf.
pub struct LopdfBackend;

impl PdfBackend for LopdfBackend {
    fn load(
        &self,
        pdf_bytes: &[u8],
        ignore_encryption: bool,
    ) -> Result<Box<dyn LoadedPdf>, PdfLoadError> {
        let doc = Document::load_mem(pdf_bytes).map_err(|e| PdfLoadError::classify(&e.to_string()))?;

        if doc.is_encrypted() && !ignore_encryption {
            return Err(PdfLoadError::Encrypted);
        }

        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        Ok(Box::new(LopdfDocument { doc, pages }))
    }
}

struct LopdfDocument {
    doc: Document,
    pages: Vec<u32>,
}

impl LoadedPdf for LopdfDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn metadata(&self) -> Result<PdfMetadata, ExtractionError> {
        let mut meta = PdfMetadata {
            version: Some(self.doc.version.clone()),
            info: BTreeMap::new(),
        };

        let Ok(info) = self.doc.trailer.get(b"Info") else {
            return Ok(meta);
        };
        let dict = match info {
            Object::Reference(id) => self
                .doc
                .get_dictionary(*id)
                .map_err(|e| ExtractionError::Metadata(e.to_string()))?,
            Object::Dictionary(dict) => dict,
            _ => {
                return Err(ExtractionError::Metadata(
                    "Info entry is not a dictionary".into(),
                ))
            }
        };

        for (key, value) in dict.iter() {
            if let Object::String(bytes, _) = value {
                let text = decode_pdf_string(bytes);
                if !text.is_empty() {
                    meta.info
                        .insert(String::from_utf8_lossy(key).to_lowercase(), text);
                }
            }
        }
        Ok(meta)
    }

    fn page_text(&self, page_number: usize) -> Result<String, ExtractionError> {
        let page = self
            .pages
            .get(page_number.wrapping_sub(1))
            .copied()
            .ok_or_else(|| ExtractionError::PageExtraction {
                page: page_number,
                reason: "page out of range".into(),
            })?;
        self.doc
            .extract_text(&[page])
            .map_err(|e| ExtractionError::PageExtraction {
                page: page_number,
                reason: e.to_string(),
            })
    }
}

/// Decode a PDF text string: UTF-16BE with BOM, else PDFDocEncoding
/// approximated as Latin-1.
fn decode_pdf_string(bytes: &[u8]) -> String {
    let decoded = if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    };
    decoded.trim_matches(char::from(0)).trim().to_string()
}

// ──────────────────────────────────────────────
// Mock backend (for testing)
// ──────────────────────────────────────────────

/// Scripted PDF backend. `None` pages fail extraction.
pub struct MockPdfBackend {
    pages: Vec<Option<String>>,
    load_error: Option<PdfLoadError>,
    encrypted: bool,
    metadata_fails: bool,
    panic_on_load: bool,
    panic_page: Option<usize>,
    loads: AtomicUsize,
}

impl MockPdfBackend {
    pub fn new(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| Some(p.to_string())).collect(),
            load_error: None,
            encrypted: false,
            metadata_fails: false,
            panic_on_load: false,
            panic_page: None,
            loads: AtomicUsize::new(0),
        }
    }

    /// Every load fails with `error`.
    pub fn failing(error: PdfLoadError) -> Self {
        Self {
            load_error: Some(error),
            ..Self::new(&[])
        }
    }

    /// Mark a page (1-based) as malformed.
    pub fn with_broken_page(mut self, page_number: usize) -> Self {
        if let Some(slot) = self.pages.get_mut(page_number.wrapping_sub(1)) {
            *slot = None;
        }
        self
    }

    /// Carries an encryption dictionary: loads only with `ignore_encryption`.
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn with_failing_metadata(mut self) -> Self {
        self.metadata_fails = true;
        self
    }

    /// Every load panics, like a parser tripping over malformed input.
    pub fn panicking_on_load(mut self) -> Self {
        self.panic_on_load = true;
        self
    }

    /// Reading this page (1-based) panics.
    pub fn with_panicking_page(mut self, page_number: usize) -> Self {
        self.panic_page = Some(page_number);
        self
    }

    /// Number of `load` calls made so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl PdfBackend for MockPdfBackend {
    fn load(
        &self,
        _pdf_bytes: &[u8],
        ignore_encryption: bool,
    ) -> Result<Box<dyn LoadedPdf>, PdfLoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_load {
            panic!("malformed object stream");
        }
        if let Some(e) = &self.load_error {
            return Err(e.clone());
        }
        if self.encrypted && !ignore_encryption {
            return Err(PdfLoadError::Encrypted);
        }
        Ok(Box::new(MockLoadedPdf {
            pages: self.pages.clone(),
            metadata_fails: self.metadata_fails,
            panic_page: self.panic_page,
        }))
    }
}

struct MockLoadedPdf {
    pages: Vec<Option<String>>,
    metadata_fails: bool,
    panic_page: Option<usize>,
}

impl LoadedPdf for MockLoadedPdf {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn metadata(&self) -> Result<PdfMetadata, ExtractionError> {
        if self.metadata_fails {
            return Err(ExtractionError::Metadata("Info dictionary is corrupt".into()));
        }
        let mut info = BTreeMap::new();
        info.insert("title".to_string(), "Mock Paper".to_string());
        Ok(PdfMetadata {
            version: Some("1.7".into()),
            info,
        })
    }

    fn page_text(&self, page_number: usize) -> Result<String, ExtractionError> {
        if self.panic_page == Some(page_number) {
            panic!("index out of bounds in content stream");
        }
        match self.pages.get(page_number.wrapping_sub(1)) {
            Some(Some(text)) => Ok(text.clone()),
            _ => Err(ExtractionError::PageExtraction {
                page: page_number,
                reason: "malformed content stream".into(),
            }),
        }
    }
}

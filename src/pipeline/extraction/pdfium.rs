//! Page rasterization via Google PDFium for the OCR fallback.
//!
//! PDFium opens files lopdf rejects (broken xref tables, empty-password
//! encryption) and draws the full page rather than only its embedded
//! images, so it is the preferred renderer when the library is present.
//! A fresh `Pdfium` binding is created per call because the upstream type
//! is `!Send`; `PdfiumRenderer` itself holds no state.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::ImageOutputFormat;
use pdfium_render::prelude::*;

use super::types::PdfPageRenderer;
use super::{ExtractionError, PdfLoadError};

/// Rendering DPI for OCR input.
pub const DEFAULT_RENDER_DPI: u32 = 200;

/// Longest rendered edge in pixels. Vision models downscale anyway.
const MAX_EDGE_PX: u32 = 4096;

const POINTS_PER_INCH: f32 = 72.0;

/// Explicit library location, checked before the executable directory and
/// the system search path.
const LIBRARY_PATH_ENV: &str = "PDFIUM_DYNAMIC_LIB_PATH";

pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Fails when no PDFium library can be bound, so the composition root
    /// can choose another renderer once instead of failing every attempt.
    pub fn new() -> Result<Self, ExtractionError> {
        bind_pdfium()?;
        Ok(Self)
    }
}

fn bind_pdfium() -> Result<Pdfium, ExtractionError> {
    let unavailable = |reason: String| ExtractionError::PdfRendering { page: 0, reason };

    if let Ok(path) = std::env::var(LIBRARY_PATH_ENV) {
        return Pdfium::bind_to_library(&path)
            .map(Pdfium::new)
            .map_err(|e| unavailable(format!("cannot load PDFium from {LIBRARY_PATH_ENV}: {e}")));
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.to_path_buf()));
    if let Some(dir) = beside_exe {
        let lib = Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
        if let Ok(bindings) = Pdfium::bind_to_library(&lib) {
            tracing::debug!(dir = %dir.display(), "PDFium bound next to executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| unavailable(format!("PDFium library not found: {e}")))
}

/// Open the document and hand it to `f`. Open failures reuse the primary
/// parser's load taxonomy so the CRITICAL log entry reads consistently.
fn with_document<T>(
    pdf_bytes: &[u8],
    f: impl FnOnce(&PdfDocument<'_>) -> Result<T, ExtractionError>,
) -> Result<T, ExtractionError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| match PdfLoadError::classify(&e.to_string()) {
            PdfLoadError::Other(reason) => ExtractionError::PdfRendering { page: 0, reason },
            kind => ExtractionError::PdfLoad(kind),
        })?;
    f(&document)
}

/// Pixel size of a page at `dpi`, each edge at least 1px and the longest
/// edge capped at `MAX_EDGE_PX` with the aspect ratio kept.
fn target_size(width_pt: f32, height_pt: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let (w, h) = ((width_pt * scale).max(1.0), (height_pt * scale).max(1.0));
    let shrink = (MAX_EDGE_PX as f32 / w.max(h)).min(1.0);
    let fit = |edge: f32| ((edge * shrink).round() as u32).clamp(1, MAX_EDGE_PX);
    (fit(w), fit(h))
}

impl PdfPageRenderer for PdfiumRenderer {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        with_document(pdf_bytes, |doc| Ok(doc.pages().len() as usize))
    }

    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError> {
        let page_number = page_index + 1;
        let render_error = |reason: String| ExtractionError::PdfRendering {
            page: page_number,
            reason,
        };

        with_document(pdf_bytes, |doc| {
            let pages = doc.pages();
            let page = u16::try_from(page_index)
                .ok()
                .and_then(|i| pages.get(i).ok())
                .ok_or_else(|| render_error(format!("document has {} pages", pages.len())))?;

            let (width, height) = target_size(page.width().value, page.height().value, dpi);
            let config = PdfRenderConfig::new()
                .set_target_width(width as i32)
                .set_maximum_height(height as i32);
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| render_error(e.to_string()))?;

            let mut png = Cursor::new(Vec::new());
            bitmap
                .as_image()
                .write_to(&mut png, ImageOutputFormat::Png)
                .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;

            tracing::debug!(page = page_number, width, height, "Rendered page for OCR");
            Ok(png.into_inner())
        })
    }
}

// ──────────────────────────────────────────────
// Mock renderer
// ──────────────────────────────────────────────

/// Returns a 1x1 PNG for every in-range page and counts renders.
pub struct MockPdfPageRenderer {
    page_count: usize,
    renders: AtomicUsize,
}

impl MockPdfPageRenderer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            renders: AtomicUsize::new(0),
        }
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl PdfPageRenderer for MockPdfPageRenderer {
    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        Ok(self.page_count)
    }

    fn render_page(
        &self,
        _pdf_bytes: &[u8],
        page_index: usize,
        _dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError> {
        if page_index >= self.page_count {
            return Err(ExtractionError::PdfRendering {
                page: page_index + 1,
                reason: format!("document has {} pages", self.page_count),
            });
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(ONE_PIXEL_PNG.to_vec())
    }
}

const ONE_PIXEL_PNG: [u8; 69] = [
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, // signature
    0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, // IHDR
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, // 1x1
    0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, // 8-bit RGB
    0xDE, //
    0x00, 0x00, 0x00, 0x0C, 0x49, 0x44, 0x41, 0x54, // IDAT
    0x08, 0xD7, 0x63, 0xF8, 0xCF, 0xC0, 0x00, 0x00, //
    0x00, 0x02, 0x00, 0x01, 0xE2, 0x21, 0xBC, 0x33, //
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, // IEND
    0xAE, 0x42, 0x60, 0x82,
];

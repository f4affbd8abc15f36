//! Page-image extraction with lopdf, used when PDFium is not installed.
//!
//! Scanned papers carry each page as a single image XObject; the largest
//! image on the page is re-encoded to PNG for OCR. Pages made only of
//! vector text cannot be rendered this way.

use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use super::types::PdfPageRenderer;
use super::{ExtractionError, PdfLoadError};

pub struct LopdfImageExtractor;

fn load(pdf_bytes: &[u8]) -> Result<Document, ExtractionError> {
    Document::load_mem(pdf_bytes)
        .map_err(|e| ExtractionError::PdfLoad(PdfLoadError::classify(&e.to_string())))
}

impl PdfPageRenderer for LopdfImageExtractor {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        Ok(load(pdf_bytes)?.get_pages().len())
    }

    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        _dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError> {
        let page_number = page_index + 1;
        let doc = load(pdf_bytes)?;

        let page_ids: Vec<ObjectId> = doc.get_pages().values().copied().collect();
        let &page_id = page_ids.get(page_index).ok_or_else(|| ExtractionError::PdfRendering {
            page: page_number,
            reason: format!("Page not found (PDF has {} pages)", page_ids.len()),
        })?;

        let image_bytes = largest_page_image(&doc, page_id, page_number)?;
        let img = image::load_from_memory(&image_bytes).map_err(|e| {
            ExtractionError::ImageProcessing(format!("Failed to decode page image: {e}"))
        })?;
        let png = encode_png(&img)?;

        tracing::debug!(
            page = page_number,
            raw_size = image_bytes.len(),
            png_size = png.len(),
            "Extracted page image for OCR"
        );
        Ok(png)
    }
}

/// Page dict → /Resources → /XObject → largest /Subtype /Image stream.
fn largest_page_image(
    doc: &Document,
    page_id: ObjectId,
    page_number: usize,
) -> Result<Vec<u8>, ExtractionError> {
    let missing = |what: &str| ExtractionError::PdfRendering {
        page: page_number,
        reason: format!("Page has no {what}"),
    };

    let page = doc
        .get_dictionary(page_id)
        .map_err(|_| missing("page dictionary"))?;
    let resources = resolve_dict(doc, page, b"Resources").ok_or_else(|| missing("resources"))?;
    let xobjects = resolve_dict(doc, resources, b"XObject").ok_or_else(|| missing("image XObjects"))?;

    let mut largest: Option<Vec<u8>> = None;
    for (_name, entry) in xobjects.iter() {
        let Object::Stream(stream) = resolve(doc, entry) else {
            continue;
        };
        if !is_image(&stream.dict) {
            continue;
        }
        let bytes = image_bytes(stream)?;
        if largest.as_ref().map_or(true, |prev| bytes.len() > prev.len()) {
            largest = Some(bytes);
        }
    }

    largest.ok_or_else(|| missing("image XObjects"))
}

fn is_image(dict: &Dictionary) -> bool {
    matches!(dict.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Image")
}

/// JPEG (DCTDecode) streams are complete image files; anything else is
/// decompressed and, if not a self-describing image, rebuilt from raw pixels.
fn image_bytes(stream: &Stream) -> Result<Vec<u8>, ExtractionError> {
    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());

    let is_dct = match stream.dict.get(b"Filter") {
        Ok(Object::Name(n)) => n == b"DCTDecode",
        Ok(Object::Array(filters)) => filters
            .iter()
            .any(|f| matches!(f, Object::Name(n) if n == b"DCTDecode")),
        _ => false,
    };
    if is_dct || image::load_from_memory(&content).is_ok() {
        return Ok(content);
    }

    raw_pixels_to_png(&stream.dict, content)
}

fn raw_pixels_to_png(dict: &Dictionary, pixels: Vec<u8>) -> Result<Vec<u8>, ExtractionError> {
    let width = int_entry(dict, b"Width")? as u32;
    let height = int_entry(dict, b"Height")? as u32;
    let gray = matches!(dict.get(b"ColorSpace"), Ok(Object::Name(n)) if n == b"DeviceGray");

    let img = if gray {
        image::GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8)
    } else {
        image::RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8)
    }
    .ok_or_else(|| {
        ExtractionError::ImageProcessing(format!(
            "Raw pixel buffer does not match {width}x{height} image"
        ))
    })?;

    encode_png(&img)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ExtractionError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

fn resolve_dict<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    dict.get(key).ok().and_then(|obj| resolve(doc, obj).as_dict().ok())
}

fn int_entry(dict: &Dictionary, key: &[u8]) -> Result<i64, ExtractionError> {
    dict.get(key).and_then(Object::as_i64).map_err(|_| {
        ExtractionError::ImageProcessing(format!(
            "Missing integer /{} in image dictionary",
            String::from_utf8_lossy(key)
        ))
    })
}

//! Plain-text extraction: decode, normalize, done.

use std::collections::BTreeMap;

use super::sanitize::normalize_extracted_text;
use super::types::{ExtractedContent, ExtractionMethod, ProcessingDetails};
use super::ExtractionError;

/// Warning recorded when invalid UTF-8 had to be replaced.
pub const LOSSY_DECODE_WARNING: &str = "Text contained invalid UTF-8 sequences that were replaced";

/// Decode a `.txt` upload.
///
/// UTF-8 (with or without BOM) and BOM-marked UTF-16 are decoded exactly.
/// Other invalid UTF-8 is decoded lossily with a warning; only a byte stream
/// that is plainly binary (embedded NUL bytes) is rejected.
pub fn extract_plain_text(bytes: &[u8]) -> Result<ExtractedContent, ExtractionError> {
    let mut details = ProcessingDetails::started(ExtractionMethod::PlainText);
    let (raw, encoding) = decode_text(bytes, &mut details.warnings)?;

    let mut metadata = BTreeMap::new();
    metadata.insert("encoding".to_string(), encoding.to_string());
    metadata.insert("line_count".to_string(), raw.lines().count().to_string());

    let text = normalize_extracted_text(&raw);
    tracing::debug!(encoding, chars = text.len(), "Plain text decoded");
    Ok(ExtractedContent::text_only(text, metadata, details))
}

pub(crate) fn decode_text(
    bytes: &[u8],
    warnings: &mut Vec<String>,
) -> Result<(String, &'static str), ExtractionError> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(rest.to_vec())
            .map(|s| (s, "utf-8"))
            .map_err(|e| ExtractionError::PlainTextRead(e.to_string()));
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes).map(|s| (s, "utf-16le"));
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes).map(|s| (s, "utf-16be"));
    }

    match std::str::from_utf8(bytes) {
        Ok(s) if !s.contains('\0') => Ok((s.to_string(), "utf-8")),
        Ok(_) => Err(ExtractionError::PlainTextRead("binary content (NUL bytes)".into())),
        Err(_) if bytes.contains(&0) => {
            Err(ExtractionError::PlainTextRead("binary content (NUL bytes)".into()))
        }
        Err(_) => {
            warnings.push(LOSSY_DECODE_WARNING.to_string());
            Ok((String::from_utf8_lossy(bytes).into_owned(), "utf-8-lossy"))
        }
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> Result<String, ExtractionError> {
    if bytes.len() % 2 != 0 {
        return Err(ExtractionError::PlainTextRead("truncated UTF-16 stream".into()));
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| to_unit([c[0], c[1]])).collect();
    String::from_utf16(&units).map_err(|e| ExtractionError::PlainTextRead(e.to_string()))
}

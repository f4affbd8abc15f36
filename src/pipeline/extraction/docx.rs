//! DOCX (OOXML) raw text extraction.
//!
//! Reads `word/document.xml` from the archive and keeps run text in
//! document order: `w:t` text, `w:tab` as a tab, `w:br`/`w:cr` as line
//! breaks and one newline per paragraph. Core properties
//! (`docProps/core.xml`) fill the metadata map when present.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use super::sanitize::normalize_extracted_text;
use super::types::{ExtractedContent, ExtractionMethod, ProcessingDetails};
use super::ExtractionError;

const DOCUMENT_XML: &str = "word/document.xml";
const CORE_PROPS_XML: &str = "docProps/core.xml";

/// Upper bound on decompressed XML read from one archive entry.
const MAX_XML_BYTES: u64 = 200 * 1024 * 1024;

pub fn extract_docx(bytes: &[u8]) -> Result<ExtractedContent, ExtractionError> {
    let details = ProcessingDetails::started(ExtractionMethod::DocxRawText);

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractionError::DocxExtraction(format!("not a valid DOCX archive: {e}")))?;

    let document_xml = read_entry(&mut archive, DOCUMENT_XML)?.ok_or_else(|| {
        ExtractionError::DocxExtraction(format!("archive has no {DOCUMENT_XML}"))
    })?;
    let text = normalize_extracted_text(&document_text(&document_xml)?);

    // Core properties are optional; unreadable ones are skipped.
    let metadata = match read_entry(&mut archive, CORE_PROPS_XML) {
        Ok(Some(xml)) => core_properties(&xml),
        Ok(None) => BTreeMap::new(),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unreadable DOCX core properties");
            BTreeMap::new()
        }
    };

    tracing::debug!(chars = text.len(), metadata = metadata.len(), "DOCX text extracted");
    Ok(ExtractedContent::text_only(text, metadata, details))
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ExtractionError> {
    let file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(ExtractionError::DocxExtraction(format!("cannot open {name}: {e}")))
        }
    };

    let mut content = String::new();
    let read = file
        .take(MAX_XML_BYTES + 1)
        .read_to_string(&mut content)
        .map_err(|e| ExtractionError::DocxExtraction(format!("cannot read {name}: {e}")))?;
    if read as u64 > MAX_XML_BYTES {
        return Err(ExtractionError::DocxExtraction(format!(
            "{name} exceeds the decompressed size limit"
        )));
    }
    Ok(Some(content))
}

fn document_text(xml: &str) -> Result<String, ExtractionError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"w:t" => in_text = true,
                b"w:tab" => out.push('\t'),
                b"w:br" | b"w:cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"w:tab" => out.push('\t'),
                b"w:br" | b"w:cr" => out.push('\n'),
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => {
                let text = e
                    .unescape()
                    .map_err(|err| ExtractionError::DocxExtraction(format!("bad text run: {err}")))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ExtractionError::DocxExtraction(format!(
                    "XML parsing error at position {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Dublin Core fields from `docProps/core.xml`.
fn core_properties(xml: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut current: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current = match e.name().as_ref() {
                    b"dc:title" => Some("title"),
                    b"dc:creator" => Some("author"),
                    b"dc:subject" => Some("subject"),
                    b"dc:description" => Some("description"),
                    b"cp:keywords" => Some("keywords"),
                    b"dcterms:created" => Some("created"),
                    b"dcterms:modified" => Some("modified"),
                    _ => None,
                };
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Text(e)) => {
                if let (Some(key), Ok(text)) = (current, e.unescape()) {
                    let value = text.trim();
                    if !value.is_empty() {
                        metadata.insert(key.to_string(), value.to_string());
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    metadata
}

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ImportError, SourceDocument};
use crate::config::SizeLimits;

/// Document formats the pipeline can extract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Pdf,
    Docx,
    Latex,
    PlainText,
}

impl FormatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Latex => "latex",
            Self::PlainText => "plain_text",
        }
    }

    /// Match a lowercase extension against the allow-list.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "tex" => Some(Self::Latex),
            "txt" => Some(Self::PlainText),
            _ => None,
        }
    }

    /// MIME types an upload of this format may legitimately declare.
    pub fn expected_mime_types(&self) -> &'static [&'static str] {
        match self {
            Self::Pdf => &["application/pdf"],
            Self::Docx => &[
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "application/vnd.ms-word.document.macroEnabled.12",
            ],
            Self::Latex => &["application/x-tex", "text/x-tex"],
            Self::PlainText => &["text/plain"],
        }
    }
}

/// Route an upload to its extractor by filename extension (case-insensitive).
///
/// Content is not sniffed: a `.pdf` that is not a PDF fails later in the
/// PDF extractor with a header error, which keeps the OCR fallback reachable.
/// The declared MIME type is not consulted for routing.
pub fn detect_format(filename: &str, _declared_mime: &str) -> Result<FormatKind, ImportError> {
    let ext = extension_of(filename);
    ext.as_deref()
        .and_then(FormatKind::from_extension)
        .ok_or_else(|| ImportError::UnsupportedFormat(ext.unwrap_or_else(|| "none".into())))
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename.trim())
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Validate a routed upload before extraction.
///
/// Size limits and empty input are terminal. A declared MIME type that does
/// not fit the extension only produces a warning: browsers and upload
/// clients frequently send generic or wrong types.
pub fn validate_source(
    source: &SourceDocument,
    kind: FormatKind,
    limits: &SizeLimits,
) -> Result<Vec<String>, ImportError> {
    let size = source.declared_size.max(source.bytes.len() as u64);
    if size == 0 {
        return Err(ImportError::EmptyFile);
    }

    let limit = limits.for_format(kind);
    if size > limit {
        return Err(ImportError::FileTooLarge {
            size_bytes: size,
            max_mb: limit / (1024 * 1024),
        });
    }

    let mut warnings = Vec::new();
    let declared = source.declared_mime.trim().to_ascii_lowercase();
    let generic = declared.is_empty() || declared == "application/octet-stream";
    if !generic && !kind.expected_mime_types().contains(&declared.as_str()) {
        warnings.push(format!(
            "Declared content type {declared} does not match .{} upload",
            extension_of(&source.filename).unwrap_or_default()
        ));
    }

    Ok(warnings)
}

/// Best MIME type for diagnostics: the declared one, else a guess from the name.
pub fn effective_mime(filename: &str, declared_mime: &str) -> String {
    if !declared_mime.trim().is_empty() {
        return declared_mime.trim().to_string();
    }
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

/// Strip path components and control characters; cap the length.
pub fn sanitize_filename(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0') && !c.is_control())
        .take(255)
        .collect();

    if clean.is_empty() {
        "document".to_string()
    } else {
        clean
    }
}

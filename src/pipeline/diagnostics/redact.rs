//! Redaction of failure messages before they reach a user-facing surface.

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::extraction::PdfLoadError;

pub const PATH_PLACEHOLDER: &str = "[PATH]";
pub const IP_PLACEHOLDER: &str = "[IP]";
pub const EMAIL_PLACEHOLDER: &str = "[EMAIL]";
pub const SECRET_PLACEHOLDER: &str = "[REDACTED]";

static SECRET_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|passwd|secret|api[_-]?key|key|token)=(?:"[^"]*"|'[^']*'|[^\s&])[^\s&]*"#)
        .expect("valid regex")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid regex")
});

static IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid regex"));

// A Unix path starts at the beginning of the message or after a delimiter,
// and its first segment must be a word character (so `//` in URLs and the
// placeholders themselves never match).
static UNIX_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s"'(=:,])/[\w.-]+(?:/[\w.-]*)*"#).expect("valid regex")
});

static WINDOWS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]:\\[\w\\.-]*").expect("valid regex"));

/// Replace paths, IP addresses, email addresses and `key=`/`token=`/
/// `password=` values with fixed placeholders.
///
/// Idempotent: no placeholder matches any of the patterns again.
pub fn sanitize_message(message: &str) -> String {
    let text = SECRET_ASSIGNMENT.replace_all(message, format!("${{1}}={SECRET_PLACEHOLDER}"));
    let text = EMAIL.replace_all(&text, EMAIL_PLACEHOLDER);
    let text = IPV4.replace_all(&text, IP_PLACEHOLDER);
    let text = WINDOWS_PATH.replace_all(&text, PATH_PLACEHOLDER);
    let text = UNIX_PATH.replace_all(&text, format!("${{1}}{PATH_PLACEHOLDER}"));
    text.into_owned()
}

/// Map a raw failure string to a short user-facing phrase.
///
/// PDF failures get fixed wording per failure class; everything else is
/// passed through `sanitize_message`.
pub fn format_user_error_message(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if !lower.contains("pdf") {
        return sanitize_message(raw);
    }

    if lower.contains("header") {
        PdfLoadError::InvalidHeader.user_message().to_string()
    } else if lower.contains("eof") {
        "The PDF file is incomplete or corrupted (missing EOF marker)".to_string()
    } else if lower.contains("password") {
        PdfLoadError::PasswordProtected.user_message().to_string()
    } else if lower.contains("encrypt") {
        PdfLoadError::Encrypted.user_message().to_string()
    } else if lower.contains("xref") || lower.contains("cross-reference") {
        PdfLoadError::CorruptXref.user_message().to_string()
    } else if lower.contains("font") {
        "There was an issue with fonts in the PDF".to_string()
    } else {
        format!("PDF processing error: {}", sanitize_message(raw))
    }
}

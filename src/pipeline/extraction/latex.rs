//! Heuristic LaTeX-to-text stripping.
//!
//! A fixed sequence of pattern removals, not a TeX parser: nested groups,
//! custom macros and unusual environments can leak fragments into the
//! output. The contract is text in, best-effort prose out.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::sanitize::normalize_extracted_text;
use super::text_only::decode_text;
use super::types::{ExtractedContent, ExtractionMethod, ProcessingDetails};
use super::ExtractionError;

// Private-use placeholders for escaped characters that the rules would
// otherwise treat as syntax.
const ESC_PERCENT: &str = "\u{E000}";
const ESC_DOLLAR: &str = "\u{E001}";
const ESC_LBRACE: &str = "\u{E002}";
const ESC_RBRACE: &str = "\u{E003}";

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

/// Ordered (pattern, replacement) rules. Order matters: escapes before
/// comments, math before commands, commands before bare braces.
static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // Forced line breaks
        (re(r"\\\\(?:\[[^\]]*\])?"), "\n"),
        // Escaped specials
        (re(r"\\%"), ESC_PERCENT),
        (re(r"\\\$"), ESC_DOLLAR),
        (re(r"\\\{"), ESC_LBRACE),
        (re(r"\\\}"), ESC_RBRACE),
        (re(r"\\&"), "&"),
        (re(r"\\_"), "_"),
        (re(r"\\#"), "#"),
        // Comments
        (re(r"(?m)%.*$"), ""),
        // Preamble declarations
        (re(r"\\documentclass(?:\[[^\]]*\])?\{[^}]*\}"), ""),
        (re(r"\\usepackage(?:\[[^\]]*\])?\{[^}]*\}"), ""),
        (re(r"\\(?:begin|end)\{document\}"), ""),
        // Display math
        (re(r"(?s)\\\[.*?\\\]"), " "),
        (re(r"(?s)\$\$.*?\$\$"), " "),
        (
            re(r"(?s)\\begin\{(?:equation|align|gather|multline|eqnarray|displaymath|math)\*?\}.*?\\end\{(?:equation|align|gather|multline|eqnarray|displaymath|math)\*?\}"),
            " ",
        ),
        // Inline math
        (re(r"(?s)\\\(.*?\\\)"), ""),
        (re(r"\$[^$]*\$"), ""),
        // Headings keep their text on a line of their own
        (
            re(r"\\(?:chapter|section|subsection|subsubsection|paragraph|title)\*?(?:\[[^\]]*\])?\{([^{}]*)\}"),
            "\n\n${1}\n\n",
        ),
        // Commands whose arguments are not prose
        (
            re(r"\\(?:label|ref|eqref|autoref|cref|pageref|cite[a-zA-Z]*|nocite|includegraphics|bibliographystyle|bibliography|input|include|begin|end|vspace|hspace|url|setlength|author|date|thanks|footnote)\*?(?:\[[^\]]*\])*(?:\{[^{}]*\})+"),
            "",
        ),
        // Remaining command tokens and control symbols
        (re(r"\\[a-zA-Z@]+\*?(?:\[[^\]]*\])?"), ""),
        (re(r"\\[^a-zA-Z\s]"), ""),
        // Bare braces: keep the enclosed text
        (re(r"[{}]"), ""),
        (re(r"~"), " "),
        (re(r"&"), " and "),
        (re(r"[ \t]{2,}"), " "),
    ]
});

static TITLE: LazyLock<Regex> = LazyLock::new(|| re(r"\\title\*?(?:\[[^\]]*\])?\{([^{}]*)\}"));
static AUTHOR: LazyLock<Regex> = LazyLock::new(|| re(r"\\author\*?(?:\[[^\]]*\])?\{([^{}]*)\}"));
static DOCUMENT_CLASS: LazyLock<Regex> =
    LazyLock::new(|| re(r"\\documentclass(?:\[[^\]]*\])?\{([^}]*)\}"));
static AND_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| re(r"\s*\\and\s*"));

/// Extract prose and basic metadata (title, author, document class) from
/// LaTeX source bytes.
pub fn extract_latex(bytes: &[u8]) -> Result<ExtractedContent, ExtractionError> {
    let mut details = ProcessingDetails::started(ExtractionMethod::LatexStrip);
    let (source, _encoding) = decode_text(bytes, &mut details.warnings).map_err(|e| match e {
        ExtractionError::PlainTextRead(reason) => ExtractionError::LatexExtraction(reason),
        other => other,
    })?;

    let metadata = latex_metadata(&source);
    let text = strip_latex(&source);

    tracing::debug!(chars = text.len(), metadata = metadata.len(), "LaTeX source stripped");
    Ok(ExtractedContent::text_only(text, metadata, details))
}

/// Strip LaTeX markup from source text.
pub fn strip_latex(source: &str) -> String {
    let mut text = source.replace("\r\n", "\n");
    for (pattern, replacement) in RULES.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    let restored = text
        .replace(ESC_PERCENT, "%")
        .replace(ESC_DOLLAR, "$")
        .replace(ESC_LBRACE, "{")
        .replace(ESC_RBRACE, "}");
    normalize_extracted_text(&restored)
}

fn latex_metadata(source: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if let Some(caps) = DOCUMENT_CLASS.captures(source) {
        metadata.insert("document_class".to_string(), caps[1].trim().to_string());
    }
    if let Some(caps) = TITLE.captures(source) {
        let title = strip_latex(&caps[1]).replace('\n', " ");
        if !title.is_empty() {
            metadata.insert("title".to_string(), title);
        }
    }
    if let Some(caps) = AUTHOR.captures(source) {
        let joined = AND_SEPARATOR.replace_all(&caps[1], ", ");
        let author = strip_latex(&joined).replace('\n', " ");
        if !author.is_empty() {
            metadata.insert("author".to_string(), author);
        }
    }
    metadata
}

/// Normalize extracted text before passing downstream.
///
/// Strips control characters (tabs and newlines survive), unifies line
/// endings, trims every line and collapses runs of blank lines into a single
/// paragraph break. Punctuation, math symbols and non-Latin scripts are kept
/// untouched.
pub fn normalize_extracted_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");

    let cleaned: String = unified
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}'))
        .collect();

    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = false;
    for line in cleaned.lines().map(str::trim) {
        if line.is_empty() {
            blank_run = !out.is_empty();
            continue;
        }
        if blank_run {
            out.push("");
            blank_run = false;
        }
        out.push(line);
    }
    out.join("\n")
}

/// Join page texts with paragraph separation, skipping empty pages.
pub fn join_pages<'a, I>(pages: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    pages
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::types::{Figure, PageText, Table};

/// Caption line: "Figure 3: ...", "Fig. 2. ...", "FIGURE 4 - ...".
static FIGURE_CAPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:figure|fig\.?)\s*(\d+[a-z]?)\s*(?:[:.|\-]\s*(.*))?$")
        .expect("valid regex")
});

/// Caption line: "Table 1: ...", "TABLE II. ...".
static TABLE_CAPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*table\s+(\d+[a-z]?|[ivxlc]+)\s*(?:[:.|\-]\s*(.*))?$")
        .expect("valid regex")
});

static FIGURE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:figure|fig\.)").expect("valid regex"));

static TABLE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btable\b").expect("valid regex"));

/// Maximum characters kept from a caption line.
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Minimum tabular-looking lines for a page to count as holding a table.
const MIN_TABULAR_LINES: usize = 3;

/// Heuristic figure/table pass over page texts.
///
/// Caption lines become the reference descriptions, deduplicated by number
/// across the document. A page that mentions a figure or table without any
/// caption line gets one generic reference. Never fails.
pub fn detect_structures(pages: &[PageText]) -> (Vec<Figure>, Vec<Table>) {
    let mut figures = Vec::new();
    let mut tables = Vec::new();
    let mut seen_figures = HashSet::new();
    let mut seen_tables = HashSet::new();

    for page in pages {
        let mut page_has_figure_caption = false;
        let mut page_has_table_caption = false;

        for line in page.text.lines() {
            if let Some(caps) = FIGURE_CAPTION.captures(line) {
                page_has_figure_caption = true;
                let number = caps[1].to_lowercase();
                if seen_figures.insert(number.clone()) {
                    figures.push(Figure {
                        page_number: page.page_number,
                        description: truncate(line.trim()),
                        data_ref: Some(format!("figure-{number}")),
                    });
                }
            } else if let Some(caps) = TABLE_CAPTION.captures(line) {
                page_has_table_caption = true;
                let number = caps[1].to_lowercase();
                if seen_tables.insert(number.clone()) {
                    tables.push(Table {
                        page_number: page.page_number,
                        description: truncate(line.trim()),
                        data_ref: Some(format!("table-{number}")),
                    });
                }
            }
        }

        if !page_has_figure_caption && FIGURE_KEYWORD.is_match(&page.text) {
            figures.push(Figure {
                page_number: page.page_number,
                description: format!("Figure reference on page {}", page.page_number),
                data_ref: None,
            });
        }

        if !page_has_table_caption {
            let tabular_lines = page.text.lines().filter(|l| is_tabular_line(l)).count();
            if TABLE_KEYWORD.is_match(&page.text) || tabular_lines >= MIN_TABULAR_LINES {
                tables.push(Table {
                    page_number: page.page_number,
                    description: format!("Table content on page {}", page.page_number),
                    data_ref: None,
                });
            }
        }
    }

    (figures, tables)
}

fn truncate(line: &str) -> String {
    if line.chars().count() <= MAX_DESCRIPTION_CHARS {
        line.to_string()
    } else {
        let cut: String = line.chars().take(MAX_DESCRIPTION_CHARS).collect();
        format!("{cut}…")
    }
}

/// Heuristic: a line looks tabular if it has multiple columns separated by
/// tabs, pipes, or consistent multi-space gaps.
///
/// Patterns detected:
/// - Tab-separated: "Model\tBLEU\tParams"
/// - Pipe-separated: "Model | BLEU | Params"
/// - Multi-space aligned: "Baseline    27.3    65M"
fn is_tabular_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() < 5 {
        return false;
    }

    if trimmed.matches('\t').count() >= 2 {
        return true;
    }

    if trimmed.matches('|').count() >= 2 {
        return true;
    }

    count_multi_space_gaps(trimmed) >= 2
}

/// Count runs of 3+ consecutive spaces that separate non-empty text segments.
fn count_multi_space_gaps(text: &str) -> usize {
    let mut count = 0;
    let mut in_gap = false;
    let mut gap_len = 0;

    for ch in text.chars() {
        if ch == ' ' {
            gap_len += 1;
            if gap_len >= 3 && !in_gap {
                in_gap = true;
                count += 1;
            }
        } else {
            in_gap = false;
            gap_len = 0;
        }
    }

    count
}

//! Vision OCR engine: recognizes text on a rendered page via an Ollama
//! vision model.
//!
//! Vision models return no per-word confidence, so the score is a heuristic
//! over the shape of the output.

use std::time::Duration;

use base64::Engine as _;

use super::types::{OcrEngine, OcrPageResult};
use super::ExtractionError;
use crate::pipeline::ollama::{ChatMessage, ChatRequest, ChatResponse, OllamaEndpoint, OllamaError};

const SYSTEM_PROMPT: &str = "\
You are a text extractor for scanned research papers. Transcribe ALL visible text \
from the page image exactly as written, in reading order. Keep section headings, \
paragraphs and table rows on separate lines. Do not summarize or comment.";

const USER_PROMPT: &str = "Transcribe the text on this page.";

/// Production OCR engine backed by an Ollama vision model.
pub struct OllamaVisionOcr {
    endpoint: OllamaEndpoint,
    model_name: String,
}

impl OllamaVisionOcr {
    pub fn new(base_url: &str, model_name: &str, timeout: Duration) -> Self {
        Self {
            endpoint: OllamaEndpoint::new(base_url, timeout),
            model_name: model_name.to_string(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl OcrEngine for OllamaVisionOcr {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let _span = tracing::info_span!(
            "vision_ocr",
            model = %self.model_name,
            image_size = image_bytes.len(),
        )
        .entered();
        let start = std::time::Instant::now();

        let request = ChatRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user",
                    content: USER_PROMPT,
                    images: vec![base64::engine::general_purpose::STANDARD.encode(image_bytes)],
                },
            ],
            stream: false,
        };

        let response: ChatResponse = self
            .endpoint
            .post_json("/api/chat", &request)
            .map_err(|e| match e {
                OllamaError::Timeout(secs) => ExtractionError::TimedOut {
                    stage: "OCR".into(),
                    secs,
                },
                other => ExtractionError::OcrFailed(format!("Vision OCR failed: {other}")),
            })?;

        let text = strip_code_fence(&response.message.content);
        let confidence = compute_heuristic_confidence(&text);

        tracing::info!(
            model = %self.model_name,
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = text.len(),
            confidence,
            "Vision OCR complete"
        );

        Ok(OcrPageResult { text, confidence })
    }
}

/// Models sometimes wrap the transcription in a Markdown code fence.
fn strip_code_fence(response: &str) -> String {
    let trimmed = response.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        let body = inner.split_once('\n').map_or("", |(_, rest)| rest);
        return body.trim_end().trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

/// Heuristic confidence from text length, with a small bonus for visible
/// structure (headings, table rows, lists). Capped at 0.95.
fn compute_heuristic_confidence(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }

    let len = text.len();
    let base: f32 = if len < 50 {
        0.2
    } else if len < 200 {
        0.4
    } else if len < 500 {
        0.6
    } else {
        0.8
    };

    let has_headers = text.lines().any(|l| l.starts_with('#'));
    let has_tables = text.lines().any(|l| l.matches('|').count() >= 2);
    let has_lists = text
        .lines()
        .any(|l| l.trim_start().starts_with("- ") || l.trim_start().starts_with("* "));

    let bonus: f32 = if has_headers { 0.05 } else { 0.0 }
        + if has_tables { 0.05 } else { 0.0 }
        + if has_lists { 0.03 } else { 0.0 };

    (base + bonus).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_scales_with_length() {
        assert_eq!(compute_heuristic_confidence(""), 0.0);
        assert_eq!(compute_heuristic_confidence("short"), 0.2);
        assert_eq!(compute_heuristic_confidence(&"a".repeat(120)), 0.4);
        assert_eq!(compute_heuristic_confidence(&"a".repeat(300)), 0.6);
        assert_eq!(compute_heuristic_confidence(&"a".repeat(800)), 0.8);
    }

    #[test]
    fn structure_adds_bonus_but_caps() {
        let text = format!("# Title\n| a | b |\n- item\n{}", "x".repeat(800));
        assert_eq!(compute_heuristic_confidence(&text), 0.93);
        let capped = format!("# T\n| a | b |\n- i\n* j\n{}", "x".repeat(5000));
        assert!(compute_heuristic_confidence(&capped) <= 0.95);
    }

    #[test]
    fn strips_markdown_fence() {
        assert_eq!(strip_code_fence("```text\nAbstract\nBody\n```"), "Abstract\nBody");
        assert_eq!(strip_code_fence("  plain  "), "plain");
    }

    #[test]
    fn unreachable_server_is_ocr_failure() {
        let engine = OllamaVisionOcr::new("http://127.0.0.1:9", "llava", Duration::from_secs(2));
        let err = engine.ocr_image(b"png").unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::OcrFailed(_) | ExtractionError::TimedOut { .. }
        ));
    }

    #[test]
    fn engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OllamaVisionOcr>();
        assert_eq!(
            OllamaVisionOcr::new("http://x", "llava", Duration::from_secs(1)).model_name(),
            "llava"
        );
    }
}

//! Content analysis adapter.
//!
//! Hands normalized text to an external summarization service. The service
//! is a black box: any failure comes back as a non-success response and the
//! orchestrator downgrades the attempt to partial success.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pipeline::ollama::{GenerateRequest, GenerateResponse, OllamaEndpoint, OllamaError};

/// Result of one summarization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub success: bool,
    pub summary: String,
    pub error: Option<String>,
}

impl AnalysisResponse {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Text-in, summary-out analysis service. Implementations block; the
/// orchestrator runs them on the blocking pool under a timeout.
pub trait ContentAnalyzer {
    fn summarize(&self, text: &str) -> AnalysisResponse;
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_for_analysis(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

static UNUSED_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

/// Strip model artifacts from a summary: `<think>` blocks, Gemma-style
/// `<unusedN>thought` prefixes and stray `<unusedN>` tokens.
pub fn sanitize_model_output(raw: &str) -> String {
    let mut text = THINK_BLOCK.replace_all(raw, "").into_owned();

    if let Some(idx) = text.find("<unused") {
        if let Some(thought_offset) = text[idx..].find("thought\n") {
            text = text[idx + thought_offset + "thought\n".len()..].to_string();
        }
    }

    UNUSED_TOKEN.replace_all(&text, "").trim().to_string()
}

// ──────────────────────────────────────────────
// Ollama analyzer
// ──────────────────────────────────────────────

const SYSTEM_PROMPT: &str = "\
You summarize research papers for a reading list. Write one concise paragraph \
covering the research question, the method and the main findings. Use only \
information present in the text. Do not add commentary.";

pub struct OllamaAnalyzer {
    endpoint: OllamaEndpoint,
    model_name: String,
}

impl OllamaAnalyzer {
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

impl ContentAnalyzer for OllamaAnalyzer {
    fn summarize(&self, text: &str) -> AnalysisResponse {
        let prompt = format!("Summarize the following paper.\n\n{text}");
        let request = GenerateRequest {
            model: &self.model_name,
            prompt: &prompt,
            system: SYSTEM_PROMPT,
            stream: false,
        };

        let start = std::time::Instant::now();
        let result: Result<GenerateResponse, OllamaError> =
            self.endpoint.post_json("/api/generate", &request);

        match result {
            Ok(response) => {
                let summary = sanitize_model_output(&response.response);
                tracing::info!(
                    model = %self.model_name,
                    elapsed_ms = %start.elapsed().as_millis(),
                    summary_len = summary.len(),
                    "Content analysis complete"
                );
                if summary.is_empty() {
                    AnalysisResponse::failed("analysis service returned an empty summary")
                } else {
                    AnalysisResponse::ok(summary)
                }
            }
            Err(e) => {
                tracing::warn!(model = %self.model_name, error = %e, "Content analysis failed");
                AnalysisResponse::failed(e.to_string())
            }
        }
    }
}

// ──────────────────────────────────────────────
// Mock analyzer
// ──────────────────────────────────────────────

/// Configurable analyzer for tests.
pub struct MockAnalyzer {
    response: AnalysisResponse,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_input: Mutex<Option<String>>,
}

impl MockAnalyzer {
    pub fn new(summary: &str) -> Self {
        Self::with_response(AnalysisResponse::ok(summary))
    }

    pub fn failing(error: &str) -> Self {
        Self::with_response(AnalysisResponse::failed(error))
    }

    fn with_response(response: AnalysisResponse) -> Self {
        Self {
            response,
            delay: None,
            calls: AtomicUsize::new(0),
            last_input: Mutex::new(None),
        }
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<String> {
        self.last_input.lock().ok().and_then(|g| g.clone())
    }
}

impl ContentAnalyzer for MockAnalyzer {
    fn summarize(&self, text: &str) -> AnalysisResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_input.lock() {
            *last = Some(text.to_string());
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.response.clone()
    }
}

//! Minimal blocking Ollama HTTP client shared by the vision OCR engine and
//! the content analyzer.
//!
//! Calls are made from `spawn_blocking` threads; the blocking client is
//! built per call so it is never created or dropped on an async worker.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Cannot connect to Ollama at {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Ollama returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed Ollama response: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

/// Endpoint + per-request timeout.
#[derive(Debug, Clone)]
pub struct OllamaEndpoint {
    base_url: String,
    timeout: Duration,
}

impl OllamaEndpoint {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body to `path` and decode the JSON response.
    pub fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, OllamaError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| OllamaError::HttpClient(e.to_string()))?;

        let url = format!("{}{path}", self.base_url);
        let response = client.post(&url).json(body).send().map_err(|e| {
            if e.is_connect() {
                OllamaError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                OllamaError::Timeout(self.timeout.as_secs())
            } else {
                OllamaError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OllamaError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))
    }
}

/// Message for `/api/chat`.
#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub content: String,
}

/// Request body for `/api/generate`.
#[derive(Debug, Serialize)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub system: &'a str,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

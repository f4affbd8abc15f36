//! Pipeline configuration.
//!
//! Defaults mirror the limits of the upload service this crate serves.
//! Every value can be overridden through `PAPER_INGEST_*` environment
//! variables, read once at composition time by `PipelineConfig::from_env`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::import::FormatKind;

/// Application-level constants
pub const APP_NAME: &str = "paper-ingest";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const MB: u64 = 1024 * 1024;

/// Environment variable prefix for all overrides.
const ENV_PREFIX: &str = "PAPER_INGEST_";

/// Default characters handed to the analysis service. The summarization
/// service truncates its prompt at this length anyway.
pub const DEFAULT_MAX_ANALYSIS_CHARS: usize = 32_000;

/// Is this a dev build? Dev builds log at debug level by default.
pub fn is_dev() -> bool {
    cfg!(debug_assertions)
}

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if is_dev() {
        "paper_ingest=debug,info"
    } else {
        "paper_ingest=info,warn"
    }
}

/// Application data directory (`~/.paper-ingest/`), used for the default
/// error-log database location.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".paper-ingest"))
}

/// Per-format upload size limits in bytes.
#[derive(Debug, Clone, Serialize)]
pub struct SizeLimits {
    pub pdf: u64,
    pub docx: u64,
    pub latex: u64,
    pub plain_text: u64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            pdf: 50 * MB,
            docx: 25 * MB,
            latex: 10 * MB,
            plain_text: 10 * MB,
        }
    }
}

impl SizeLimits {
    pub fn for_format(&self, kind: FormatKind) -> u64 {
        match kind {
            FormatKind::Pdf => self.pdf,
            FormatKind::Docx => self.docx,
            FormatKind::Latex => self.latex,
            FormatKind::PlainText => self.plain_text,
        }
    }
}

/// Runtime configuration of the extraction pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    /// Bounded wait for a single OCR engine call.
    #[serde(with = "duration_secs")]
    pub ocr_timeout: Duration,
    /// Bounded wait for the content analysis service.
    #[serde(with = "duration_secs")]
    pub analysis_timeout: Duration,
    /// Run the figure/table caption pass after PDF text extraction.
    pub detect_structures: bool,
    /// Maximum characters of extracted text sent to the analysis service.
    pub max_analysis_chars: usize,
    /// Ollama base URL used by the vision OCR engine and the analyzer.
    pub ollama_url: String,
    /// Vision model used for OCR. `None` disables the OCR fallback.
    pub ocr_model: Option<String>,
    /// Text model used for summarization. `None` disables analysis.
    pub analysis_model: Option<String>,
    /// Webhook receiving ERROR/CRITICAL diagnostic entries.
    pub monitoring_webhook: Option<String>,
    /// SQLite database holding the queryable error log.
    pub error_log_db: Option<PathBuf>,
    /// Append-only JSONL error log.
    pub error_log_jsonl: Option<PathBuf>,
    pub size_limits: SizeLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ocr_timeout: Duration::from_secs(60),
            analysis_timeout: Duration::from_secs(120),
            detect_structures: true,
            max_analysis_chars: DEFAULT_MAX_ANALYSIS_CHARS,
            ollama_url: "http://localhost:11434".into(),
            ocr_model: None,
            analysis_model: None,
            monitoring_webhook: None,
            error_log_db: app_data_dir().map(|d| d.join("error_log.db")),
            error_log_jsonl: None,
            size_limits: SizeLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Build a config from defaults plus `PAPER_INGEST_*` overrides.
    ///
    /// Unparseable numeric values are ignored with a warning; the default
    /// stays in effect.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Same as `from_env` but reads from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_u64(&lookup, "OCR_TIMEOUT_SECS") {
            config.ocr_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "ANALYSIS_TIMEOUT_SECS") {
            config.analysis_timeout = Duration::from_secs(secs);
        }
        if let Some(chars) = parse_u64(&lookup, "MAX_ANALYSIS_CHARS") {
            config.max_analysis_chars = chars as usize;
        }
        if let Some(flag) = lookup("DETECT_STRUCTURES") {
            config.detect_structures = !matches!(flag.trim(), "0" | "false" | "off" | "no");
        }
        if let Some(url) = lookup("OLLAMA_URL") {
            config.ollama_url = url;
        }
        config.ocr_model = lookup("OCR_MODEL").filter(|v| !v.trim().is_empty());
        config.analysis_model = lookup("ANALYSIS_MODEL").filter(|v| !v.trim().is_empty());
        config.monitoring_webhook = lookup("MONITORING_WEBHOOK").filter(|v| !v.trim().is_empty());
        if let Some(path) = lookup("ERROR_LOG_DB") {
            config.error_log_db = if path.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        config.error_log_jsonl = lookup("ERROR_LOG_JSONL")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(mb) = parse_u64(&lookup, "MAX_PDF_MB") {
            config.size_limits.pdf = mb * MB;
        }
        if let Some(mb) = parse_u64(&lookup, "MAX_DOCX_MB") {
            config.size_limits.docx = mb * MB;
        }
        if let Some(mb) = parse_u64(&lookup, "MAX_TEX_MB") {
            config.size_limits.latex = mb * MB;
        }
        if let Some(mb) = parse_u64(&lookup, "MAX_TXT_MB") {
            config.size_limits.plain_text = mb * MB;
        }

        config
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key = %format!("{ENV_PREFIX}{key}"), value = %raw, error = %e, "Ignoring invalid config value");
            None
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
